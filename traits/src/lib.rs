//! Host-side interfaces consumed by the sandbox.
//!
//! The sandbox never touches the pipeline directly; everything it needs from
//! the embedder — plugin configuration, the message under processing, and
//! message injection — goes through [`PipelineHost`]. The pipeline implements
//! this trait and hands the sandbox a boxed instance at creation time.

use thiserror::Error;

/// A plugin configuration value surfaced by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A string setting.
    String(String),
    /// A numeric setting.
    Double(f64),
    /// A boolean setting.
    Bool(bool),
}

/// A single value read out of the current message.
///
/// String data is carried as raw bytes; message payloads are not required to
/// be valid UTF-8. Integer width concerns (`Pid` and `Severity` are 32-bit on
/// the wire) stay on the host side of this boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// String or byte data.
    Bytes(Vec<u8>),
    /// An integer field.
    Int(i64),
    /// A floating point field.
    Double(f64),
    /// A boolean field.
    Bool(bool),
}

/// One dynamic message field yielded by host-side iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageField {
    /// Field name.
    pub name: String,
    /// The first value stored under the name.
    pub value: FieldValue,
    /// Freeform representation hint, e.g. `"ms"`; empty when unset.
    pub representation: String,
    /// Number of values stored under the name.
    pub count: usize,
}

/// A value written into the current message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteValue<'a> {
    /// Set a string value.
    Str(&'a str),
    /// Set a numeric value.
    Double(f64),
    /// Set a boolean value.
    Bool(bool),
    /// Delete the addressed field, or a single entry of it when an array
    /// index was supplied.
    Nil,
}

/// Reasons a [`PipelineHost::write_message`] call is refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The field name does not address a writable field.
    #[error("invalid field name")]
    InvalidName,
    /// The value type does not match the addressed field.
    #[error("value type mismatch")]
    TypeMismatch,
    /// The field or array index is out of range.
    #[error("index out of range")]
    BadIndex,
}

/// Reasons a [`PipelineHost::inject_message`] call is refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InjectError {
    /// The payload could not be unmarshaled as a message.
    #[error("could not unmarshal the message")]
    Unmarshal,
    /// The plugin exceeded its injection rate.
    #[error("exceeded the injection rate limit")]
    RateLimited,
    /// The message exceeded the pipeline loop count.
    #[error("exceeded MaxMsgLoops")]
    LoopLimit,
    /// The injection would route the message back to this plugin.
    #[error("attempted to create a routing loop")]
    RoutingLoop,
    /// The pipeline is shutting down.
    #[error("aborted")]
    Aborted,
}

/// The narrow set of operations a sandbox may perform against its embedder.
///
/// All calls are made from the thread currently driving the sandbox; no
/// internal synchronization is expected of implementors.
pub trait PipelineHost: Send {
    /// Looks up a plugin configuration setting.
    fn read_config(&self, name: &str) -> Option<ConfigValue>;

    /// Reads one value from the current message.
    ///
    /// `field_index` selects among several fields sharing a name and
    /// `array_index` selects within a value array; both are zero for the
    /// common single-value case. `None` means the field does not exist.
    fn read_message(&self, field: &str, field_index: usize, array_index: usize)
        -> Option<FieldValue>;

    /// Advances the host-side iterator over the current message's dynamic
    /// fields. `None` marks the end of the iteration.
    fn read_next_field(&mut self) -> Option<MessageField>;

    /// Writes one value into the current message.
    ///
    /// A [`WriteValue::Nil`] with `has_array_index` set deletes a single
    /// array entry; without it the whole field is removed.
    fn write_message(
        &mut self,
        field: &str,
        value: WriteValue<'_>,
        representation: &str,
        field_index: usize,
        array_index: usize,
        has_array_index: bool,
    ) -> Result<(), WriteError>;

    /// Hands a finished payload back to the pipeline for routing.
    ///
    /// `msg_type` and `name` qualify textual payloads and are empty for
    /// wire-encoded messages.
    fn inject_message(
        &mut self,
        payload: &[u8],
        msg_type: &str,
        name: &str,
    ) -> Result<(), InjectError>;
}
