//! Wire codec between script tables and pipeline messages.
//!
//! Encoding walks a script table once, emitting fields 1..10 in their fixed
//! wire order into the sandbox's shared output buffer. Sub-message lengths
//! are back-patched: a one-byte placeholder is written up front and the tail
//! is shifted right in the rare case the final varint needs more room.
//!
//! Layout: `1 Uuid (16 bytes)`, `2 Timestamp (varint ns)`, `3 Type`,
//! `4 Logger`, `5 Severity (varint)`, `6 Payload`, `7 EnvVersion`,
//! `8 Pid (varint)`, `9 Hostname`, `10 Fields (repeated sub-message)`.
//! Each `Fields` entry: `1 name`, `2 value-type (0 string / 3 double /
//! 4 bool)`, `3 representation`, `4 string values`, `7 double values
//! (fixed64 LE)`, `8 bool values`.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use mlua::{Table, Value};
use sluice_output_buffer::{OutputBuffer, OutputError};
use thiserror::Error;

mod decode;

pub use decode::{decode_message, DecodeError};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;

/// Reasons a script table cannot be encoded.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The output buffer refused to grow.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// A value array mixed scalar types.
    #[error("array has mixed types")]
    MixedArray,
    /// A `Fields` entry was not a table.
    #[error("each field entry must be a table")]
    FieldEntry,
    /// A `Fields` entry had no string `name`.
    #[error("field name must be a string")]
    FieldName,
    /// A field value was not a string, number, boolean or array thereof.
    #[error("unsupported field value type '{0}'")]
    Unsupported(&'static str),
    /// Reading the table failed.
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

fn encode_varint(buf: &mut [u8; 10], mut value: u64) -> usize {
    let mut count = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[count] = byte;
            return count + 1;
        }
        buf[count] = byte | 0x80;
        count += 1;
    }
}

fn write_varint(out: &mut OutputBuffer, value: u64) -> Result<(), OutputError> {
    let mut buf = [0u8; 10];
    let count = encode_varint(&mut buf, value);
    out.push_bytes(&buf[..count])
}

fn write_tag(out: &mut OutputBuffer, id: u8, wire: u8) -> Result<(), OutputError> {
    out.push_byte((id << 3) | wire)
}

fn write_bytes_field(out: &mut OutputBuffer, id: u8, bytes: &[u8]) -> Result<(), OutputError> {
    write_tag(out, id, WIRE_LEN)?;
    write_varint(out, bytes.len() as u64)?;
    out.push_bytes(bytes)
}

fn write_double(out: &mut OutputBuffer, value: f64) -> Result<(), OutputError> {
    let mut buf = [0u8; 8];
    LittleEndian::write_f64(&mut buf, value);
    out.push_bytes(&buf)
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

fn write_uuid(out: &mut OutputBuffer) -> Result<(), OutputError> {
    write_tag(out, 1, WIRE_LEN)?;
    write_varint(out, 16)?;
    let mut uuid: [u8; 16] = rand::random();
    uuid[6] = (uuid[6] & 0x0f) | 0x40;
    uuid[8] = (uuid[8] & 0x3f) | 0x80;
    out.push_bytes(&uuid)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) => Some(*n as i64),
        _ => None,
    }
}

/// Encodes the recognized keys of `msg` as a wire message into `out`.
///
/// The buffer is reset first; a fresh random v4 UUID is generated and
/// `Timestamp` defaults to the current wall clock when the table does not
/// carry one.
pub fn encode_message(msg: &Table, out: &mut OutputBuffer) -> Result<(), EncodeError> {
    out.clear();
    write_uuid(out)?;
    let timestamp = as_integer(&msg.get::<Value>("Timestamp")?).unwrap_or_else(now_ns);
    write_tag(out, 2, WIRE_VARINT)?;
    write_varint(out, timestamp as u64)?;
    encode_string(msg, out, 3, "Type")?;
    encode_string(msg, out, 4, "Logger")?;
    encode_int(msg, out, 5, "Severity")?;
    encode_string(msg, out, 6, "Payload")?;
    encode_string(msg, out, 7, "EnvVersion")?;
    encode_int(msg, out, 8, "Pid")?;
    encode_string(msg, out, 9, "Hostname")?;
    encode_fields(msg, out, 10, "Fields")?;
    Ok(())
}

fn encode_string(msg: &Table, out: &mut OutputBuffer, id: u8, name: &str) -> Result<(), EncodeError> {
    if let Value::String(s) = msg.get::<Value>(name)? {
        write_bytes_field(out, id, &s.as_bytes())?;
    }
    Ok(())
}

fn encode_int(msg: &Table, out: &mut OutputBuffer, id: u8, name: &str) -> Result<(), EncodeError> {
    if let Some(i) = as_integer(&msg.get::<Value>(name)?) {
        write_tag(out, id, WIRE_VARINT)?;
        write_varint(out, i as u64)?;
    }
    Ok(())
}

/// Rewrites the one-byte length placeholder at `len_pos` with the real
/// length, shifting the tail when the varint needs more than one byte.
fn patch_length(out: &mut OutputBuffer, len_pos: usize) -> Result<(), EncodeError> {
    let len = out.len() - len_pos - 1;
    if len < 0x80 {
        out.patch(len_pos, &[len as u8]);
        return Ok(());
    }
    let mut buf = [0u8; 10];
    let count = encode_varint(&mut buf, len as u64);
    out.open_gap(len_pos + 1, count - 1)?;
    out.patch(len_pos, &buf[..count]);
    Ok(())
}

fn scalar_kind(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(_) => Some("string"),
        Value::Integer(_) | Value::Number(_) => Some("number"),
        Value::Boolean(_) => Some("boolean"),
        _ => None,
    }
}

fn encode_field_value(
    out: &mut OutputBuffer,
    value: &Value,
    first: bool,
    representation: Option<&mlua::String>,
) -> Result<(), EncodeError> {
    match value {
        Value::String(s) => {
            // the string value type is the wire default and stays implicit
            if first {
                if let Some(r) = representation {
                    write_bytes_field(out, 3, &r.as_bytes())?;
                }
            }
            write_bytes_field(out, 4, &s.as_bytes())?;
        }
        Value::Integer(_) | Value::Number(_) => {
            if first {
                write_tag(out, 2, WIRE_VARINT)?;
                write_varint(out, 3)?;
                if let Some(r) = representation {
                    write_bytes_field(out, 3, &r.as_bytes())?;
                }
            }
            write_tag(out, 7, WIRE_FIXED64)?;
            write_double(out, as_number(value).unwrap_or_default())?;
        }
        Value::Boolean(b) => {
            if first {
                write_tag(out, 2, WIRE_VARINT)?;
                write_varint(out, 4)?;
                if let Some(r) = representation {
                    write_bytes_field(out, 3, &r.as_bytes())?;
                }
            }
            write_tag(out, 8, WIRE_VARINT)?;
            write_varint(out, u64::from(*b))?;
        }
        Value::Table(values) => {
            let mut expected = None;
            let mut first_element = first;
            for element in values.clone().sequence_values::<Value>() {
                let element = element?;
                let kind = scalar_kind(&element)
                    .ok_or_else(|| EncodeError::Unsupported(element.type_name()))?;
                match expected {
                    None => expected = Some(kind),
                    Some(seen) if seen != kind => return Err(EncodeError::MixedArray),
                    _ => {}
                }
                encode_field_value(out, &element, first_element, representation)?;
                first_element = false;
            }
        }
        other => return Err(EncodeError::Unsupported(other.type_name())),
    }
    Ok(())
}

fn encode_fields(msg: &Table, out: &mut OutputBuffer, id: u8, name: &str) -> Result<(), EncodeError> {
    let fields = match msg.get::<Value>(name)? {
        Value::Table(t) => t,
        _ => return Ok(()),
    };
    for entry in fields.sequence_values::<Value>() {
        let entry = match entry? {
            Value::Table(t) => t,
            _ => return Err(EncodeError::FieldEntry),
        };
        write_tag(out, id, WIRE_LEN)?;
        let len_pos = out.len();
        out.push_byte(0)?; // placeholder, patched below
        let field_name = match entry.get::<Value>("name")? {
            Value::String(s) => s,
            _ => return Err(EncodeError::FieldName),
        };
        write_bytes_field(out, 1, &field_name.as_bytes())?;
        let representation = match entry.get::<Value>("representation")? {
            Value::String(s) => Some(s),
            _ => None,
        };
        let value = entry.get::<Value>("value")?;
        encode_field_value(out, &value, true, representation.as_ref())?;
        patch_length(out, len_pos)?;
    }
    Ok(())
}
