//! Deserializable sandbox configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sandbox::{MAX_INSTRUCTIONS, MAX_MEMORY, MAX_OUTPUT};

/// Pipeline role of the plugin a sandbox runs, which decides the script API
/// it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Produces messages; may inject but never reads one.
    Input,
    /// Consumes messages; reads but never injects.
    Output,
    /// Transforms the message stream.
    #[default]
    Filter,
    /// Parses raw payloads into messages; may rewrite the message.
    Decoder,
    /// Renders messages for an output; may rewrite the message.
    Encoder,
}

impl PluginType {
    /// Types whose scripts stage textual payloads with `add_to_payload` and
    /// hand them over with `inject_payload`.
    pub(crate) fn stages_payloads(self) -> bool {
        matches!(
            self,
            PluginType::Filter | PluginType::Decoder | PluginType::Encoder
        )
    }

    /// Types whose scripts may read the message under processing.
    pub(crate) fn reads_messages(self) -> bool {
        !matches!(self, PluginType::Input)
    }

    /// Types whose scripts may rewrite the message under processing.
    pub(crate) fn writes_messages(self) -> bool {
        matches!(self, PluginType::Decoder | PluginType::Encoder)
    }

    /// Types whose scripts may inject messages into the pipeline.
    pub(crate) fn injects_messages(self) -> bool {
        !matches!(self, PluginType::Output)
    }
}

fn default_memory_limit() -> u64 {
    MAX_MEMORY
}

fn default_instruction_limit() -> u64 {
    MAX_INSTRUCTIONS
}

fn default_output_limit() -> u64 {
    MAX_OUTPUT
}

/// Everything needed to stand up one sandbox.
///
/// Limits default to their ceilings; the plugin type defaults to `filter`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Path of the plugin script.
    pub script_path: PathBuf,
    /// Interpreter heap quota in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
    /// Per-dispatch instruction quota.
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u64,
    /// Output buffer quota in bytes.
    #[serde(default = "default_output_limit")]
    pub output_limit: u64,
    /// Pipeline role of the plugin.
    #[serde(default)]
    pub plugin_type: PluginType,
    /// Where global state is preserved across restarts; `None` disables
    /// preservation.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}
