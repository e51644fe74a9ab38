//! A quota-enforced Lua sandbox for streaming-telemetry plugins.
//!
//! Each [`Sandbox`] runs one untrusted plugin script under strict memory,
//! instruction and output quotas, exposes a restricted script API conditioned
//! on the plugin type, and can persist its mutable global state to a file and
//! restore it in a fresh instance after a host restart.
//!
//! The embedder drives the sandbox through a small surface: [`Sandbox::create`],
//! [`Sandbox::init`], repeated [`Sandbox::process_message`] /
//! [`Sandbox::timer_event`] dispatches, and [`Sandbox::destroy`]. Everything
//! the script needs from the pipeline goes through the
//! [`PipelineHost`](sluice_traits::PipelineHost) callbacks handed over at
//! creation time.

mod config;
mod context;
mod error;
mod sandbox;
mod serialize;
mod stdlib;
mod syscalls;
mod usage;

#[cfg(test)]
mod tests;

pub use crate::config::{PluginType, SandboxConfig};
pub use crate::error::SandboxError;
pub use crate::sandbox::{Sandbox, MAX_INSTRUCTIONS, MAX_MEMORY, MAX_OUTPUT};
pub use crate::usage::{Status, UsageStat, UsageType};
pub use sluice_error::{Error, ErrorKind};
