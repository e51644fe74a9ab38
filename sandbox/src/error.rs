//! Sandbox-level errors and their mapping into the shared taxonomy.

use sluice_error::{Error, ErrorKind};
use thiserror::Error as ThisError;

/// Failures surfaced by the sandbox host.
#[derive(Debug, ThisError)]
pub enum SandboxError {
    /// A configured limit exceeds its hard ceiling.
    #[error("the {0} limit exceeds its ceiling")]
    LimitCeiling(&'static str),
    /// The script file could not be read.
    #[error("{0}")]
    BadScript(String),
    /// The sandbox is not in the `Running` state.
    #[error("sandbox is not running")]
    NotRunning,
    /// A quota was exhausted during a dispatch.
    #[error("{0}")]
    Quota(String),
    /// The script failed, is missing an entry point, or returned the wrong
    /// shape.
    #[error("{0}")]
    Script(String),
    /// Restoring preserved state failed.
    #[error("{0}")]
    Restore(String),
    /// Preserving global state failed.
    #[error("preserve_global_data {0}")]
    Preserve(String),
    /// Interpreter-level failure outside script execution.
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl From<SandboxError> for Error {
    fn from(error: SandboxError) -> Self {
        let kind = match &error {
            SandboxError::LimitCeiling(_) | SandboxError::BadScript(_) => ErrorKind::Config,
            SandboxError::NotRunning | SandboxError::Script(_) => ErrorKind::Script,
            SandboxError::Quota(_) => ErrorKind::Quota,
            SandboxError::Restore(_) | SandboxError::Preserve(_) => ErrorKind::Persistence,
            SandboxError::Lua(_) => ErrorKind::Internal,
        };
        Error::new(kind, error)
    }
}
