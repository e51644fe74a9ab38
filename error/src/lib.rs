//! Underlying error type used over the whole sluice workspace.
//!
//! Component crates keep their own error enums and convert them into
//! [`Error`], which pairs the concrete failure with an [`ErrorKind`] so an
//! embedder can dispatch on the category without matching every variant.

use std::fmt;

use thiserror::Error;

/// A list specifying categories of sluice error.
///
/// This list is intended to grow over time and it is not recommended to
/// exhaustively match against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid limits or an unusable script path; the sandbox never ran
    Config,
    /// A memory, instruction or output quota was exhausted
    Quota,
    /// The script failed, returned the wrong shape, or is missing an entry point
    Script,
    /// A host callback reported failure
    Host,
    /// Preserving or restoring global state failed
    Persistence,
    /// Unexpected internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "Config",
            ErrorKind::Quota => "Quota",
            ErrorKind::Script => "Script",
            ErrorKind::Host => "Host",
            ErrorKind::Persistence => "Persistence",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// The top-level error type.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    /// Wraps a concrete failure under the given kind.
    pub fn new<E>(kind: ErrorKind, inner: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Error {
            kind,
            inner: inner.into(),
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Downcast to the concrete error that produced this.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.inner.downcast_ref()
    }

    /// The failure text without the kind prefix.
    pub fn reason(&self) -> String {
        self.inner.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// An error with only a string as the reason.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct OtherError(String);

impl OtherError {
    /// Creates an error with only a string as the reason.
    pub fn new<T>(reason: T) -> Self
    where
        T: fmt::Display,
    {
        OtherError(reason.to_string())
    }
}

impl From<OtherError> for Error {
    fn from(error: OtherError) -> Self {
        Error::new(ErrorKind::Internal, error)
    }
}
