//! Error types for Strata.

use std::fmt;
use std::sync::Arc;

/// The main error type for Strata operations.
///
/// Errors are cheap to clone: a group-commit leader hands the same outcome
/// to every writer it absorbed, and a sticky background failure is handed
/// to every later write.
#[derive(Debug, Clone)]
pub enum Error {
    /// I/O error
    Io(Arc<std::io::Error>),

    /// Checksum or format violation in a log, manifest or table file
    Corruption(String),

    /// Bad options, bad range or conflicting open flags
    InvalidArgument(String),

    /// A background flush or compaction failed earlier; the engine refuses
    /// further writes until it is reopened
    Background(String),

    /// Serialization/deserialization error
    Serialization(String),

    /// The engine is shutting down
    ShuttingDown,
}

impl Error {
    /// Returns true for [`Error::Corruption`].
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Returns true for [`Error::Io`].
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Background(msg) => write!(f, "Background error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// A specialized `Result` type for Strata operations.
pub type Result<T> = std::result::Result<T, Error>;
