use std::fmt;
use std::io;

/// Errors returned by the reactor framework.
#[derive(Debug)]
pub enum Error {
    /// Socket or descriptor operation failed.
    Io(io::Error),
    /// A subordinate loop thread failed to start and report its handle.
    LoopStartup(String),
    /// The listen address could not be bound.
    Bind(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::LoopStartup(msg) => write!(f, "loop startup: {msg}"),
            Error::Bind(e) => write!(f, "bind: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience result alias for framework operations.
pub type Result<T> = std::result::Result<T, Error>;
