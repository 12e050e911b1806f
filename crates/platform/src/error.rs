//! Error types for Tether

use std::fmt;

/// Error type shared by the low-level Tether components
#[derive(Debug)]
pub enum TetherError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed or unexpected data on the wire)
    Protocol(String),

    /// Security error (bad signature, MAC mismatch, rejected key)
    Security(String),

    /// Feature or algorithm not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TetherError {
    /// Creates a protocol error from anything printable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        TetherError::Protocol(msg.into())
    }

    /// Creates a security error from anything printable.
    pub fn security(msg: impl Into<String>) -> Self {
        TetherError::Security(msg.into())
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TetherError::Io(e) => write!(f, "IO error: {}", e),
            TetherError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TetherError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TetherError::Security(msg) => write!(f, "Security error: {}", msg),
            TetherError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            TetherError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for TetherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TetherError::Io(e) => Some(e),
            TetherError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io(err)
    }
}

/// Result type for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;
