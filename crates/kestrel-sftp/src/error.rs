//! Error types for the SFTP protocol engine

use thiserror::Error;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// SFTP engine error types
///
/// Malformed frames and version mismatches are fatal to the connection;
/// per-request filesystem failures never surface here, they are translated
/// into STATUS replies by the session instead.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the underlying byte stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or field (bad UTF-8, frame boundary violation,
    /// attribute mask mismatch, ...)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Client requested a protocol version below the minimum we speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// The peer (or our writer flow) is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a malformed-packet error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::protocol("read past frame boundary").to_string(),
            "protocol error: read past frame boundary"
        );
        assert_eq!(
            Error::UnsupportedVersion(3).to_string(),
            "unsupported protocol version 3"
        );
    }
}
