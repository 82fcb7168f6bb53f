//! Error types for WireGuard key and configuration handling.

use thiserror::Error;

/// Errors that can occur while handling WireGuard keys and configuration.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid `host:port` endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Configuration text could not be parsed.
    #[error("line {line}: {message}")]
    ParseError {
        /// 1-based line number, 0 when the problem is not tied to a line.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Configuration is syntactically valid but incomplete.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, WireGuardError>;
