//! CLI error types.

use std::process::ExitCode;

use phantom_core::PhantomError;
use thiserror::Error;

/// Errors raised by the CLI itself.
#[derive(Debug, Error)]
pub enum CliError {
    /// The invocation is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Writing output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A long-running command failed.
    #[error(transparent)]
    Action(#[from] PhantomError),
}

impl CliError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit 0.
    Success,
    /// The action ran and failed. Exit 1.
    Failed,
    /// The module or action does not exist. Exit 2.
    Invalid,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::SUCCESS,
            Outcome::Failed => Self::from(1),
            Outcome::Invalid => Self::from(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_arguments_exit_with_two() {
        let err = CliError::InvalidArgument("missing '=' in 'foo'".into());
        assert_eq!(err.to_string(), "invalid argument: missing '=' in 'foo'");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn action_errors_pass_through() {
        let err = CliError::from(PhantomError::multihop("VPN connection test failed"));
        assert_eq!(err.to_string(), "VPN connection test failed");
        assert_eq!(err.exit_code(), 1);
    }
}
