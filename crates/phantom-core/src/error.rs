//! Error taxonomy shared by every Phantom-WG module.
//!
//! Each variant maps to a stable wire code and an HTTP-equivalent status
//! which the action dispatcher puts in its response envelope.

use phantom_system::fs::FsError;
use phantom_system::ExecError;
use phantom_wireguard::WireGuardError;
use serde_json::Value;
use thiserror::Error;

/// Result alias for Phantom-WG operations.
pub type Result<T> = std::result::Result<T, PhantomError>;

/// Errors surfaced by module actions.
#[derive(Debug, Error)]
pub enum PhantomError {
    /// A required parameter was not supplied.
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// A parameter or precondition failed validation.
    #[error("{message}")]
    Validation {
        /// Human-readable reason.
        message: String,
        /// Structured context (failed checks, blockers).
        details: Option<Value>,
    },

    /// Client name does not match the allowed pattern.
    #[error("{0}")]
    InvalidClientName(String),

    /// A client with this name already exists.
    #[error("Client '{0}' already exists")]
    ClientExists(String),

    /// No client with this name.
    #[error("Client '{0}' not found")]
    ClientNotFound(String),

    /// The subnet has no free host address.
    #[error("{0}")]
    IpAllocation(String),

    /// An upstream exit config is malformed or conflicts.
    #[error("{0}")]
    VpnConfig(String),

    /// The named exit does not exist or cannot be used.
    #[error("{0}")]
    ExitNode(String),

    /// Ghost mode setup or teardown failed.
    #[error("{0}")]
    GhostMode(String),

    /// Ghost mode is already enabled.
    #[error("Ghost Mode is already active")]
    GhostModeActive {
        /// Current connection data.
        details: Value,
    },

    /// Multihop setup or teardown failed.
    #[error("{message}")]
    Multihop {
        /// Human-readable reason.
        message: String,
        /// Structured context.
        details: Option<Value>,
    },

    /// Subnet or routing change failed.
    #[error("{message}")]
    Network {
        /// Human-readable reason.
        message: String,
        /// Structured context, e.g. rollback outcome.
        details: Option<Value>,
    },

    /// On-disk configuration is missing or unreadable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A system service or tool failed.
    #[error("{0}")]
    ServiceOperation(String),

    /// Unknown module or action.
    #[error("{0}")]
    UnknownAction(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PhantomError {
    /// Validation failure without details.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    /// Validation failure with structured details.
    pub fn validation_with(message: impl Into<String>, details: Value) -> Self {
        Self::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Multihop failure without details.
    pub fn multihop(message: impl Into<String>) -> Self {
        Self::Multihop {
            message: message.into(),
            details: None,
        }
    }

    /// Network failure without details.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            details: None,
        }
    }

    /// Stable wire code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingParameter(_) => "MISSING_PARAMETER",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidClientName(_) => "INVALID_CLIENT_NAME",
            Self::ClientExists(_) => "CLIENT_EXISTS",
            Self::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            Self::IpAllocation(_) => "IP_ALLOCATION_ERROR",
            Self::VpnConfig(_) => "VPN_CONFIG_ERROR",
            Self::ExitNode(_) => "EXIT_NODE_ERROR",
            Self::GhostMode(_) => "GHOST_MODE_ERROR",
            Self::GhostModeActive { .. } => "GHOST_MODE_ACTIVE",
            Self::Multihop { .. } => "MULTIHOP_ERROR",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ServiceOperation(_) => "SERVICE_OPERATION_FAILED",
            Self::UnknownAction(_) => "UNKNOWN_ACTION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-equivalent status.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::MissingParameter(_)
            | Self::Validation { .. }
            | Self::InvalidClientName(_)
            | Self::VpnConfig(_) => 400,
            Self::ClientNotFound(_) | Self::ExitNode(_) | Self::UnknownAction(_) => 404,
            Self::ClientExists(_) | Self::GhostModeActive { .. } => 409,
            Self::IpAllocation(_)
            | Self::GhostMode(_)
            | Self::Multihop { .. }
            | Self::Network { .. }
            | Self::Config(_)
            | Self::ServiceOperation(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Structured context, if any.
    #[must_use]
    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Validation { details, .. }
            | Self::Multihop { details, .. }
            | Self::Network { details, .. } => details.as_ref(),
            Self::GhostModeActive { details } => Some(details),
            _ => None,
        }
    }
}

impl From<ExecError> for PhantomError {
    fn from(err: ExecError) -> Self {
        Self::ServiceOperation(err.to_string())
    }
}

impl From<FsError> for PhantomError {
    fn from(err: FsError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<WireGuardError> for PhantomError {
    fn from(err: WireGuardError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PhantomError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_exists_display_and_code() {
        let err = PhantomError::ClientExists("alice".to_string());
        assert_eq!(err.to_string(), "Client 'alice' already exists");
        assert_eq!(err.code(), "CLIENT_EXISTS");
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn missing_parameter_display() {
        let err = PhantomError::MissingParameter("client_name".to_string());
        assert_eq!(err.to_string(), "Missing required parameter: client_name");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn details_are_exposed() {
        let err = PhantomError::validation_with("blocked", json!({"multihop": true}));
        assert_eq!(err.details(), Some(&json!({"multihop": true})));
        assert!(PhantomError::network("down").details().is_none());
    }

    #[test]
    fn codes_are_distinct() {
        let all = [
            PhantomError::MissingParameter(String::new()),
            PhantomError::validation(""),
            PhantomError::InvalidClientName(String::new()),
            PhantomError::ClientExists(String::new()),
            PhantomError::ClientNotFound(String::new()),
            PhantomError::IpAllocation(String::new()),
            PhantomError::VpnConfig(String::new()),
            PhantomError::ExitNode(String::new()),
            PhantomError::GhostMode(String::new()),
            PhantomError::GhostModeActive { details: Value::Null },
            PhantomError::multihop(""),
            PhantomError::network(""),
            PhantomError::Config(String::new()),
            PhantomError::ServiceOperation(String::new()),
            PhantomError::UnknownAction(String::new()),
            PhantomError::Internal(String::new()),
        ];
        let mut codes: Vec<_> = all.iter().map(PhantomError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(all.iter().all(|e| (400..600).contains(&e.status())));
    }

    #[test]
    fn exec_error_becomes_service_failure() {
        let err: PhantomError = ExecError::NonZeroExit {
            command: "wg set".to_string(),
            exit_code: 1,
            stderr: "no such device".to_string(),
        }
        .into();
        assert_eq!(err.code(), "SERVICE_OPERATION_FAILED");
    }
}
