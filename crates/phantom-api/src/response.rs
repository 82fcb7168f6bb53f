//! Response envelope.

use chrono::{DateTime, SecondsFormat, Utc};
use phantom_core::PhantomError;
use serde::Serialize;
use serde_json::Value;

/// Version reported in every response.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Always-present response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Module the action belonged to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Action name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// HTTP-equivalent status: 200 on success.
    pub status: u16,
    /// UTC time the response was produced, RFC 3339 with a `Z` suffix.
    pub timestamp: String,
    /// [`API_VERSION`].
    pub version: &'static str,
}

impl Metadata {
    /// Metadata for `module.action` at `now`.
    #[must_use]
    pub fn new(module: Option<&str>, action: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            module: module.map(str::to_string),
            action: action.map(str::to_string),
            status: 200,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            version: API_VERSION,
        }
    }
}

/// Outcome of one action.
///
/// On success `data` holds the action's result. On failure `error` and
/// `code` are set and `data` carries the error's structured details, if
/// it has any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T = Value> {
    /// Whether the action succeeded.
    pub success: bool,
    /// Result, or error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    /// Module, action, status, time and version.
    pub metadata: Metadata,
}

impl<T> Response<T> {
    /// Successful response.
    #[must_use]
    pub fn ok(data: T, metadata: Metadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            metadata,
        }
    }

    /// Failed response built from `err`.
    #[must_use]
    pub fn failure(err: &PhantomError, mut metadata: Metadata) -> Self
    where
        T: From<Value>,
    {
        metadata.status = err.status();
        Self {
            success: false,
            data: err.details().cloned().map(T::from),
            error: Some(err.to_string()),
            code: Some(err.code()),
            metadata,
        }
    }

    /// HTTP-equivalent status.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.metadata.status
    }
}

impl Response {
    /// Serializes a typed result into a JSON response, reporting a
    /// serialization failure as an internal error.
    #[must_use]
    pub fn from_result<T: Serialize>(
        result: Result<T, PhantomError>,
        metadata: Metadata,
    ) -> Self {
        match result.and_then(|data| serde_json::to_value(data).map_err(PhantomError::from)) {
            Ok(data) => Self::ok(data, metadata),
            Err(err) => Self::failure(&err, metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> Metadata {
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        Metadata::new(Some("core"), Some("add_client"), now)
    }

    #[test]
    fn success_envelope_omits_error_fields() {
        let response = Response::from_result(Ok(json!({"removed": true})), meta());
        let wire = serde_json::to_value(&response).expect("serialize");
        assert_eq!(
            wire,
            json!({
                "success": true,
                "data": {"removed": true},
                "metadata": {
                    "module": "core",
                    "action": "add_client",
                    "status": 200,
                    "timestamp": "2023-11-14T22:13:20Z",
                    "version": API_VERSION,
                }
            })
        );
    }

    #[test]
    fn failure_carries_code_status_and_details() {
        let err = PhantomError::validation_with("blocked", json!({"multihop": true}));
        let response: Response = Response::failure(&err, meta());
        assert!(!response.success);
        assert_eq!(response.code, Some("VALIDATION_ERROR"));
        assert_eq!(response.error.as_deref(), Some("blocked"));
        assert_eq!(response.status(), 400);
        assert_eq!(response.data, Some(json!({"multihop": true})));

        let err = PhantomError::ClientExists("alice".to_string());
        let response: Response = Response::failure(&err, meta());
        assert_eq!(response.status(), 409);
        assert!(response.data.is_none());
    }
}
