//! Application-level error taxonomy returned to callers as `{code, message}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error code.
///
/// Serialized as a kebab-case string (`"missing-service"`). Hooks may raise
/// codes outside the built-in set with [`ErrorCode::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// No service registered under the requested name.
    MissingService,

    /// The service has no method with the requested name.
    MissingMethod,

    /// A hook required an authenticated connection.
    NotAuthenticated,

    /// The connection's session is gone (expired or transferred away).
    SessionExpired,

    /// Arguments could not be decoded or were otherwise invalid.
    BadRequest,

    /// Uncaught fault from a method body.
    UnknownError,

    /// Any other code raised by application hooks.
    Custom(String),
}

impl ErrorCode {
    /// Returns the wire form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::MissingService => "missing-service",
            Self::MissingMethod => "missing-method",
            Self::NotAuthenticated => "not-authenticated",
            Self::SessionExpired => "session-expired",
            Self::BadRequest => "bad-request",
            Self::UnknownError => "unknown-error",
            Self::Custom(code) => code,
        }
    }

    /// Returns true for codes raised by authentication hooks.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::SessionExpired)
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "missing-service" => Self::MissingService,
            "missing-method" => Self::MissingMethod,
            "not-authenticated" => Self::NotAuthenticated,
            "session-expired" => Self::SessionExpired,
            "bad-request" => Self::BadRequest,
            "unknown-error" => Self::UnknownError,
            _ => Self::Custom(s),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by hooks, methods and the dispatcher.
///
/// This is the only error shape a caller ever sees for a failed call; the
/// transport stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn missing_service(name: &str) -> Self {
        Self::new(
            ErrorCode::MissingService,
            format!("there is no service named '{name}'"),
        )
    }

    pub fn missing_method(service: &str, action: &str) -> Self {
        Self::new(
            ErrorCode::MissingMethod,
            format!("there is no method named '{action}' for service '{service}'"),
        )
    }

    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAuthenticated, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionExpired, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Wraps any displayable fault as `unknown-error`.
    pub fn unknown<E: fmt::Display>(err: E) -> Self {
        Self::new(ErrorCode::UnknownError, err.to_string())
    }

    /// Creates an error with an application-specific code.
    pub fn custom(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::from(code.into()), message)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(err.to_string())
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::MissingService).unwrap();
        assert_eq!(json, "\"missing-service\"");

        let parsed: ErrorCode = serde_json::from_str("\"session-expired\"").unwrap();
        assert_eq!(parsed, ErrorCode::SessionExpired);
    }

    #[test]
    fn test_custom_code_preserved() {
        let parsed: ErrorCode = serde_json::from_str("\"quota-exceeded\"").unwrap();
        assert_eq!(parsed, ErrorCode::Custom("quota-exceeded".to_string()));
        assert_eq!(parsed.as_str(), "quota-exceeded");
    }

    #[test]
    fn test_service_error_shape() {
        let err = ServiceError::missing_method("User", "explode");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "missing-method");
        assert_eq!(
            value["message"],
            "there is no method named 'explode' for service 'User'"
        );
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(ErrorCode::NotAuthenticated.is_auth_failure());
        assert!(ErrorCode::SessionExpired.is_auth_failure());
        assert!(!ErrorCode::MissingService.is_auth_failure());
    }
}
