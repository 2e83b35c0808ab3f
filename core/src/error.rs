//! Error types for the Portofino adapter.
//!
//! # Design
//! Authentication failures, constraint violations and renewal failures get
//! dedicated variants because the admin framework reacts to each one
//! differently (re-login prompt, inline message, forced logout). Every other
//! non-2xx response lands in `HttpError` with the raw status and body.

use thiserror::Error;

use crate::types::RecordId;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by the adapter to the calling framework.
#[derive(Error, Debug)]
pub enum ApiError {
    /// A call came back 401 or 403. The session has already been cleared.
    #[error("not authenticated")]
    AuthenticationExpired,

    /// The backend refused a delete with 409 because other rows reference it.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// The token renewal call was rejected. The session has been cleared.
    #[error("token renewal failed with HTTP {status}: {body}")]
    RenewalFailed { status: u16, body: String },

    /// The request never produced a response (connection refused, DNS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other non-2xx response.
    #[error("HTTP {status} {status_text}: {body}")]
    HttpError {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("login failed: {status_text}")]
    LoginFailed { status_text: String },

    /// A legacy backend reported a row count other than one for a single delete.
    #[error("delete of {id} removed {deleted} rows")]
    DeleteFailed { id: RecordId, deleted: i64 },

    #[error("malformed class accessor: {0}")]
    MalformedMetadata(String),

    /// The provider variant does not support this operation.
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("session store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether this error means the caller is no longer authenticated.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ApiError::AuthenticationExpired | ApiError::RenewalFailed { .. } => true,
            ApiError::HttpError { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_classified() {
        assert!(ApiError::AuthenticationExpired.is_auth_failure());
        assert!(ApiError::RenewalFailed {
            status: 401,
            body: String::new()
        }
        .is_auth_failure());
        assert!(ApiError::HttpError {
            status: 403,
            status_text: "Forbidden".to_string(),
            body: String::new()
        }
        .is_auth_failure());
    }

    #[test]
    fn other_errors_are_not_auth_failures() {
        assert!(!ApiError::ConstraintViolation {
            message: "fk".to_string()
        }
        .is_auth_failure());
        assert!(!ApiError::HttpError {
            status: 500,
            status_text: "Internal Server Error".to_string(),
            body: String::new()
        }
        .is_auth_failure());
        assert!(!ApiError::Transport("refused".to_string()).is_auth_failure());
    }

    #[test]
    fn constraint_violation_displays_backend_message() {
        let err = ApiError::ConstraintViolation {
            message: "order is referenced by invoice 12".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "constraint violation: order is referenced by invoice 12"
        );
    }
}
