//! Error types for the serving façade.
//!
//! Every failure that crosses the façade is a [`BackendError`]. The variant is
//! the error *kind*, which callers branch on; the payload names the offending
//! field or operation and carries a human readable reason.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// The five failure classes a caller can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    BatchTooLarge,
    Timeout,
    BackendUnavailable,
    InternalFailure,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendError {
    /// Malformed or missing fields, bad shapes, unknown operation.
    #[error("invalid input `{field}`: {reason}")]
    InvalidInput { field: String, reason: String },

    /// The batch exceeds the configured maximum and splitting is disabled.
    #[error("batch of {size} rows exceeds the maximum micro-batch size of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    /// The backend did not answer within the configured deadline.
    #[error("`{operation}` timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The backend is not reachable or not loaded.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// The backend failed internally.
    #[error("`{operation}` failed: {reason}")]
    InternalFailure { operation: String, reason: String },
}

impl BackendError {
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn internal(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InternalFailure {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::BatchTooLarge { .. } => ErrorKind::BatchTooLarge,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::InternalFailure { .. } => ErrorKind::InternalFailure,
        }
    }

    /// The input name or operation the failure is about, when there is one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { field, .. } => Some(field),
            Self::Timeout { operation, .. } | Self::InternalFailure { operation, .. } => {
                Some(operation)
            }
            Self::BatchTooLarge { .. } | Self::BackendUnavailable { .. } => None,
        }
    }

    /// Transient failures may succeed when resubmitted unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// Process exit status for command line callers.
    ///
    /// - `2`: the caller's fault (invalid input, batch too large)
    /// - `3`: transient (timeout, backend unavailable)
    /// - `4`: internal failure
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::BatchTooLarge => 2,
            ErrorKind::Timeout | ErrorKind::BackendUnavailable => 3,
            ErrorKind::InternalFailure => 4,
        }
    }
}

/// JSON body returned by the server for a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub error: BackendError,
}

impl From<&BackendError> for ErrorBody {
    fn from(error: &BackendError) -> Self {
        Self {
            message: error.to_string(),
            error: error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_class() {
        assert_eq!(BackendError::invalid_input("sequences", "empty").exit_code(), 2);
        assert_eq!(
            BackendError::BatchTooLarge { size: 9, limit: 8 }.exit_code(),
            2
        );
        assert_eq!(BackendError::unavailable("not loaded").exit_code(), 3);
        assert_eq!(
            BackendError::Timeout {
                operation: "embed".into(),
                timeout_ms: 2
            }
            .exit_code(),
            3
        );
        assert_eq!(BackendError::internal("embed", "boom").exit_code(), 4);
    }

    #[test]
    fn test_error_body_keeps_kind_and_field() {
        let err = BackendError::invalid_input("sequences", "no sequences given");
        let body = ErrorBody::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"kind\":\"invalid_input\""));
        assert!(json.contains("invalid input `sequences`"));

        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, err);
        assert_eq!(back.error.kind(), ErrorKind::InvalidInput);
        assert_eq!(back.error.field(), Some("sequences"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::BackendUnavailable.to_string(), "backend_unavailable");
        assert!(BackendError::unavailable("x").is_transient());
        assert!(!BackendError::internal("embed", "x").is_transient());
    }
}
