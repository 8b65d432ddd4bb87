//! Remote generation service boundary.
//!
//! The pipeline never talks HTTP directly: it submits, polls, and
//! cancels through [`GenerationBackend`], which [`DashScopeApi`]
//! implements. Tests substitute scripted backends.
//!
//! [`DashScopeApi`]: crate::api::DashScopeApi

use async_trait::async_trait;
use soulgen_core::job::{JobSubmission, RemoteJobHandle, TaskSnapshot};

/// Operations the remote generation service exposes.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Create an asynchronous generation job.
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteJobHandle, BackendError>;

    /// Query the current status of a job.
    async fn poll(&self, handle: &RemoteJobHandle) -> Result<TaskSnapshot, BackendError>;

    /// Ask the service to drop a job that has not started yet.
    async fn cancel(&self, handle: &RemoteJobHandle) -> Result<(), BackendError>;
}

/// Errors from a single exchange with the remote service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response: connection refused or
    /// reset, DNS failure, TLS failure, timeout, or a body cut short.
    #[error("Network error: {0}")]
    Network(String),

    /// The service answered with a non-2xx status.
    #[error("DashScope API error ({status}): {}: {message}", .code.as_deref().unwrap_or("unknown"))]
    Api {
        /// HTTP status code.
        status: u16,
        /// Service error code such as `InvalidParameter`.
        code: Option<String>,
        /// Service error message or raw body.
        message: String,
    },

    /// The service answered 2xx with a body we could not interpret.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// `true` when the failure happened below the application protocol
    /// and repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        assert!(BackendError::Network("connection reset by peer".into()).is_transient());
        assert!(!BackendError::Malformed("missing task_id".into()).is_transient());
        assert!(!BackendError::Api {
            status: 500,
            code: None,
            message: "boom".into()
        }
        .is_transient());
    }

    #[test]
    fn api_error_display_with_code() {
        let err = BackendError::Api {
            status: 400,
            code: Some("InvalidParameter".into()),
            message: "size is invalid".into(),
        };
        assert_eq!(
            err.to_string(),
            "DashScope API error (400): InvalidParameter: size is invalid"
        );
    }

    #[test]
    fn api_error_display_without_code() {
        let err = BackendError::Api {
            status: 502,
            code: None,
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "DashScope API error (502): unknown: bad gateway");
    }

    #[test]
    fn reqwest_builder_error_maps_to_network() {
        // Build a reqwest error from an invalid URL.
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        let err = BackendError::from(req_err);
        assert!(err.is_transient());
    }
}
