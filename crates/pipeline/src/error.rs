//! Error taxonomy for a generation call.
//!
//! Every failure of [`ImageGenerator::generate`] is exactly one
//! [`GenerationError`] variant, carrying the task id, attempt counts and
//! elapsed time needed to diagnose it.
//!
//! [`ImageGenerator::generate`]: crate::orchestrator::ImageGenerator::generate

use std::time::Duration;

use soulgen_core::error::CoreError;
use soulgen_core::job::{JobStatus, RemoteJobHandle};
use soulgen_dashscope::backend::BackendError;

use crate::fetcher::TransferError;

/// Why the poller gave up before the job reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortCause {
    /// Too many consecutive transient network failures.
    #[error("network retries exhausted: {0}")]
    NetworkExhausted(BackendError),

    /// Too many consecutive malformed or non-2xx responses.
    #[error("application retries exhausted: {0}")]
    ApplicationExhausted(BackendError),

    /// The service kept returning a status string we do not recognize.
    #[error("remote status '{0}' not recognized")]
    UnknownStatus(String),

    /// The caller's cancellation token was triggered.
    #[error("cancelled by caller")]
    Cancelled,
}

/// Errors from a generation call.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// A required setting is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The request failed input validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The service rejected the job (or could not be reached) at creation.
    #[error("Job submission failed: {0}")]
    Submission(#[source] BackendError),

    /// Polling stopped before a terminal state.
    #[error("Polling aborted for task {task_id} after {attempts} attempts ({elapsed:.1?}): {cause}")]
    PollingAborted {
        task_id: RemoteJobHandle,
        /// Consecutive failed exchanges in the final burst; total polls
        /// when the cause is cancellation.
        attempts: u32,
        /// Time since submission.
        elapsed: Duration,
        #[source]
        cause: AbortCause,
    },

    /// The remote job reached FAILED.
    #[error("Remote job {task_id} failed: {message}")]
    RemoteJobFailed {
        task_id: RemoteJobHandle,
        /// Remote-supplied message, verbatim.
        message: String,
    },

    /// The overall polling budget ran out.
    #[error(
        "Polling timed out for task {task_id} after {elapsed:.1?} (last status: {})",
        .last_status.map_or("none", JobStatus::as_str)
    )]
    PollingTimedOut {
        task_id: RemoteJobHandle,
        elapsed: Duration,
        /// Last status observed before the deadline, if any poll succeeded.
        last_status: Option<JobStatus>,
    },

    /// Downloading or writing one artifact failed.
    #[error("Artifact {sequence_index} fetch failed after {attempts} attempts ({url}): {source}")]
    ArtifactFetch {
        url: String,
        sequence_index: usize,
        attempts: u32,
        #[source]
        source: TransferError,
    },

    /// Another caller holds the work lease for this idempotency key.
    #[error("Generation for key '{0}' is already in progress")]
    InFlight(String),

    /// The work lease was taken over by another owner mid-generation.
    #[error("Generation lease for key '{0}' was lost to another owner")]
    LeaseLost(String),

    /// A persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(#[from] CoreError),
}

impl GenerationError {
    /// The remote task id this error relates to, when one was assigned.
    pub fn task_id(&self) -> Option<&RemoteJobHandle> {
        match self {
            Self::PollingAborted { task_id, .. }
            | Self::RemoteJobFailed { task_id, .. }
            | Self::PollingTimedOut { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
