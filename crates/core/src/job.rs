//! Remote generation job model.
//!
//! A [`JobSubmission`] describes one text-to-image request. The remote
//! service answers with a [`RemoteJobHandle`], and every status query
//! returns a [`TaskSnapshot`] whose [`JobStatus`] drives the poller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Default image size descriptor understood by the remote service.
pub const DEFAULT_IMAGE_SIZE: &str = "1024*1024";

/// Optional switches forwarded to the remote service verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFlags {
    /// Let the service rewrite and expand the prompt.
    pub prompt_extend: bool,
    /// Ask the service to stamp a watermark on the output.
    pub watermark: bool,
}

impl Default for SubmissionFlags {
    fn default() -> Self {
        Self {
            prompt_extend: true,
            watermark: false,
        }
    }
}

/// An immutable text-to-image job as sent to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub prompt: String,
    /// May be empty; omitted from the wire request in that case.
    pub negative_prompt: String,
    /// Number of images requested. Always at least 1.
    pub output_count: u32,
    pub seed: Option<u32>,
    /// Size descriptor such as `1024*1024`.
    pub size: String,
    pub flags: SubmissionFlags,
}

impl JobSubmission {
    /// Check the submission against the request constraints.
    ///
    /// - `prompt` must contain non-whitespace text
    /// - `output_count` must be at least 1
    /// - `size` must be non-empty
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation(
                "Prompt must not be empty".to_string(),
            ));
        }
        if self.output_count == 0 {
            return Err(CoreError::Validation(
                "Output count must be at least 1".to_string(),
            ));
        }
        if self.size.trim().is_empty() {
            return Err(CoreError::Validation(
                "Size descriptor must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Identifier the remote service assigned to a submitted job.
///
/// A plain value: it is cloned into errors and results so the task id is
/// never lost when a poll fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobHandle(String);

impl RemoteJobHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self(task_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Remote job status as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The service returned a status string we do not recognize.
    Unknown,
}

impl JobStatus {
    /// Map a remote status string onto a [`JobStatus`].
    ///
    /// Matching is case-insensitive. `CANCELED` is reported as
    /// [`JobStatus::Failed`] since the job will never produce output.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" | "CANCELED" | "CANCELLED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `true` while the job is queued or executing.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One successful status query against the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub status: JobStatus,
    /// Status string exactly as the service sent it.
    pub raw_status: String,
    /// Artifact URLs, populated once the job has succeeded.
    pub result_urls: Vec<String>,
    /// Remote-supplied message, typically present on failure.
    pub message: Option<String>,
}

impl TaskSnapshot {
    /// Build a snapshot from a raw status string with no results.
    pub fn from_raw_status(raw_status: impl Into<String>) -> Self {
        let raw_status = raw_status.into();
        Self {
            status: JobStatus::from_remote(&raw_status),
            raw_status,
            result_urls: Vec::new(),
            message: None,
        }
    }

    pub fn with_results(mut self, urls: Vec<String>) -> Self {
        self.result_urls = urls;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
