//! DashScope image-synthesis wire messages.
//!
//! The asynchronous API answers both the submit call and the task query
//! with an envelope of the shape
//! `{"request_id": "...", "output": {"task_id": "...", "task_status": "...", ...}}`.
//! Failed calls carry top-level `code` and `message` fields instead.

use serde::{Deserialize, Serialize};
use soulgen_core::job::{JobSubmission, TaskSnapshot};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /services/aigc/text2image/image-synthesis`.
#[derive(Debug, Serialize)]
pub struct SynthesisRequest<'a> {
    pub model: &'a str,
    pub input: SynthesisInput<'a>,
    pub parameters: SynthesisParameters<'a>,
}

#[derive(Debug, Serialize)]
pub struct SynthesisInput<'a> {
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub negative_prompt: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SynthesisParameters<'a> {
    pub size: &'a str,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    pub prompt_extend: bool,
    pub watermark: bool,
}

impl<'a> SynthesisRequest<'a> {
    /// Build the request body for `submission` against `model`.
    pub fn new(model: &'a str, submission: &'a JobSubmission) -> Self {
        Self {
            model,
            input: SynthesisInput {
                prompt: &submission.prompt,
                negative_prompt: &submission.negative_prompt,
            },
            parameters: SynthesisParameters {
                size: &submission.size,
                n: submission.output_count,
                seed: submission.seed,
                prompt_extend: submission.flags.prompt_extend,
                watermark: submission.flags.watermark,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Envelope returned by the submit and task-query endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub output: Option<TaskOutput>,
    /// Top-level error code (present on failed calls).
    #[serde(default)]
    pub code: Option<String>,
    /// Top-level error message (present on failed calls).
    #[serde(default)]
    pub message: Option<String>,
}

/// The `output` object of a [`TaskEnvelope`].
#[derive(Debug, Clone, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    #[serde(default)]
    pub task_status: Option<String>,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    /// Task-level failure code.
    #[serde(default)]
    pub code: Option<String>,
    /// Task-level failure message.
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of `output.results`.
///
/// Successful entries carry `url`; entries for sub-images that failed
/// carry `code` and `message` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a non-2xx response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl TaskEnvelope {
    /// Convert a task-query envelope into a [`TaskSnapshot`].
    ///
    /// Returns `None` when the envelope has no `output` or no
    /// `task_status`. The failure message prefers the task-level message
    /// and falls back to the envelope message.
    pub fn into_snapshot(self) -> Option<TaskSnapshot> {
        let output = self.output?;
        let raw_status = output.task_status?;

        let result_urls = output
            .results
            .into_iter()
            .filter_map(|r| r.url)
            .filter(|url| !url.trim().is_empty())
            .collect();

        let mut snapshot = TaskSnapshot::from_raw_status(raw_status).with_results(result_urls);
        snapshot.message = output
            .message
            .filter(|m| !m.is_empty())
            .or(self.message.filter(|m| !m.is_empty()));
        Some(snapshot)
    }
}

/// Parse a response body into a [`TaskEnvelope`].
pub fn parse_envelope(text: &str) -> Result<TaskEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}
