//! REST API client for the DashScope asynchronous image-synthesis endpoints.
//!
//! Wraps task creation, task queries, and task cancellation using
//! [`reqwest`], and implements [`GenerationBackend`] on top of them.

use std::time::Duration;

use async_trait::async_trait;
use soulgen_core::job::{JobSubmission, RemoteJobHandle, TaskSnapshot};

use crate::backend::{BackendError, GenerationBackend};
use crate::messages::{parse_envelope, ErrorBody, SynthesisRequest, TaskEnvelope};

/// Default API base URL (Beijing region).
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";

/// Default Wan text-to-image model.
pub const DEFAULT_MODEL: &str = "wan2.5-t2i-preview";

/// Path of the asynchronous text-to-image endpoint.
const SYNTHESIS_PATH: &str = "/services/aigc/text2image/image-synthesis";

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Connection settings for [`DashScopeApi`].
#[derive(Debug, Clone)]
pub struct DashScopeConfig {
    /// Base URL, e.g. `https://dashscope.aliyuncs.com/api/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Per-request timeout applied to every HTTP call.
    pub request_timeout: Duration,
}

/// HTTP client for the DashScope service.
pub struct DashScopeApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl DashScopeApi {
    /// Create an API client with its own connection pool.
    pub fn new(config: DashScopeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, config: DashScopeConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            model: config.model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Create an asynchronous synthesis task.
    ///
    /// Sends `POST {base}/services/aigc/text2image/image-synthesis` with
    /// the `X-DashScope-Async: enable` header and returns the
    /// server-assigned task id.
    pub async fn create_task(
        &self,
        submission: &JobSubmission,
    ) -> Result<RemoteJobHandle, BackendError> {
        let body = SynthesisRequest::new(&self.model, submission);

        let response = self
            .client
            .post(self.synthesis_url())
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&body)
            .send()
            .await?;

        let envelope = Self::parse_response(response).await?;
        let output = envelope
            .output
            .ok_or_else(|| BackendError::Malformed("submit response has no output".into()))?;
        if output.task_id.trim().is_empty() {
            return Err(BackendError::Malformed(
                "submit response has an empty task_id".into(),
            ));
        }

        Ok(RemoteJobHandle::new(output.task_id))
    }

    /// Fetch the current state of a task via `GET {base}/tasks/{task_id}`.
    pub async fn get_task(&self, handle: &RemoteJobHandle) -> Result<TaskSnapshot, BackendError> {
        let response = self
            .client
            .get(self.task_url(handle))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Self::parse_response(response)
            .await?
            .into_snapshot()
            .ok_or_else(|| {
                BackendError::Malformed(format!("task {handle} response has no task_status"))
            })
    }

    /// Cancel a task via `POST {base}/tasks/{task_id}/cancel`.
    ///
    /// The service only cancels tasks that are still PENDING.
    pub async fn cancel_task(&self, handle: &RemoteJobHandle) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/cancel", self.task_url(handle)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    fn synthesis_url(&self) -> String {
        format!("{}{SYNTHESIS_PATH}", self.base_url)
    }

    fn task_url(&self, handle: &RemoteJobHandle) -> String {
        format!("{}/tasks/{}", self.base_url, handle)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`BackendError::Api`]
    /// carrying the service's code and message on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (
                parsed.code,
                parsed.message.unwrap_or_else(|| truncate(&body)),
            ),
            Err(_) => (None, truncate(&body)),
        };

        Err(BackendError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    /// Read a successful body and parse it as a [`TaskEnvelope`].
    async fn parse_response(response: reqwest::Response) -> Result<TaskEnvelope, BackendError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        parse_envelope(&text).map_err(|e| {
            BackendError::Malformed(format!("{e}; body: {}", truncate(&text)))
        })
    }
}

#[async_trait]
impl GenerationBackend for DashScopeApi {
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteJobHandle, BackendError> {
        let handle = self.create_task(submission).await?;
        tracing::debug!(task_id = %handle, model = %self.model, "DashScope task created");
        Ok(handle)
    }

    async fn poll(&self, handle: &RemoteJobHandle) -> Result<TaskSnapshot, BackendError> {
        self.get_task(handle).await
    }

    async fn cancel(&self, handle: &RemoteJobHandle) -> Result<(), BackendError> {
        self.cancel_task(handle).await
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{head}...")
    }
}
