//! Generation orchestrator.
//!
//! [`ImageGenerator`] is the single entry point the route layer calls:
//! it validates the request, submits the job, polls it to completion,
//! downloads every artifact, and aggregates the outcome into a
//! [`GenerationResult`]. It is constructed once from a
//! [`GenerationConfig`] and shared (typically behind an `Arc`); nothing
//! mutable is shared between concurrent calls.

use std::path::Path;

use soulgen_core::error::CoreError;
use soulgen_core::ids::{generate_base_filename, validate_base_filename};
use soulgen_core::job::{JobSubmission, RemoteJobHandle, SubmissionFlags, TaskSnapshot, DEFAULT_IMAGE_SIZE};
use soulgen_dashscope::api::DashScopeApi;
use soulgen_dashscope::backend::GenerationBackend;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::fetcher::{ArtifactFetcher, ArtifactSource, HttpArtifactSource};
use crate::poller::{poll_until_terminal, PollSettings};
use crate::result::{millis, ArtifactDescriptor, GenerationResult, GenerationTimings};

/// Caller input for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub output_count: u32,
    pub seed: Option<u32>,
    /// File stem for the artifacts; synthesized when `None`.
    pub base_filename: Option<String>,
}

impl GenerationRequest {
    /// A single-image request with no negative prompt, seed, or name.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            output_count: 1,
            seed: None,
            base_filename: None,
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn with_output_count(mut self, output_count: u32) -> Self {
        self.output_count = output_count;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_base_filename(mut self, base_filename: impl Into<String>) -> Self {
        self.base_filename = Some(base_filename.into());
        self
    }
}

/// Submits, polls, and downloads text-to-image jobs.
pub struct ImageGenerator<B, S> {
    backend: B,
    fetcher: ArtifactFetcher<S>,
    poll: PollSettings,
    image_size: String,
    flags: SubmissionFlags,
}

impl ImageGenerator<DashScopeApi, HttpArtifactSource> {
    /// Build the production generator: DashScope backend, HTTP artifact
    /// source, and the configured output directory (created if missing).
    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            GenerationError::Configuration(format!(
                "Cannot create output directory {}: {e}",
                config.output_dir.display()
            ))
        })?;

        let backend = DashScopeApi::new(config.dashscope()).map_err(|e| {
            GenerationError::Configuration(format!("Failed to build DashScope client: {e}"))
        })?;
        let source = HttpArtifactSource::new(config.download_timeout).map_err(|e| {
            GenerationError::Configuration(format!("Failed to build download client: {e}"))
        })?;
        let fetcher = ArtifactFetcher::new(
            source,
            &config.output_dir,
            &config.public_url_prefix,
            config.poll.retry.clone(),
        );

        tracing::info!(
            model = %config.model,
            output_dir = %config.output_dir.display(),
            timeout_secs = config.poll.timeout.as_secs(),
            "Image generator initialised",
        );

        Ok(Self::new(backend, fetcher, config.poll.clone())
            .with_defaults(config.image_size.clone(), config.flags))
    }
}

impl<B, S> ImageGenerator<B, S>
where
    B: GenerationBackend,
    S: ArtifactSource,
{
    pub fn new(backend: B, fetcher: ArtifactFetcher<S>, poll: PollSettings) -> Self {
        Self {
            backend,
            fetcher,
            poll,
            image_size: DEFAULT_IMAGE_SIZE.to_string(),
            flags: SubmissionFlags::default(),
        }
    }

    /// Override the size descriptor and flags sent with every job.
    pub fn with_defaults(mut self, image_size: String, flags: SubmissionFlags) -> Self {
        self.image_size = image_size;
        self.flags = flags;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn fetcher(&self) -> &ArtifactFetcher<S> {
        &self.fetcher
    }

    pub fn poll_settings(&self) -> &PollSettings {
        &self.poll
    }

    /// Run one generation end to end.
    ///
    /// Returns exactly `request.output_count` artifacts or one error;
    /// artifacts written before a failure are removed.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// [`generate`](Self::generate) with a cooperative cancellation token.
    ///
    /// Cancellation is observed by the poll loop only; once downloads
    /// have started they run to completion.
    pub async fn generate_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        let started = Instant::now();

        let base_filename = match request.base_filename {
            Some(name) => {
                validate_base_filename(&name).map_err(invalid_request)?;
                name
            }
            None => generate_base_filename(),
        };

        let submission = JobSubmission {
            prompt: request.prompt,
            negative_prompt: request.negative_prompt,
            output_count: request.output_count,
            seed: request.seed,
            size: self.image_size.clone(),
            flags: self.flags,
        };
        submission.validate().map_err(invalid_request)?;

        tracing::info!(
            base_filename = %base_filename,
            output_count = submission.output_count,
            seed = ?submission.seed,
            prompt_chars = submission.prompt.chars().count(),
            "Submitting generation job",
        );

        let handle = self
            .backend
            .submit(&submission)
            .await
            .map_err(GenerationError::Submission)?;
        let submitted_at = Instant::now();

        tracing::info!(task_id = %handle, "Generation job submitted");

        let report =
            poll_until_terminal(&self.backend, &handle, &self.poll, submitted_at, cancel).await?;

        let output_count = submission.output_count as usize;
        let urls = select_result_urls(&handle, &report.snapshot, output_count)?;

        let download_started = Instant::now();
        let artifacts = self.download_all(urls, &base_filename).await?;
        let finished = Instant::now();

        let timings = GenerationTimings {
            submission_ms: millis(submitted_at - started),
            polling_ms: millis(report.elapsed),
            download_ms: millis(finished - download_started),
            total_ms: millis(finished - started),
        };

        tracing::info!(
            task_id = %handle,
            artifacts = artifacts.len(),
            total_ms = timings.total_ms,
            "Generation complete",
        );

        Ok(GenerationResult {
            task_id: handle,
            base_filename,
            artifacts,
            timings,
            polls: report.polls,
            poll_retries: report.retries,
            created_at: chrono::Utc::now(),
        })
    }

    /// Download all artifacts concurrently. If any download fails, the
    /// ones that succeeded are deleted and the lowest-index error is
    /// returned.
    async fn download_all(
        &self,
        urls: &[String],
        base_filename: &str,
    ) -> Result<Vec<ArtifactDescriptor>, GenerationError> {
        let count = urls.len();
        let outcomes = futures::future::join_all(
            urls.iter()
                .enumerate()
                .map(|(index, url)| self.fetcher.fetch(url, base_filename, index, count)),
        )
        .await;

        let mut artifacts = Vec::with_capacity(count);
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => tracing::warn!(error = %e, "Additional artifact failure"),
            }
        }

        match first_error {
            None => Ok(artifacts),
            Some(err) => {
                for artifact in &artifacts {
                    remove_artifact(&artifact.local_path).await;
                }
                Err(err)
            }
        }
    }
}

/// Pick the first `output_count` result URLs, failing if the service
/// returned fewer.
fn select_result_urls<'a>(
    handle: &RemoteJobHandle,
    snapshot: &'a TaskSnapshot,
    output_count: usize,
) -> Result<&'a [String], GenerationError> {
    let available = snapshot.result_urls.len();
    if available < output_count {
        return Err(GenerationError::RemoteJobFailed {
            task_id: handle.clone(),
            message: format!(
                "remote job returned {available} of {output_count} requested artifacts"
            ),
        });
    }
    if available > output_count {
        tracing::warn!(
            task_id = %handle,
            available,
            output_count,
            "Remote job returned surplus artifacts, ignoring extras",
        );
    }
    Ok(&snapshot.result_urls[..output_count])
}

fn invalid_request(err: CoreError) -> GenerationError {
    match err {
        CoreError::Validation(msg) => GenerationError::InvalidRequest(msg),
        other => GenerationError::InvalidRequest(other.to_string()),
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact after failed generation");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn succeeded(urls: &[&str]) -> TaskSnapshot {
        TaskSnapshot::from_raw_status("SUCCEEDED")
            .with_results(urls.iter().map(|u| u.to_string()).collect())
    }

    #[test]
    fn request_builder() {
        let req = GenerationRequest::new("a cat")
            .with_negative_prompt("blurry")
            .with_output_count(2)
            .with_seed(7)
            .with_base_filename("cat");
        assert_eq!(req.prompt, "a cat");
        assert_eq!(req.negative_prompt, "blurry");
        assert_eq!(req.output_count, 2);
        assert_eq!(req.seed, Some(7));
        assert_eq!(req.base_filename.as_deref(), Some("cat"));
    }

    #[test]
    fn select_exact_count() {
        let snap = succeeded(&["a", "b"]);
        let urls = select_result_urls(&RemoteJobHandle::new("t"), &snap, 2).unwrap();
        assert_eq!(urls, ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn select_truncates_surplus() {
        let snap = succeeded(&["a", "b", "c"]);
        let urls = select_result_urls(&RemoteJobHandle::new("t"), &snap, 1).unwrap();
        assert_eq!(urls, ["a".to_string()]);
    }

    #[test]
    fn select_too_few_is_remote_failure() {
        let snap = succeeded(&["a"]);
        assert_matches!(
            select_result_urls(&RemoteJobHandle::new("t"), &snap, 2),
            Err(GenerationError::RemoteJobFailed { message, .. }) if message.contains("1 of 2")
        );
    }

    #[test]
    fn validation_errors_map_to_invalid_request() {
        assert_matches!(
            invalid_request(CoreError::Validation("bad".into())),
            GenerationError::InvalidRequest(msg) if msg == "bad"
        );
    }

    #[test]
    fn from_config_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("generated");
        let out_str = out.to_string_lossy().into_owned();
        let config = GenerationConfig::from_lookup(|key| match key {
            "DASHSCOPE_API_KEY" => Some("sk-test".to_string()),
            "WAN_IMAGE_OUTPUT_DIR" => Some(out_str.clone()),
            _ => None,
        })
        .unwrap();

        let generator = ImageGenerator::from_config(&config).unwrap();

        assert!(out.is_dir());
        assert_eq!(generator.fetcher().output_dir(), out.as_path());
        assert_eq!(generator.poll_settings().timeout.as_secs(), 300);
    }
}
