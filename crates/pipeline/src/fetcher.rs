//! Artifact download with deterministic naming.
//!
//! [`ArtifactFetcher`] derives a local filename from the job's base
//! filename and the artifact's sequence index, streams the remote body
//! into a hidden `.part` file chunk by chunk, and renames it into place
//! only once the whole body is on disk. A failed attempt never leaves a
//! file at the final path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::GenerationError;
use crate::result::ArtifactDescriptor;
use crate::retry::{BurstCounter, ErrorClass, RetryDecision, RetryPolicy};

/// Extension used when the remote URL does not carry one.
pub const DEFAULT_EXTENSION: &str = "png";

/// Longest extension taken from a remote URL.
const MAX_EXTENSION_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Derive the local filename for one artifact.
///
/// - remote path without an extension: `{base}_{index}.png`
/// - more than one output requested: `{base}_{index}.{ext}`
/// - single output: `{base}.{ext}`
///
/// The result depends only on the arguments, so repeated fetches for the
/// same job write to the same path.
pub fn artifact_filename(
    remote_url: &str,
    base_filename: &str,
    sequence_index: usize,
    output_count: usize,
) -> String {
    match remote_extension(remote_url) {
        None => format!("{base_filename}_{sequence_index}.{DEFAULT_EXTENSION}"),
        Some(ext) if output_count > 1 => format!("{base_filename}_{sequence_index}.{ext}"),
        Some(ext) => format!("{base_filename}.{ext}"),
    }
}

/// Lower-cased extension of the last path segment of `url`, if it looks
/// like a real file extension.
fn remote_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let (_, ext) = segment.rsplit_once('.')?;

    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Failure of a single download attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The server answered with a non-success status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// No response was received (connect, DNS, TLS, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The body stream broke off after the response started.
    #[error("stream interrupted: {0}")]
    Interrupted(String),

    /// Writing the local file failed.
    #[error("local write failed: {0}")]
    Write(#[from] std::io::Error),
}

impl TransferError {
    /// Retry class for this failure, or `None` if it is not retryable.
    ///
    /// 5xx and 429 statuses are retried with the application budget;
    /// other statuses and local write failures are fatal.
    pub fn retry_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Network(_) | Self::Interrupted(_) => Some(ErrorClass::Network),
            Self::Status(status) if *status >= 500 || *status == 429 => {
                Some(ErrorClass::Application)
            }
            Self::Status(_) | Self::Write(_) => None,
        }
    }
}

/// Where artifact bytes come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Stream the body at `url` into `sink`, returning the bytes written.
    async fn stream_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, TransferError>;
}

/// [`ArtifactSource`] for plain HTTP(S) GETs.
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    /// Build a source whose requests time out after `request_timeout`.
    ///
    /// The timeout bounds the whole transfer, so it should be generous
    /// for large artifacts.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn stream_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, TransferError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))?
        {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Downloads artifacts into an output directory.
pub struct ArtifactFetcher<S> {
    source: S,
    output_dir: PathBuf,
    public_url_prefix: String,
    retry: RetryPolicy,
}

impl<S: ArtifactSource> ArtifactFetcher<S> {
    /// * `output_dir`        - directory artifacts are written to; must exist.
    /// * `public_url_prefix` - URL path the directory is served under,
    ///   e.g. `/generated`.
    pub fn new(
        source: S,
        output_dir: impl Into<PathBuf>,
        public_url_prefix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
            public_url_prefix: public_url_prefix.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Local path an artifact will be written to.
    pub fn local_path(
        &self,
        remote_url: &str,
        base_filename: &str,
        sequence_index: usize,
        output_count: usize,
    ) -> PathBuf {
        self.output_dir.join(artifact_filename(
            remote_url,
            base_filename,
            sequence_index,
            output_count,
        ))
    }

    /// Download one artifact, retrying transient failures.
    ///
    /// On error nothing is left at the final path or the part path.
    pub async fn fetch(
        &self,
        remote_url: &str,
        base_filename: &str,
        sequence_index: usize,
        output_count: usize,
    ) -> Result<ArtifactDescriptor, GenerationError> {
        let file_name = artifact_filename(remote_url, base_filename, sequence_index, output_count);
        let local_path = self.output_dir.join(&file_name);
        let part_path = self.output_dir.join(format!(".{file_name}.part"));

        let mut burst = BurstCounter::default();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.download_once(remote_url, &part_path, &local_path).await {
                Ok(size_bytes) => {
                    tracing::info!(
                        sequence_index,
                        path = %local_path.display(),
                        size_bytes,
                        attempts,
                        "Artifact downloaded",
                    );
                    return Ok(ArtifactDescriptor {
                        remote_url: remote_url.to_string(),
                        public_url: format!("{}/{file_name}", self.public_url_prefix),
                        local_path,
                        sequence_index,
                        size_bytes,
                    });
                }
                Err(err) => {
                    discard(&part_path).await;

                    let decision = match err.retry_class() {
                        Some(class) => self.retry.decide(burst.record(class), class),
                        None => RetryDecision::GiveUp,
                    };

                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                sequence_index,
                                url = %remote_url,
                                error = %err,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Artifact download failed, retrying",
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            return Err(GenerationError::ArtifactFetch {
                                url: remote_url.to_string(),
                                sequence_index,
                                attempts,
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    }

    /// One attempt: stream into `part_path`, fsync, rename to `local_path`.
    async fn download_once(
        &self,
        remote_url: &str,
        part_path: &Path,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let mut file = tokio::fs::File::create(part_path).await?;
        let written = self.source.stream_to(remote_url, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(part_path, local_path).await?;
        Ok(written)
    }
}

/// Remove a leftover part file, ignoring "not found".
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}
