//! Output types of a generation call.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soulgen_core::job::RemoteJobHandle;
use soulgen_core::types::Timestamp;

/// One downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// URL the artifact was downloaded from.
    pub remote_url: String,
    /// Where the artifact was written.
    pub local_path: PathBuf,
    /// URL path the artifact is served under, e.g. `/generated/x.png`.
    pub public_url: String,
    /// Position of the artifact in the remote result list (0-based).
    pub sequence_index: usize,
    pub size_bytes: u64,
}

/// Latency breakdown of a generation call, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTimings {
    pub submission_ms: u64,
    pub polling_ms: u64,
    pub download_ms: u64,
    pub total_ms: u64,
}

impl GenerationTimings {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }
}

/// Aggregated outcome of a successful generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub task_id: RemoteJobHandle,
    pub base_filename: String,
    /// Exactly `output_count` artifacts, ordered by `sequence_index`.
    pub artifacts: Vec<ArtifactDescriptor>,
    pub timings: GenerationTimings,
    /// Status queries issued.
    pub polls: u32,
    /// Waits taken after failed or unrecognized polls.
    pub poll_retries: u32,
    pub created_at: Timestamp,
}

impl GenerationResult {
    /// The first artifact, which callers that request a single image use.
    pub fn primary(&self) -> Option<&ArtifactDescriptor> {
        self.artifacts.first()
    }

    /// Public URLs of all artifacts, in order.
    pub fn public_urls(&self) -> Vec<&str> {
        self.artifacts.iter().map(|a| a.public_url.as_str()).collect()
    }

    /// Total bytes written across artifacts.
    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
