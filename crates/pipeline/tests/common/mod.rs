use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use soulgen_core::job::{JobSubmission, RemoteJobHandle, TaskSnapshot};
use soulgen_dashscope::backend::{BackendError, GenerationBackend};
use soulgen_pipeline::fetcher::{ArtifactFetcher, ArtifactSource, TransferError};
use soulgen_pipeline::orchestrator::ImageGenerator;
use soulgen_pipeline::poller::PollSettings;

pub const TASK_ID: &str = "task-0001";

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Backend whose poll answers are consumed from a script. Once the script
/// runs out, `fallback` is returned forever.
pub struct ScriptedBackend {
    submit_error: Option<BackendError>,
    script: Mutex<VecDeque<Result<TaskSnapshot, BackendError>>>,
    fallback: Result<TaskSnapshot, BackendError>,
    submissions: Mutex<Vec<JobSubmission>>,
    poll_calls: AtomicU32,
    cancel_calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            submit_error: None,
            script: Mutex::new(VecDeque::new()),
            fallback: Err(BackendError::Malformed("poll script exhausted".into())),
            submissions: Mutex::new(Vec::new()),
            poll_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
        }
    }

    pub fn rejecting_submit(mut self, err: BackendError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub fn then(self, result: Result<TaskSnapshot, BackendError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn then_status(self, raw: &str) -> Self {
        self.then(Ok(TaskSnapshot::from_raw_status(raw)))
    }

    pub fn then_succeeded(self, urls: &[&str]) -> Self {
        self.then(Ok(succeeded(urls)))
    }

    pub fn then_network_error(self) -> Self {
        self.then(Err(BackendError::Network("connection reset by peer".into())))
    }

    pub fn forever(mut self, result: Result<TaskSnapshot, BackendError>) -> Self {
        self.fallback = result;
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn last_submission(&self) -> Option<JobSubmission> {
        self.submissions.lock().unwrap().last().cloned()
    }

    pub fn poll_calls(&self) -> u32 {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn submit(&self, submission: &JobSubmission) -> Result<RemoteJobHandle, BackendError> {
        self.submissions.lock().unwrap().push(submission.clone());
        match &self.submit_error {
            Some(err) => Err(err.clone()),
            None => Ok(RemoteJobHandle::new(TASK_ID)),
        }
    }

    async fn poll(&self, handle: &RemoteJobHandle) -> Result<TaskSnapshot, BackendError> {
        assert_eq!(handle.as_str(), TASK_ID);
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn cancel(&self, _handle: &RemoteJobHandle) -> Result<(), BackendError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn succeeded(urls: &[&str]) -> TaskSnapshot {
    TaskSnapshot::from_raw_status("SUCCEEDED")
        .with_results(urls.iter().map(|u| u.to_string()).collect())
}

// ---------------------------------------------------------------------------
// In-memory artifact source
// ---------------------------------------------------------------------------

/// Serves fixed bodies; URLs without a body answer 404. URLs registered
/// with `fail_always` return the given status on every call.
#[derive(Default)]
pub struct MemorySource {
    bodies: HashMap<String, Vec<u8>>,
    statuses: HashMap<String, u16>,
    calls: AtomicU32,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn fail_always(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn stream_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.statuses.get(url) {
            return Err(TransferError::Status(*status));
        }
        let body = self.bodies.get(url).ok_or(TransferError::Status(404))?;
        sink.write_all(body).await?;
        Ok(body.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Default poll settings: 300s budget, 10s interval, 1s initial delay.
pub fn settings() -> PollSettings {
    PollSettings::default()
}

pub fn generator(
    backend: ScriptedBackend,
    source: MemorySource,
    output_dir: &Path,
) -> ImageGenerator<ScriptedBackend, MemorySource> {
    let poll = settings();
    let fetcher = ArtifactFetcher::new(source, output_dir, "/generated", poll.retry.clone());
    ImageGenerator::new(backend, fetcher, poll)
}

/// Sorted file names in `dir`, hidden part files included.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
