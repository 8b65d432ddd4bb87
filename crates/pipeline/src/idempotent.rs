//! Idempotency wrapper around [`ImageGenerator`].
//!
//! A caller-supplied key identifies one logical generation. The first
//! call under a key takes a work lease, runs the generation, and stores
//! the serialized [`GenerationResult`]; later calls with the same key
//! return the stored result without contacting the service. A second
//! caller arriving while the lease is held gets
//! [`GenerationError::InFlight`] instead of starting a duplicate job.

use std::sync::Arc;
use std::time::Duration;

use soulgen_core::error::CoreError;
use soulgen_core::store::{IdempotencyStore, LeaseStore};
use soulgen_dashscope::backend::GenerationBackend;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::fetcher::ArtifactSource;
use crate::orchestrator::{GenerationRequest, ImageGenerator};
use crate::result::GenerationResult;

/// Prefix of lease keys, so they cannot collide with result keys.
const LEASE_PREFIX: &str = "gen:";

/// Slack added to the poll budget when sizing the lease.
const LEASE_MARGIN: Duration = Duration::from_secs(60);

/// Runs each keyed generation at most once.
pub struct IdempotentGenerator<B, S> {
    generator: Arc<ImageGenerator<B, S>>,
    results: Arc<dyn IdempotencyStore>,
    leases: Arc<dyn LeaseStore>,
    owner_id: String,
    lease_ttl: Duration,
}

impl<B, S> IdempotentGenerator<B, S>
where
    B: GenerationBackend,
    S: ArtifactSource,
{
    pub fn new(
        generator: Arc<ImageGenerator<B, S>>,
        results: Arc<dyn IdempotencyStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        let lease_ttl = generator.poll_settings().timeout + LEASE_MARGIN;
        Self {
            generator,
            results,
            leases,
            owner_id: uuid::Uuid::new_v4().to_string(),
            lease_ttl,
        }
    }

    /// Override the lease TTL. The lease is renewed at half this period.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Owner id this instance acquires leases under.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub async fn generate(
        &self,
        key: &str,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_with_cancel(key, request, &CancellationToken::new())
            .await
    }

    /// Return the stored result for `key`, or run the generation under a
    /// lease and store its result.
    ///
    /// Failed generations are not stored; the key may be retried.
    pub async fn generate_with_cancel(
        &self,
        key: &str,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        if let Some(cached) = self.cached(key).await? {
            tracing::info!(key, task_id = %cached.task_id, "Returning stored generation result");
            return Ok(cached);
        }

        let lease_key = format!("{LEASE_PREFIX}{key}");
        if !self
            .leases
            .try_acquire(&lease_key, &self.owner_id, self.lease_ttl)
            .await?
        {
            return Err(GenerationError::InFlight(key.to_string()));
        }

        // The previous holder may have finished between the lookup and
        // the acquire.
        let outcome = match self.cached(key).await {
            Ok(Some(cached)) => Ok(cached),
            Ok(None) => {
                let outcome = self.run_leased(key, &lease_key, request, cancel).await;
                if let Ok(result) = &outcome {
                    self.store(key, result).await;
                }
                outcome
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.leases.release(&lease_key, &self.owner_id).await {
            tracing::warn!(key, error = %e, "Failed to release generation lease");
        }
        outcome
    }

    async fn cached(&self, key: &str) -> Result<Option<GenerationResult>, GenerationError> {
        match self.results.get(key).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                GenerationError::Store(CoreError::Internal(format!(
                    "Stored result for '{key}' is unreadable: {e}"
                )))
            }),
        }
    }

    /// Persist a successful result. Failure to store is logged, not
    /// returned: the artifacts exist and the caller should get them.
    async fn store(&self, key: &str, result: &GenerationResult) {
        let value = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to serialize generation result");
                return;
            }
        };
        match self.results.put_if_absent(key, value).await {
            Ok(true) => tracing::debug!(key, "Generation result stored"),
            Ok(false) => tracing::warn!(key, "Generation result already stored by another owner"),
            Err(e) => tracing::error!(key, error = %e, "Failed to store generation result"),
        }
    }

    /// Run the generation while renewing the lease in the background.
    ///
    /// Losing the lease cancels the poll loop. A generation that still
    /// fails afterwards is reported as [`GenerationError::LeaseLost`]; one
    /// that completes anyway (downloads already running) is returned.
    async fn run_leased(
        &self,
        key: &str,
        lease_key: &str,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        let guard = cancel.child_token();
        let generation = self.generator.generate_with_cancel(request, &guard);
        tokio::pin!(generation);

        let period = (self.lease_ttl / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut lost = false;

        let result = loop {
            tokio::select! {
                result = &mut generation => break result,
                _ = renew.tick(), if !lost => {
                    match self.leases.renew(lease_key, &self.owner_id, self.lease_ttl).await {
                        Ok(true) => tracing::debug!(lease_key, "Generation lease renewed"),
                        Ok(false) => {
                            tracing::warn!(lease_key, "Generation lease lost to another owner, cancelling");
                            lost = true;
                            guard.cancel();
                        }
                        Err(e) => tracing::warn!(lease_key, error = %e, "Failed to renew generation lease"),
                    }
                }
            }
        };

        match result {
            Err(_) if lost && !cancel.is_cancelled() => {
                Err(GenerationError::LeaseLost(key.to_string()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use soulgen_core::job::{JobSubmission, RemoteJobHandle, TaskSnapshot};
    use soulgen_core::store::{MemoryIdempotencyStore, MemoryLeaseStore};
    use soulgen_dashscope::backend::BackendError;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    use super::*;
    use crate::fetcher::{ArtifactFetcher, TransferError};
    use crate::poller::PollSettings;
    use crate::retry::RetryPolicy;

    struct ScriptedBackend {
        polls: Mutex<VecDeque<Result<TaskSnapshot, BackendError>>>,
        submits: AtomicU32,
    }

    impl ScriptedBackend {
        fn succeeding() -> Self {
            let done = TaskSnapshot::from_raw_status("SUCCEEDED")
                .with_results(vec!["https://cdn.example.com/a.png".into()]);
            Self {
                polls: Mutex::new(VecDeque::from([Ok(done)])),
                submits: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn submit(&self, _: &JobSubmission) -> Result<RemoteJobHandle, BackendError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteJobHandle::new(format!("task-{n}")))
        }

        async fn poll(&self, _: &RemoteJobHandle) -> Result<TaskSnapshot, BackendError> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Malformed("script exhausted".into())))
        }

        async fn cancel(&self, _: &RemoteJobHandle) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct StaticSource;

    #[async_trait]
    impl ArtifactSource for StaticSource {
        async fn stream_to(
            &self,
            _: &str,
            sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<u64, TransferError> {
            sink.write_all(b"img").await?;
            Ok(3)
        }
    }

    fn wrapper(
        backend: ScriptedBackend,
        dir: &std::path::Path,
        leases: Arc<dyn LeaseStore>,
    ) -> (IdempotentGenerator<ScriptedBackend, StaticSource>, Arc<MemoryIdempotencyStore>) {
        let fetcher = ArtifactFetcher::new(StaticSource, dir, "/generated", RetryPolicy::default());
        let settings = PollSettings {
            initial_delay: Duration::ZERO,
            ..PollSettings::default()
        };
        let generator = Arc::new(ImageGenerator::new(backend, fetcher, settings));
        let results = Arc::new(MemoryIdempotencyStore::new());
        let wrapped = IdempotentGenerator::new(generator, results.clone(), leases);
        (wrapped, results)
    }

    #[tokio::test]
    async fn second_call_returns_stored_result() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Arc::new(MemoryLeaseStore::new());
        let (wrapped, results) = wrapper(ScriptedBackend::succeeding(), dir.path(), leases.clone());

        let first = wrapped
            .generate("order-1", GenerationRequest::new("a cat").with_base_filename("cat"))
            .await
            .unwrap();
        let second = wrapped
            .generate("order-1", GenerationRequest::new("a cat").with_base_filename("cat"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(wrapped.generator.backend().submits.load(Ordering::SeqCst), 1);
        assert_eq!(results.len().await, 1);
        assert!(leases.holder("gen:order-1").await.is_none());
    }

    #[tokio::test]
    async fn held_lease_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Arc::new(MemoryLeaseStore::new());
        leases
            .try_acquire("gen:order-2", "other-worker", Duration::from_secs(60))
            .await
            .unwrap();
        let (wrapped, _) = wrapper(ScriptedBackend::succeeding(), dir.path(), leases);

        let err = wrapped
            .generate("order-2", GenerationRequest::new("a cat"))
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::InFlight(key) if key == "order-2");
        assert_eq!(wrapped.generator.backend().submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_is_not_stored_and_lease_released() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Arc::new(MemoryLeaseStore::new());
        let backend = ScriptedBackend {
            polls: Mutex::new(VecDeque::from([Ok(TaskSnapshot::from_raw_status("FAILED")
                .with_message("content moderation"))])),
            submits: AtomicU32::new(0),
        };
        let (wrapped, results) = wrapper(backend, dir.path(), leases.clone());

        let err = wrapped
            .generate("order-3", GenerationRequest::new("a cat"))
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::RemoteJobFailed { message, .. } if message == "content moderation");
        assert!(results.is_empty().await);
        assert!(leases.holder("gen:order-3").await.is_none());
    }

    /// Grants leases but reports every renewal as taken over.
    struct StolenLeaseStore(MemoryLeaseStore);

    #[async_trait]
    impl LeaseStore for StolenLeaseStore {
        async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError> {
            self.0.try_acquire(key, owner, ttl).await
        }

        async fn renew(&self, _: &str, _: &str, _: Duration) -> Result<bool, CoreError> {
            Ok(false)
        }

        async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError> {
            self.0.release(key, owner).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_cancels_generation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            polls: Mutex::new((0..30).map(|_| Ok(TaskSnapshot::from_raw_status("PENDING"))).collect()),
            submits: AtomicU32::new(0),
        };
        let leases = Arc::new(StolenLeaseStore(MemoryLeaseStore::new()));
        let (wrapped, results) = wrapper(backend, dir.path(), leases);
        let wrapped = wrapped.with_lease_ttl(Duration::from_secs(30));

        let err = wrapped
            .generate("order-5", GenerationRequest::new("a cat"))
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::LeaseLost(key) if key == "order-5");
        assert!(results.is_empty().await);
        // Renewal fails at 15s; polls ran at 0s and 10s only.
        assert_eq!(wrapped.generator.backend().polls.lock().unwrap().len(), 28);
    }

    #[tokio::test]
    async fn unreadable_stored_value_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let (wrapped, results) = wrapper(
            ScriptedBackend::succeeding(),
            dir.path(),
            Arc::new(MemoryLeaseStore::new()),
        );
        results
            .put_if_absent("order-4", serde_json::json!({"not": "a result"}))
            .await
            .unwrap();

        let err = wrapped
            .generate("order-4", GenerationRequest::new("a cat"))
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::Store(CoreError::Internal(_)));
    }
}
