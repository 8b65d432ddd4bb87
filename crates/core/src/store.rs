//! Persistence collaborators consumed by the orchestrator.
//!
//! The orchestrator treats persistence as two opaque key-value stores:
//! an idempotency cache keyed by a caller-supplied key, and a lease
//! (work-lock) store keyed by a work key with an expiry. Production
//! deployments back these with a database; the in-memory versions here
//! serve tests and single-process use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Cache of completed results keyed by an idempotency key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Look up a stored result.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CoreError>;

    /// Store `value` unless the key already has one.
    ///
    /// Returns `true` if the value was stored, `false` if an existing
    /// entry was left in place.
    async fn put_if_absent(&self, key: &str, value: serde_json::Value)
        -> Result<bool, CoreError>;
}

/// Expiring exclusive leases over a work key.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease if it is free, expired, or already held by `owner`.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError>;

    /// Extend a lease held by `owner`. Returns `false` if `owner` no
    /// longer holds it.
    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError>;

    /// Release a lease held by `owner`. Releasing a lease held by someone
    /// else is a no-op.
    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory idempotency store
// ---------------------------------------------------------------------------

/// Process-local [`IdempotencyStore`].
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored results.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .cloned())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, CoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// In-memory lease store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Timestamp,
}

/// Process-local [`LeaseStore`] using wall-clock expiry.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, ignoring expired leases.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let now = chrono::Utc::now();
        self.leases
            .lock()
            .await
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone())
    }
}

fn expiry_after(ttl: Duration) -> Result<Timestamp, CoreError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| CoreError::Validation(format!("Lease TTL out of range: {e}")))?;
    Ok(chrono::Utc::now() + ttl)
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError> {
        let expires_at = expiry_after(ttl)?;
        let now = chrono::Utc::now();
        let mut leases = self.leases.lock().await;

        if let Some(existing) = leases.get(key) {
            if existing.owner != owner && existing.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CoreError> {
        let expires_at = expiry_after(ttl)?;
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|lease| lease.owner == owner) {
            leases.remove(key);
        }
        Ok(())
    }
}
