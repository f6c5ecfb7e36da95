//! Consistent store gateway.
//!
//! Thin seam over the external strongly consistent key-value store: prefix
//! watches that replay a snapshot before streaming deltas, compare-and-swap
//! writes, and leased keys that vanish when their owner does. Production
//! deployments put a network client behind [`ConsistentStore`]; tests use
//! the deterministic in-memory implementation.

mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::DeterministicConsistentStore;

/// Handle for a lease granted by the store.
///
/// Keys written under a lease are deleted by the store when the lease is
/// revoked or its owner dies, so peers never see entries for dead nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Expected prior state for a [`ConsistentStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionExpectation {
    /// No expectation; the write always applies.
    Any,
    /// The key must not exist yet.
    Absent,
    /// The key must currently be at exactly this version.
    Version(u64),
}

/// A value read from the store together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// The key this value was read from.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Store revision of the last write to this key.
    pub version: u64,
}

/// Kind of a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Part of the snapshot replayed when the watch is established.
    Initial,
    /// A key appeared after the snapshot.
    Add,
    /// An existing key was rewritten.
    Update,
    /// A key was deleted or its lease was revoked.
    Remove,
}

/// A single event on a watched prefix.
///
/// Events for any one key arrive in store-commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// The affected key.
    pub key: String,
    /// The new value; `None` for removals.
    pub value: Option<String>,
    /// Store revision at which this event was committed.
    pub version: u64,
}

/// Stream of watch events: a snapshot of `Initial` events followed by
/// deltas. A closed stream means the watch must be re-established and the
/// consumer's projection rebuilt from the fresh snapshot.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Errors from consistent store operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("key '{key}' not found")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A compare-and-swap write lost the race.
    #[error("compare-and-swap failed for key '{key}': expected {expected:?}, found version {actual:?}")]
    VersionConflict {
        /// The contested key.
        key: String,
        /// What the writer expected.
        expected: VersionExpectation,
        /// The version actually present, if the key exists.
        actual: Option<u64>,
    },

    /// A leased write referenced a lease the store does not know.
    #[error("{lease} is not active")]
    LeaseNotFound {
        /// The unknown lease.
        lease: LeaseId,
    },

    /// The store cannot be reached right now; retry with backoff.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Transport-level detail.
        reason: String,
    },

    /// The operation exceeded its deadline.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout {
        /// Duration in milliseconds before the timeout fired.
        duration_ms: u64,
    },

    /// The store returned bytes that do not decode.
    #[error("corrupted entry at '{key}': {reason}")]
    Corrupted {
        /// The offending key.
        key: String,
        /// Decode failure detail.
        reason: String,
    },
}

/// Strongly consistent key-value store interface.
///
/// All writes to shared cluster keys go through [`put`](Self::put) with a
/// version expectation; per-node keys are written with
/// [`put_leased`](Self::put_leased) so they disappear with their owner.
#[async_trait]
pub trait ConsistentStore: Send + Sync {
    /// Read a single key with its version.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Write a key, gated on the caller's version expectation.
    /// Returns the new version.
    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: VersionExpectation,
    ) -> Result<u64, StoreError>;

    /// Write a key attached to a lease. Returns the new version.
    async fn put_leased(&self, key: &str, value: &str, lease: LeaseId) -> Result<u64, StoreError>;

    /// Delete a key unconditionally. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Grant a new lease for this process.
    async fn grant_lease(&self) -> Result<LeaseId, StoreError>;

    /// Revoke a lease, deleting every key attached to it. Revoking an
    /// unknown lease is a no-op.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Watch a key prefix: the current snapshot as `Initial` events, then
    /// every subsequent change.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

#[async_trait]
impl<T: ConsistentStore + ?Sized> ConsistentStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        (**self).get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: VersionExpectation,
    ) -> Result<u64, StoreError> {
        (**self).put(key, value, expected).await
    }

    async fn put_leased(&self, key: &str, value: &str, lease: LeaseId) -> Result<u64, StoreError> {
        (**self).put_leased(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn grant_lease(&self) -> Result<LeaseId, StoreError> {
        (**self).grant_lease().await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        (**self).revoke_lease(lease).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        (**self).watch(prefix).await
    }
}

/// Capped exponential backoff with jitter for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Attempts before giving up until the next triggering event.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given zero-based attempt, jittered to avoid
    /// thundering herds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_backoff_ms);
        let jitter = rand::rng().random_range(0..base / 2 + 1);
        Duration::from_millis(base + jitter)
    }
}
