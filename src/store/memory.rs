//! Deterministic in-memory consistent store.
//!
//! Mirrors the behavior of the external store without network I/O: a single
//! global revision counter, per-key versions, synchronous watch fan-out,
//! and lease bookkeeping. Used by unit tests, integration tests, and
//! simulations where repeatability matters more than durability.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::ConsistentStore;
use super::LeaseId;
use super::StoreError;
use super::VersionExpectation;
use super::VersionedValue;
use super::WatchEvent;
use super::WatchEventKind;
use super::WatchStream;

struct Entry {
    value: String,
    version: u64,
    lease: Option<u64>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
    leases: HashMap<u64, HashSet<String>>,
    revision: u64,
    next_lease: u64,
}

impl Inner {
    fn broadcast(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return true;
            }
            // A closed receiver drops the watcher; the consumer is gone.
            watcher.tx.send(event.clone()).is_ok()
        });
    }

    fn detach_lease(&mut self, key: &str, lease: Option<u64>) {
        if let Some(lease) = lease {
            if let Some(keys) = self.leases.get_mut(&lease) {
                keys.remove(key);
            }
        }
    }

    fn apply_put(&mut self, key: &str, value: &str, lease: Option<u64>) -> u64 {
        self.revision += 1;
        let version = self.revision;

        let previous = self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                lease,
            },
        );
        if let Some(previous) = &previous {
            if previous.lease != lease {
                self.detach_lease(key, previous.lease);
            }
        }
        if let Some(lease) = lease {
            self.leases.entry(lease).or_default().insert(key.to_string());
        }

        self.broadcast(WatchEvent {
            kind: if previous.is_some() {
                WatchEventKind::Update
            } else {
                WatchEventKind::Add
            },
            key: key.to_string(),
            value: Some(value.to_string()),
            version,
        });
        version
    }

    fn apply_delete(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.detach_lease(key, entry.lease);
        self.revision += 1;
        let version = self.revision;
        self.broadcast(WatchEvent {
            kind: WatchEventKind::Remove,
            key: key.to_string(),
            value: None,
            version,
        });
        true
    }
}

/// In-memory implementation of [`ConsistentStore`].
///
/// Watch events are delivered synchronously with the mutation that caused
/// them, which makes multi-node scenarios reproducible without sleeps.
#[derive(Clone, Default)]
pub struct DeterministicConsistentStore {
    inner: Arc<Mutex<Inner>>,
}

impl DeterministicConsistentStore {
    /// Create a new, empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ConsistentStore for DeterministicConsistentStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(key).map(|entry| VersionedValue {
            key: key.to_string(),
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: VersionExpectation,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let actual = inner.entries.get(key).map(|entry| entry.version);

        let matches = match expected {
            VersionExpectation::Any => true,
            VersionExpectation::Absent => actual.is_none(),
            VersionExpectation::Version(version) => actual == Some(version),
        };
        if !matches {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        Ok(inner.apply_put(key, value, None))
    }

    async fn put_leased(&self, key: &str, value: &str, lease: LeaseId) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.leases.contains_key(&lease.0) {
            return Err(StoreError::LeaseNotFound { lease });
        }
        Ok(inner.apply_put(key, value, Some(lease.0)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.apply_delete(key))
    }

    async fn grant_lease(&self) -> Result<LeaseId, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.leases.insert(lease, HashSet::new());
        Ok(LeaseId(lease))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(keys) = inner.leases.remove(&lease.0) else {
            return Ok(());
        };
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        for key in keys {
            inner.apply_delete(&key);
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot first, atomically with registration, so no delta is
        // missed and none is duplicated.
        for (key, entry) in inner.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let _ = tx.send(WatchEvent {
                kind: WatchEventKind::Initial,
                key: key.clone(),
                value: Some(entry.value.clone()),
                version: entry.version,
            });
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
