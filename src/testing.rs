//! Deterministic test doubles for the controller's collaborators.
//!
//! Exported from the crate proper, not hidden behind `cfg(test)`, so
//! integration tests and downstream simulations can reuse them.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::database::DatabaseError;
use crate::database::TreeHeadDatabase;
use crate::election::ElectionError;
use crate::election::MasterElection;
use crate::fetcher::ContinuousFetcher;
use crate::state::ClusterNodeState;
use crate::sth::SignedTreeHead;

/// Election primitive with a settable mastership answer and command
/// counters.
#[derive(Debug, Default)]
pub struct CountingElection {
    master: AtomicBool,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl CountingElection {
    /// Create an election that reports the given mastership.
    pub fn new(master: bool) -> Arc<Self> {
        Arc::new(Self {
            master: AtomicBool::new(master),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        })
    }

    /// Change the mastership answer.
    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }

    /// Number of `start_election` commands received.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop_election` commands received.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterElection for CountingElection {
    async fn start_election(&self) -> Result<(), ElectionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_election(&self) -> Result<(), ElectionError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }
}

/// Election primitive whose commands fail until told otherwise.
#[derive(Debug, Default)]
pub struct FailingElection {
    healthy: AtomicBool,
    start_attempts: AtomicU64,
}

impl FailingElection {
    /// Create an election whose commands initially fail.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let subsequent commands succeed.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `start_election` attempts, successful or not.
    pub fn start_attempts(&self) -> u64 {
        self.start_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterElection for FailingElection {
    async fn start_election(&self) -> Result<(), ElectionError> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ElectionError {
                reason: "primitive offline".into(),
            })
        }
    }

    async fn stop_election(&self) -> Result<(), ElectionError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ElectionError {
                reason: "primitive offline".into(),
            })
        }
    }

    fn is_master(&self) -> bool {
        false
    }
}

/// Fetcher recording every subscription change.
#[derive(Debug, Default)]
pub struct RecordingFetcher {
    added: RwLock<Vec<String>>,
    removed: RwLock<Vec<String>>,
}

impl RecordingFetcher {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Node ids passed to `add_peer`, in order.
    pub fn added(&self) -> Vec<String> {
        self.added.read().clone()
    }

    /// Node ids passed to `remove_peer`, in order.
    pub fn removed(&self) -> Vec<String> {
        self.removed.read().clone()
    }

    /// How many times the given node was added.
    pub fn add_count(&self, node_id: &str) -> usize {
        self.added.read().iter().filter(|id| *id == node_id).count()
    }
}

#[async_trait]
impl ContinuousFetcher for RecordingFetcher {
    async fn add_peer(&self, node_id: &str, _state: &ClusterNodeState) {
        self.added.write().push(node_id.to_string());
    }

    async fn remove_peer(&self, node_id: &str) {
        self.removed.write().push(node_id.to_string());
    }
}

/// In-memory [`TreeHeadDatabase`] with replace-with-newer semantics.
#[derive(Debug, Default)]
pub struct InMemoryTreeHeadDatabase {
    latest: RwLock<Option<SignedTreeHead>>,
}

impl InMemoryTreeHeadDatabase {
    /// Create an empty database.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TreeHeadDatabase for InMemoryTreeHeadDatabase {
    async fn store_serving_sth(&self, sth: &SignedTreeHead) -> Result<(), DatabaseError> {
        let mut latest = self.latest.write();
        let newer = match latest.as_ref() {
            Some(current) => sth.is_not_older_than(current) && !sth.same_serving_point(current),
            None => true,
        };
        if newer {
            *latest = Some(sth.clone());
        }
        Ok(())
    }

    async fn latest_tree_head(&self) -> Result<Option<SignedTreeHead>, DatabaseError> {
        Ok(self.latest.read().clone())
    }
}

/// Shorthand for building a bare tree head.
pub fn sth(tree_size: u64, timestamp: u64) -> SignedTreeHead {
    SignedTreeHead::new(tree_size, timestamp)
}

/// Shorthand for a node state backing the given tree head.
pub fn node_state(hostname: &str, newest_sth: Option<SignedTreeHead>) -> ClusterNodeState {
    ClusterNodeState {
        hostname: hostname.to_string(),
        log_port: 9001,
        newest_sth,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_keeps_the_newest_head() {
        let db = InMemoryTreeHeadDatabase::new();
        db.store_serving_sth(&sth(200, 200)).await.unwrap();
        db.store_serving_sth(&sth(100, 100)).await.unwrap();
        assert_eq!(db.latest_tree_head().await.unwrap(), Some(sth(200, 200)));
    }

    #[tokio::test]
    async fn recording_fetcher_counts_by_node() {
        let fetcher = RecordingFetcher::new();
        fetcher.add_peer("n1", &node_state("n1", None)).await;
        fetcher.add_peer("n2", &node_state("n2", None)).await;
        fetcher.add_peer("n1", &node_state("n1", None)).await;
        fetcher.remove_peer("n2").await;

        assert_eq!(fetcher.add_count("n1"), 2);
        assert_eq!(fetcher.add_count("n2"), 1);
        assert_eq!(fetcher.removed(), vec!["n2".to_string()]);
    }
}
