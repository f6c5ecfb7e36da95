//! Peer content-fetch subscriptions.

use async_trait::async_trait;

use crate::state::ClusterNodeState;

/// Consumer of peer lifecycle notifications.
///
/// The surrounding service keeps a continuous fetcher pointed at the right
/// replicas; the controller only manages the subscriptions. A peer is
/// added the first time its entry appears under `/nodes/` and removed when
/// the entry disappears.
#[async_trait]
pub trait ContinuousFetcher: Send + Sync {
    /// A peer became visible.
    async fn add_peer(&self, node_id: &str, state: &ClusterNodeState);

    /// A previously visible peer disappeared.
    async fn remove_peer(&self, node_id: &str);
}

#[async_trait]
impl<T: ContinuousFetcher + ?Sized> ContinuousFetcher for std::sync::Arc<T> {
    async fn add_peer(&self, node_id: &str, state: &ClusterNodeState) {
        (**self).add_peer(node_id, state).await
    }

    async fn remove_peer(&self, node_id: &str) {
        (**self).remove_peer(node_id).await
    }
}

/// Fetcher that ignores all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFetcher;

#[async_trait]
impl ContinuousFetcher for NoopFetcher {
    async fn add_peer(&self, _node_id: &str, _state: &ClusterNodeState) {}

    async fn remove_peer(&self, _node_id: &str) {}
}
