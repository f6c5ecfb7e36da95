//! End-to-end scenarios for the cluster state controller.
//!
//! A controller runs against the deterministic in-memory store while the
//! test plays the rest of the cluster, writing peer entries and serving
//! tree heads directly, exactly as other members would. `quiesce` replaces
//! wall-clock sleeps, so every test is reproducible on a single thread.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use treetop::controller::ClusterStateController;
use treetop::controller::ControllerConfig;
use treetop::database::TreeHeadDatabase;
use treetop::state::CLUSTER_CONFIG_KEY;
use treetop::state::ClusterConfig;
use treetop::state::ClusterNodeState;
use treetop::state::SERVING_STH_KEY;
use treetop::state::node_key;
use treetop::sth::SignedTreeHead;
use treetop::store::ConsistentStore;
use treetop::store::DeterministicConsistentStore;
use treetop::store::LeaseId;
use treetop::store::VersionExpectation;
use treetop::testing::CountingElection;
use treetop::testing::InMemoryTreeHeadDatabase;
use treetop::testing::RecordingFetcher;
use treetop::testing::node_state;
use treetop::testing::sth;

struct Harness {
    store: Arc<DeterministicConsistentStore>,
    controller: ClusterStateController,
    election: Arc<CountingElection>,
    fetcher: Arc<RecordingFetcher>,
    database: Arc<InMemoryTreeHeadDatabase>,
    peer_leases: HashMap<String, LeaseId>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl Harness {
    async fn start(node_id: &str, master: bool) -> Result<Self> {
        init_tracing();
        let store = DeterministicConsistentStore::new();
        let election = CountingElection::new(master);
        let fetcher = RecordingFetcher::new();
        let database = InMemoryTreeHeadDatabase::new();

        let controller = ClusterStateController::spawn(
            ControllerConfig::new(node_id),
            store.clone(),
            database.clone(),
            election.clone(),
            fetcher.clone(),
        )
        .await?;

        Ok(Self {
            store,
            controller,
            election,
            fetcher,
            database,
            peer_leases: HashMap::new(),
        })
    }

    async fn set_cluster_config(&self, minimum_serving_nodes: u64, fraction: f64) -> Result<()> {
        let config = ClusterConfig {
            minimum_serving_nodes,
            minimum_serving_fraction: fraction,
        };
        self.store
            .put(
                CLUSTER_CONFIG_KEY,
                &serde_json::to_string(&config)?,
                VersionExpectation::Any,
            )
            .await?;
        Ok(())
    }

    async fn set_peer_state(&mut self, node_id: &str, state: &ClusterNodeState) -> Result<()> {
        let lease = match self.peer_leases.get(node_id) {
            Some(lease) => *lease,
            None => {
                let lease = self.store.grant_lease().await?;
                self.peer_leases.insert(node_id.to_string(), lease);
                lease
            }
        };
        self.store
            .put_leased(&node_key(node_id), &serde_json::to_string(state)?, lease)
            .await?;
        Ok(())
    }

    async fn set_peer(&mut self, node_id: &str, tree_size: u64, timestamp: u64) -> Result<()> {
        self.set_peer_state(node_id, &node_state(node_id, Some(sth(tree_size, timestamp))))
            .await
    }

    async fn kill_peer(&mut self, node_id: &str) -> Result<()> {
        if let Some(lease) = self.peer_leases.remove(node_id) {
            self.store.revoke_lease(lease).await?;
        }
        Ok(())
    }

    /// Serving tree head as another already-elected master would write it.
    async fn write_serving_sth(&self, head: &SignedTreeHead) -> Result<()> {
        self.store
            .put(
                SERVING_STH_KEY,
                &serde_json::to_string(head)?,
                VersionExpectation::Any,
            )
            .await?;
        Ok(())
    }

    async fn stored_serving_sth(&self) -> Option<SignedTreeHead> {
        let value = self.store.get(SERVING_STH_KEY).await.ok()??;
        serde_json::from_str(&value.value).ok()
    }

    async fn calculated(&self) -> Option<SignedTreeHead> {
        self.controller.quiesce().await;
        self.controller.calculated_serving_sth()
    }
}

#[tokio::test]
async fn serving_ramps_up_at_fifty_percent_coverage() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node1", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(100, 100)));

    // Half of two nodes back 200.
    cluster.set_peer("node2", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(200, 200)));

    // Only a third backs 300; two thirds still back 200.
    cluster.set_peer("node3", 300, 300).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn seventy_percent_floor_holds_the_cluster_back() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.7).await?;

    cluster.set_peer("node1", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    // 50% of nodes back 200, short of the floor.
    cluster.set_peer("node2", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    // 66% back 200, still short.
    cluster.set_peer("node3", 300, 300).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(100, 100)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn two_node_minimum_gates_serving() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(2, 0.6).await?;

    cluster.set_peer("node1", 100, 100).await?;
    assert_eq!(cluster.calculated().await, None);
    assert_eq!(cluster.stored_serving_sth().await, None);

    // Two nodes, but 200 is backed by only half, under 60%.
    cluster.set_peer("node2", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    // Two of three nodes back 200.
    cluster.set_peer("node3", 300, 300).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn serving_follows_the_cluster_as_it_moves() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node1", 100, 100).await?;
    cluster.set_peer("node2", 100, 100).await?;
    cluster.set_peer("node3", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    // One of three ahead: stay.
    cluster.set_peer("node1", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    // Two of three ahead: advance.
    cluster.set_peer("node3", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // One node racing further ahead changes nothing.
    cluster.set_peer("node2", 300, 300).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn newer_head_at_the_same_size_is_preferred() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 1.0).await?;

    cluster.set_peer("node1", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 100)));

    cluster.set_peer("node2", 100, 101).await?;
    assert_eq!(cluster.calculated().await, Some(sth(100, 101)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn largest_head_wins_on_a_shared_timestamp() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    // Both entries land before the first calculation: half the cluster
    // backs the larger tree at the shared timestamp.
    cluster.set_peer("node1", 1000, 1000).await?;
    cluster.set_peer("node2", 1001, 1000).await?;
    assert_eq!(cluster.calculated().await, Some(sth(1001, 1000)));

    // A third node with a newer but smaller head cannot move the cluster.
    cluster.set_peer("node3", 999, 1004).await?;
    assert_eq!(cluster.calculated().await, Some(sth(1001, 1000)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(1001, 1000)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn largest_head_wins_on_a_shared_timestamp_from_a_cold_start() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    // All three peers are visible before the first calculation runs, so
    // the tie-break has to come out of a single cold evaluation rather
    // than a previously served head.
    cluster.set_peer("node1", 1000, 1000).await?;
    cluster.set_peer("node2", 1001, 1000).await?;
    cluster.set_peer("node3", 999, 1004).await?;
    assert_eq!(cluster.calculated().await, Some(sth(1001, 1000)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(1001, 1000)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_timestamp_is_never_served_twice_with_different_content() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(3, 1.0).await?;

    cluster.set_peer("node1", 10, 1002).await?;
    cluster.set_peer("node2", 11, 1000).await?;
    cluster.set_peer("node3", 9, 1002).await?;
    // Full coverage forces the smallest replica's head.
    assert_eq!(cluster.calculated().await, Some(sth(9, 1002)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(9, 1002)));

    // The only fully backed candidate is now 10@1002, which would reuse
    // timestamp 1002 with a different tree. Nothing changes.
    cluster.set_peer("node3", 13, 1004).await?;
    assert_eq!(cluster.calculated().await, Some(sth(9, 1002)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(9, 1002)));

    // Still 10@1002 after node3 falls back to 1003; still blocked.
    cluster.set_peer("node3", 13, 1003).await?;
    assert_eq!(cluster.calculated().await, Some(sth(9, 1002)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(9, 1002)));

    // Once the cluster converges on 13, serving moves forward.
    cluster.set_peer("node2", 13, 1006).await?;
    cluster.set_peer("node1", 13, 1006).await?;
    assert_eq!(cluster.calculated().await, Some(sth(13, 1006)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(13, 1006)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn serving_never_regresses() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node1", 200, 200).await?;
    cluster.set_peer("node2", 200, 200).await?;
    cluster.set_peer("node3", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    cluster.set_peer("node1", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // Even with 100 now the best-backed size, no regression.
    cluster.set_peer("node3", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    cluster.set_peer("node2", 100, 100).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn config_changes_drive_recalculation() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(0, 0.5).await?;

    cluster.set_peer("node1", 100, 100).await?;
    cluster.set_peer("node2", 200, 200).await?;
    cluster.set_peer("node3", 300, 300).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // Tightening the fraction cannot shrink the serving head.
    cluster.set_cluster_config(0, 0.9).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // Relaxing it lets the cluster advance to 300.
    cluster.set_cluster_config(0, 0.3).await?;
    assert_eq!(cluster.calculated().await, Some(sth(300, 300)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(300, 300)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn losing_peers_cannot_shrink_the_serving_head() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node1", 100, 100).await?;
    cluster.set_peer("node2", 200, 200).await?;
    cluster.set_peer("node3", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // node2's lease expires; 200 is still backed by half.
    cluster.kill_peer("node2").await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    // Only the 100-leaf replica remains; serving stays put.
    cluster.kill_peer("node3").await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));
    assert_eq!(cluster.stored_serving_sth().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn peers_are_subscribed_once_and_unsubscribed_on_death() -> Result<()> {
    let mut cluster = Harness::start("node1", false).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node2", 100, 100).await?;
    cluster.set_peer("node3", 200, 200).await?;
    // Updates must not resubscribe.
    cluster.set_peer("node2", 300, 300).await?;
    cluster.controller.quiesce().await;

    // The controller's own entry is a peer like any other.
    assert_eq!(cluster.fetcher.add_count("node1"), 1);
    assert_eq!(cluster.fetcher.add_count("node2"), 1);
    assert_eq!(cluster.fetcher.add_count("node3"), 1);

    cluster.kill_peer("node2").await?;
    cluster.controller.quiesce().await;
    assert_eq!(cluster.fetcher.removed(), vec!["node2".to_string()]);

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn election_gate_follows_local_coverage() -> Result<()> {
    let cluster = Harness::start("node1", false).await?;

    // A local head with nothing served yet joins the election.
    cluster.controller.new_tree_head(sth(2344, 10000)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(cluster.election.start_count(), 1);
    assert_eq!(cluster.election.stop_count(), 0);

    // A serving head this node fully backs changes nothing.
    cluster.write_serving_sth(&sth(2344, 10000)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(cluster.election.start_count(), 1);
    assert_eq!(cluster.election.stop_count(), 0);

    // The cluster advances past this node: leave, exactly once.
    cluster.write_serving_sth(&sth(2346, 10001)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(cluster.election.stop_count(), 1);

    // Catching up rejoins.
    cluster.controller.new_tree_head(sth(2400, 10002)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(cluster.election.start_count(), 2);

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn local_state_updates_are_published() -> Result<()> {
    let cluster = Harness::start("node1", false).await?;

    cluster.controller.new_tree_head(sth(234, 2340)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(
        cluster.controller.local_node_state().newest_sth,
        Some(sth(234, 2340))
    );

    cluster.controller.set_node_host_port("myhostname", 9999).await?;
    cluster.controller.quiesce().await;

    let local = cluster.controller.local_node_state();
    assert_eq!(local.hostname, "myhostname");
    assert_eq!(local.log_port, 9999);

    // The published store entry matches the local snapshot.
    let stored = cluster.store.get(&node_key("node1")).await?.unwrap();
    let published: ClusterNodeState = serde_json::from_str(&stored.value)?;
    assert_eq!(published.hostname, "myhostname");
    assert_eq!(published.log_port, 9999);
    assert_eq!(published.newest_sth, Some(sth(234, 2340)));

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn observed_serving_heads_are_mirrored_to_the_database() -> Result<()> {
    let cluster = Harness::start("node1", false).await?;

    cluster.write_serving_sth(&sth(2000, 10000)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(
        cluster.database.latest_tree_head().await?,
        Some(sth(2000, 10000))
    );

    // Newer heads replace, older ones are ignored.
    cluster.write_serving_sth(&sth(2100, 10001)).await?;
    cluster.controller.quiesce().await;
    assert_eq!(
        cluster.database.latest_tree_head().await?,
        Some(sth(2100, 10001))
    );

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn non_masters_calculate_but_do_not_publish() -> Result<()> {
    let mut cluster = Harness::start("node1", false).await?;
    cluster.set_cluster_config(1, 0.5).await?;

    cluster.set_peer("node1", 100, 100).await?;
    cluster.set_peer("node2", 200, 200).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));
    assert_eq!(cluster.stored_serving_sth().await, None);

    cluster.controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_removes_the_node_entry() -> Result<()> {
    let cluster = Harness::start("node1", false).await?;
    cluster.controller.quiesce().await;
    assert!(cluster.store.get(&node_key("node1")).await?.is_some());

    let store = cluster.store.clone();
    cluster.controller.shutdown().await;
    assert!(store.get(&node_key("node1")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn insufficient_data_until_config_appears() -> Result<()> {
    let mut cluster = Harness::start("node1", true).await?;

    cluster.set_peer("node1", 100, 100).await?;
    cluster.set_peer("node2", 200, 200).await?;
    assert_eq!(cluster.calculated().await, None);
    assert_eq!(cluster.stored_serving_sth().await, None);

    cluster.set_cluster_config(1, 0.5).await?;
    assert_eq!(cluster.calculated().await, Some(sth(200, 200)));

    cluster.controller.shutdown().await;
    Ok(())
}
