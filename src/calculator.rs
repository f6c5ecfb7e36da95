//! Serving tree head calculation.
//!
//! A pure function of the peer snapshot, the cluster configuration, and
//! the currently served tree head. The cluster serves the largest tree
//! head that enough replicas can actually answer queries for, and never
//! steps backwards in size or timestamp once a head has been served.

use std::collections::BTreeMap;

use crate::state::ClusterConfig;
use crate::state::ClusterNodeState;
use crate::sth::SignedTreeHead;

struct SizeBucket<'a> {
    /// Newest tree head reported at exactly this size.
    newest: &'a SignedTreeHead,
    /// Number of nodes reporting exactly this size.
    nodes: u64,
}

/// Compute the next tree head the cluster should serve, or `None` when the
/// visible peers cannot support a change.
///
/// A node can serve every tree head no larger than its own, so a candidate
/// size is backed by all nodes whose reported size is at least as big.
/// Walking candidate sizes from largest to smallest, the first one backed
/// by `minimum_serving_fraction` of the visible nodes wins; the head
/// proposed for that size is the newest one reported at it.
///
/// Identical-timestamp tie-break: at most one head can ever be served at
/// a given timestamp, so among candidate heads sharing the qualifying
/// head's exact timestamp the one with the larger tree wins, provided the
/// fraction of nodes whose reported timestamp has reached that instant
/// also meets the floor.
///
/// The proposal is then held against the currently served head `current`:
/// it must not shrink the tree, and it must strictly advance the
/// timestamp. The strict inequality is what keeps a timestamp from ever
/// being served twice with different contents; when the only backed
/// candidate reuses the serving timestamp, the cluster keeps serving what
/// it has until the replicas move forward. A proposal identical to
/// `current` is suppressed rather than re-served.
pub fn next_serving_sth(
    peers: &BTreeMap<String, ClusterNodeState>,
    config: Option<&ClusterConfig>,
    current: Option<&SignedTreeHead>,
) -> Option<SignedTreeHead> {
    let config = config?;
    let num_nodes = peers.len() as u64;
    if num_nodes == 0 || num_nodes < config.minimum_serving_nodes {
        return None;
    }

    let mut buckets: BTreeMap<u64, SizeBucket<'_>> = BTreeMap::new();
    for state in peers.values() {
        let Some(sth) = state.newest_sth.as_ref() else {
            continue;
        };
        buckets
            .entry(sth.tree_size)
            .and_modify(|bucket| {
                bucket.nodes += 1;
                if sth.timestamp > bucket.newest.timestamp {
                    bucket.newest = sth;
                }
            })
            .or_insert(SizeBucket { newest: sth, nodes: 1 });
    }

    let mut nodes_seen = 0u64;
    let mut proposal = None;
    for bucket in buckets.values().rev() {
        nodes_seen += bucket.nodes;
        let fraction = nodes_seen as f64 / num_nodes as f64;
        if fraction >= config.minimum_serving_fraction {
            proposal = Some(bucket.newest);
            break;
        }
    }
    let mut proposal = proposal?;

    // Serving the qualifying head would foreclose every other head signed
    // at its timestamp, so prefer the largest tree reported at exactly
    // that instant when enough nodes have reached it.
    let reached_timestamp = peers
        .values()
        .filter(|state| {
            state
                .newest_sth
                .as_ref()
                .is_some_and(|sth| sth.timestamp >= proposal.timestamp)
        })
        .count() as u64;
    if reached_timestamp as f64 / num_nodes as f64 >= config.minimum_serving_fraction {
        for state in peers.values() {
            let Some(sth) = state.newest_sth.as_ref() else {
                continue;
            };
            if sth.timestamp == proposal.timestamp && sth.tree_size > proposal.tree_size {
                proposal = sth;
            }
        }
    }

    match current {
        None => Some(proposal.clone()),
        Some(current) if proposal.same_serving_point(current) => None,
        Some(current)
            if proposal.tree_size >= current.tree_size
                && proposal.timestamp > current.timestamp =>
        {
            Some(proposal.clone())
        }
        Some(_) => None,
    }
}
