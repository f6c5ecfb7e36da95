//! Cluster state coordination for replicated Certificate Transparency logs.
//!
//! A CT log runs as a cluster of equal-weight nodes, each growing its own
//! copy of the Merkle tree at its own pace, coordinated through a strongly
//! consistent key-value store. This crate implements the controller each
//! node runs: it publishes the node's local tree state, watches its peers
//! and the operator-owned serving policy, computes the single tree head
//! the cluster should advertise, and joins the master election only while
//! this replica can actually back what is being served.
//!
//! The advertised tree head never shrinks and never reuses a timestamp,
//! no matter how unevenly the replicas advance, crash, or rejoin.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use treetop::controller::{ClusterStateController, ControllerConfig};
//! use treetop::database::RedbTreeHeadDatabase;
//!
//! let controller = ClusterStateController::spawn(
//!     ControllerConfig::new("node-1"),
//!     store,       // Arc<dyn ConsistentStore>, the etcd-class store
//!     Arc::new(RedbTreeHeadDatabase::open("/var/lib/log/sth.redb")?),
//!     election,    // Arc<dyn MasterElection>
//!     fetcher,     // Arc<dyn ContinuousFetcher>
//! )
//! .await?;
//!
//! // The host reports each tree head it has fully persisted.
//! controller.new_tree_head(signed_tree_head).await?;
//! ```

#![warn(missing_docs)]

/// Serving tree head calculation.
pub mod calculator;
/// Clock helpers.
pub mod clock;
/// The event loop tying views, calculator, gate, and publication together.
pub mod controller;
/// Local persistence for the served tree head.
pub mod database;
/// Master election seam and participation gate.
pub mod election;
/// Peer content-fetch subscriptions.
pub mod fetcher;
/// Cluster wire records and the store key layout.
pub mod state;
/// Signed tree head records and ordering.
pub mod sth;
/// Consistent store gateway and the deterministic in-memory store.
pub mod store;
/// Deterministic test doubles.
pub mod testing;
/// Watch-fed projections of the store's cluster keys.
pub mod views;

pub use controller::ClusterStateController;
pub use controller::ControllerConfig;
pub use controller::ControllerError;
pub use state::ClusterConfig;
pub use state::ClusterNodeState;
pub use sth::SignedTreeHead;
pub use store::ConsistentStore;
pub use store::DeterministicConsistentStore;
