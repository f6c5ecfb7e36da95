//! Cluster wire records and the store key layout.
//!
//! Every node publishes a [`ClusterNodeState`] under `/nodes/{node_id}`;
//! operators own the singleton [`ClusterConfig`] at `/cluster_config`; the
//! elected master rewrites `/serving_sth`. Records are encoded as JSON so
//! that fields this version does not know about survive a round trip.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::sth::SignedTreeHead;

/// Store key holding the singleton cluster configuration.
pub const CLUSTER_CONFIG_KEY: &str = "/cluster_config";

/// Prefix under which every node publishes its state, leased.
pub const NODES_PREFIX: &str = "/nodes/";

/// Store key holding the cluster-wide serving tree head.
pub const SERVING_STH_KEY: &str = "/serving_sth";

/// Build the store key for a node's published state.
pub fn node_key(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}")
}

/// Extract the node id from a `/nodes/` key, if it is one.
pub fn node_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODES_PREFIX).filter(|id| !id.is_empty())
}

/// Per-node record published at `/nodes/{node_id}`.
///
/// `hostname` and `log_port` are a reachability hint for peers fetching log
/// contents. `newest_sth` is the freshest tree head for which the node has
/// every leaf on local disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeState {
    /// Hostname peers should use to reach this node.
    #[serde(default)]
    pub hostname: String,
    /// Port of the node's log frontend.
    #[serde(default)]
    pub log_port: u16,
    /// Freshest tree head fully backed by this node's local storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_sth: Option<SignedTreeHead>,
    /// Fields this version does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Singleton operator-owned serving policy at `/cluster_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Minimum number of visible nodes backing a tree head before it may be
    /// served.
    pub minimum_serving_nodes: u64,
    /// Minimum fraction of visible nodes, in `[0, 1]`, that must back a
    /// tree head before it may be served.
    pub minimum_serving_fraction: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            minimum_serving_nodes: 1,
            minimum_serving_fraction: 1.0,
        }
    }
}

impl ClusterConfig {
    /// Validate the serving policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.minimum_serving_fraction) {
            return Err(ConfigError::FractionOutOfRange {
                fraction: self.minimum_serving_fraction,
            });
        }
        Ok(())
    }
}

/// Errors from validating a [`ClusterConfig`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The serving fraction is not a sensible probability.
    #[error("minimum_serving_fraction {fraction} is outside [0, 1]")]
    FractionOutOfRange {
        /// The rejected value.
        fraction: f64,
    },
}
