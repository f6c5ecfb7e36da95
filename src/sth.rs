//! Signed tree head records and the ordering used for serving decisions.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An immutable commitment to a Merkle tree of `tree_size` leaves signed at
/// a given wall-clock time.
///
/// The controller only interprets `tree_size` and `timestamp`. Root hash,
/// signature, and any future fields are carried in `opaque` and round-trip
/// through the store unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    /// Number of leaves covered by this tree head.
    pub tree_size: u64,
    /// Milliseconds since the Unix epoch at which this tree head was issued.
    pub timestamp: u64,
    /// Fields the controller does not interpret.
    #[serde(flatten)]
    pub opaque: serde_json::Map<String, serde_json::Value>,
}

impl SignedTreeHead {
    /// Build a tree head with no opaque fields.
    pub fn new(tree_size: u64, timestamp: u64) -> Self {
        Self {
            tree_size,
            timestamp,
            opaque: serde_json::Map::new(),
        }
    }

    /// Componentwise ordering: `self` can stand in wherever `other` is
    /// served iff it is at least as large and at least as recent.
    pub fn is_not_older_than(&self, other: &SignedTreeHead) -> bool {
        self.timestamp >= other.timestamp && self.tree_size >= other.tree_size
    }

    /// True when both serving-relevant fields match.
    pub fn same_serving_point(&self, other: &SignedTreeHead) -> bool {
        self.tree_size == other.tree_size && self.timestamp == other.timestamp
    }
}

impl fmt::Display for SignedTreeHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tree_size, self.timestamp)
    }
}
