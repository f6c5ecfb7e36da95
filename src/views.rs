//! In-memory projections of the store's cluster keys.
//!
//! Both views are fed watch events by the controller's event loop; they do
//! no I/O of their own. The peer view stores exactly what the store says.
//! Liveness comes from the store's leases, not from any staleness
//! heuristic here, so the peer count used by the serving calculation stays
//! well defined.

use std::collections::BTreeMap;

use tracing::warn;

use crate::state::CLUSTER_CONFIG_KEY;
use crate::state::ClusterConfig;
use crate::state::ClusterNodeState;
use crate::state::node_id_from_key;
use crate::store::WatchEvent;
use crate::store::WatchEventKind;

/// Change to a single peer entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDelta {
    /// The affected node.
    pub node_id: String,
    /// State before the event, if the peer was known.
    pub previous: Option<ClusterNodeState>,
    /// State after the event; `None` when the peer disappeared.
    pub current: Option<ClusterNodeState>,
}

/// Projection of `/nodes/`: what the store currently says about each peer.
#[derive(Debug, Default)]
pub struct PeerStateView {
    peers: BTreeMap<String, ClusterNodeState>,
}

impl PeerStateView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one watch event; returns the resulting delta, if any.
    ///
    /// An entry that fails to decode is logged and treated as absent; a
    /// single corrupt peer record must not take the controller down.
    pub fn apply(&mut self, event: &WatchEvent) -> Option<PeerDelta> {
        let node_id = node_id_from_key(&event.key)?.to_string();

        match event.kind {
            WatchEventKind::Remove => {
                let previous = self.peers.remove(&node_id)?;
                Some(PeerDelta {
                    node_id,
                    previous: Some(previous),
                    current: None,
                })
            }
            WatchEventKind::Initial | WatchEventKind::Add | WatchEventKind::Update => {
                let raw = event.value.as_deref()?;
                match serde_json::from_str::<ClusterNodeState>(raw) {
                    Ok(state) => {
                        let previous = self.peers.insert(node_id.clone(), state.clone());
                        Some(PeerDelta {
                            node_id,
                            previous,
                            current: Some(state),
                        })
                    }
                    Err(error) => {
                        warn!(key = %event.key, %error, "undecodable node state, treating peer as absent");
                        let previous = self.peers.remove(&node_id)?;
                        Some(PeerDelta {
                            node_id,
                            previous: Some(previous),
                            current: None,
                        })
                    }
                }
            }
        }
    }

    /// The state of one peer, if known.
    pub fn get(&self, node_id: &str) -> Option<&ClusterNodeState> {
        self.peers.get(node_id)
    }

    /// All currently visible peers, keyed by node id.
    pub fn peers(&self) -> &BTreeMap<String, ClusterNodeState> {
        &self.peers
    }

    /// Clone of the full peer map.
    pub fn snapshot(&self) -> BTreeMap<String, ClusterNodeState> {
        self.peers.clone()
    }

    /// Number of visible peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is visible.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop all state, ahead of a watch re-establishment.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Projection of the singleton `/cluster_config` entry.
///
/// Until the first value is observed the serving calculation has nothing
/// to go on and yields insufficient data.
#[derive(Debug, Default)]
pub struct ClusterConfigView {
    config: Option<ClusterConfig>,
}

impl ClusterConfigView {
    /// Create a view with no config observed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one watch event; returns true when the effective config
    /// changed. Invalid or undecodable configs are logged and the last
    /// good value is kept.
    pub fn apply(&mut self, event: &WatchEvent) -> bool {
        if event.key != CLUSTER_CONFIG_KEY {
            return false;
        }

        match event.kind {
            WatchEventKind::Remove => self.config.take().is_some(),
            WatchEventKind::Initial | WatchEventKind::Add | WatchEventKind::Update => {
                let Some(raw) = event.value.as_deref() else {
                    return false;
                };
                let config = match serde_json::from_str::<ClusterConfig>(raw) {
                    Ok(config) => config,
                    Err(error) => {
                        warn!(%error, "undecodable cluster config, keeping previous");
                        return false;
                    }
                };
                if let Err(error) = config.validate() {
                    warn!(%error, "invalid cluster config, keeping previous");
                    return false;
                }
                if self.config.as_ref() == Some(&config) {
                    return false;
                }
                self.config = Some(config);
                true
            }
        }
    }

    /// The current config, if one has been observed.
    pub fn get(&self) -> Option<&ClusterConfig> {
        self.config.as_ref()
    }

    /// Drop all state, ahead of a watch re-establishment.
    pub fn clear(&mut self) {
        self.config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sth::SignedTreeHead;
    use crate::state::node_key;

    fn node_event(kind: WatchEventKind, node_id: &str, state: Option<&ClusterNodeState>, version: u64) -> WatchEvent {
        WatchEvent {
            kind,
            key: node_key(node_id),
            value: state.map(|s| serde_json::to_string(s).unwrap()),
            version,
        }
    }

    fn state_with_sth(tree_size: u64, timestamp: u64) -> ClusterNodeState {
        ClusterNodeState {
            hostname: "h".into(),
            log_port: 9001,
            newest_sth: Some(SignedTreeHead::new(tree_size, timestamp)),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn peer_view_tracks_add_update_remove() {
        let mut view = PeerStateView::new();
        let first = state_with_sth(10, 10);
        let second = state_with_sth(20, 20);

        let delta = view
            .apply(&node_event(WatchEventKind::Add, "n1", Some(&first), 1))
            .unwrap();
        assert_eq!(delta.node_id, "n1");
        assert!(delta.previous.is_none());
        assert_eq!(delta.current.as_ref(), Some(&first));
        assert_eq!(view.len(), 1);

        let delta = view
            .apply(&node_event(WatchEventKind::Update, "n1", Some(&second), 2))
            .unwrap();
        assert_eq!(delta.previous.as_ref(), Some(&first));
        assert_eq!(delta.current.as_ref(), Some(&second));

        let delta = view
            .apply(&node_event(WatchEventKind::Remove, "n1", None, 3))
            .unwrap();
        assert_eq!(delta.previous.as_ref(), Some(&second));
        assert!(delta.current.is_none());
        assert!(view.is_empty());
    }

    #[test]
    fn peer_view_ignores_unknown_removals_and_foreign_keys() {
        let mut view = PeerStateView::new();
        assert!(view.apply(&node_event(WatchEventKind::Remove, "ghost", None, 1)).is_none());

        let foreign = WatchEvent {
            kind: WatchEventKind::Add,
            key: "/cluster_config".into(),
            value: Some("{}".into()),
            version: 2,
        };
        assert!(view.apply(&foreign).is_none());
    }

    #[test]
    fn corrupt_peer_entry_becomes_absent() {
        let mut view = PeerStateView::new();
        let good = state_with_sth(5, 5);
        view.apply(&node_event(WatchEventKind::Add, "n1", Some(&good), 1));

        let corrupt = WatchEvent {
            kind: WatchEventKind::Update,
            key: node_key("n1"),
            value: Some("not json".into()),
            version: 2,
        };
        let delta = view.apply(&corrupt).unwrap();
        assert_eq!(delta.previous.as_ref(), Some(&good));
        assert!(delta.current.is_none());
        assert!(view.is_empty());

        // Corrupt data for an unknown peer produces no delta at all.
        let corrupt_new = WatchEvent {
            kind: WatchEventKind::Add,
            key: node_key("n2"),
            value: Some("{{{".into()),
            version: 3,
        };
        assert!(view.apply(&corrupt_new).is_none());
    }

    fn config_event(value: Option<&str>, kind: WatchEventKind, version: u64) -> WatchEvent {
        WatchEvent {
            kind,
            key: CLUSTER_CONFIG_KEY.into(),
            value: value.map(str::to_string),
            version,
        }
    }

    #[test]
    fn config_view_tracks_changes_and_rejects_bad_values() {
        let mut view = ClusterConfigView::new();
        assert!(view.get().is_none());

        let raw = r#"{"minimum_serving_nodes":2,"minimum_serving_fraction":0.5}"#;
        assert!(view.apply(&config_event(Some(raw), WatchEventKind::Initial, 1)));
        assert_eq!(view.get().unwrap().minimum_serving_nodes, 2);

        // Same value again is not a change.
        assert!(!view.apply(&config_event(Some(raw), WatchEventKind::Update, 2)));

        // Out-of-range fraction keeps the previous config.
        let bad = r#"{"minimum_serving_nodes":2,"minimum_serving_fraction":7.0}"#;
        assert!(!view.apply(&config_event(Some(bad), WatchEventKind::Update, 3)));
        assert_eq!(view.get().unwrap().minimum_serving_fraction, 0.5);

        // Garbage keeps the previous config.
        assert!(!view.apply(&config_event(Some("nope"), WatchEventKind::Update, 4)));
        assert!(view.get().is_some());

        assert!(view.apply(&config_event(None, WatchEventKind::Remove, 5)));
        assert!(view.get().is_none());
    }

    #[test]
    fn config_view_ignores_other_keys() {
        let mut view = ClusterConfigView::new();
        let event = WatchEvent {
            kind: WatchEventKind::Add,
            key: "/serving_sth".into(),
            value: Some("{}".into()),
            version: 1,
        };
        assert!(!view.apply(&event));
    }
}
