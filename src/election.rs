//! Master election seam and the gate that decides participation.
//!
//! The election primitive itself is external; the controller only commands
//! it. A node may hold mastership only while its local tree can back the
//! tree head the cluster is serving, so the gate joins and leaves the
//! election as that relationship changes.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::sth::SignedTreeHead;

/// Failure reported by the external election primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("election command failed: {reason}")]
pub struct ElectionError {
    /// Primitive-specific detail.
    pub reason: String,
}

/// External master-election primitive, consumed by the controller.
///
/// `start_election` and `stop_election` are edge-triggered and are not
/// assumed idempotent; the gate issues each transition exactly once.
#[async_trait]
pub trait MasterElection: Send + Sync {
    /// Begin participating in the election.
    async fn start_election(&self) -> Result<(), ElectionError>;

    /// Withdraw from the election, relinquishing mastership if held.
    async fn stop_election(&self) -> Result<(), ElectionError>;

    /// Whether this node currently holds mastership.
    fn is_master(&self) -> bool;
}

#[async_trait]
impl<T: MasterElection + ?Sized> MasterElection for std::sync::Arc<T> {
    async fn start_election(&self) -> Result<(), ElectionError> {
        (**self).start_election().await
    }

    async fn stop_election(&self) -> Result<(), ElectionError> {
        (**self).stop_election().await
    }

    fn is_master(&self) -> bool {
        (**self).is_master()
    }
}

/// Edge-triggered gate deciding election participation.
///
/// A node participates iff its local newest tree head is not older than
/// the serving tree head, or no serving head exists yet and the node has
/// any head at all.
#[derive(Debug, Default)]
pub struct ElectionGate {
    participating: bool,
}

impl ElectionGate {
    /// Create a gate in the initial, non-participating state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the gate last commanded participation.
    pub fn is_participating(&self) -> bool {
        self.participating
    }

    /// Whether the node should participate given what is known now.
    pub fn should_participate(
        local: Option<&SignedTreeHead>,
        serving: Option<&SignedTreeHead>,
    ) -> bool {
        match (local, serving) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(local), Some(serving)) => local.is_not_older_than(serving),
        }
    }

    /// Reconcile the gate with the current state, issuing at most one
    /// election command.
    ///
    /// The commanded state is recorded only on success, so a failed
    /// command is retried by whichever event arrives next.
    pub async fn reconcile<E>(
        &mut self,
        local: Option<&SignedTreeHead>,
        serving: Option<&SignedTreeHead>,
        election: &E,
    ) where
        E: MasterElection + ?Sized,
    {
        let desired = Self::should_participate(local, serving);
        if desired == self.participating {
            return;
        }

        let result = if desired {
            election.start_election().await
        } else {
            election.stop_election().await
        };

        match result {
            Ok(()) => {
                self.participating = desired;
                info!(participating = desired, "election gate transition");
            }
            Err(error) => {
                warn!(%error, desired, "election command failed, will retry on next event");
            }
        }
    }
}
