//! The cluster state controller.
//!
//! One spawned event loop owns every piece of controller state: the peer
//! and config projections, the serving tree head as last read from the
//! store, the local node state, and the election gate. Watch events and
//! host commands are the only inputs; the only outputs are leased writes
//! of the local node state, CAS writes of the serving tree head while this
//! node is master, database mirroring, and election commands.

use std::sync::Arc;

use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::calculator::next_serving_sth;
use crate::clock::now_unix_ms;
use crate::database::TreeHeadDatabase;
use crate::election::ElectionGate;
use crate::election::MasterElection;
use crate::fetcher::ContinuousFetcher;
use crate::state::CLUSTER_CONFIG_KEY;
use crate::state::ClusterNodeState;
use crate::state::NODES_PREFIX;
use crate::state::SERVING_STH_KEY;
use crate::state::node_key;
use crate::sth::SignedTreeHead;
use crate::store::ConsistentStore;
use crate::store::LeaseId;
use crate::store::RetryPolicy;
use crate::store::StoreError;
use crate::store::VersionExpectation;
use crate::store::WatchEvent;
use crate::store::WatchEventKind;
use crate::store::WatchStream;
use crate::views::ClusterConfigView;
use crate::views::PeerStateView;

/// Configuration for a [`ClusterStateController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identifier under which this node publishes `/nodes/{node_id}`.
    pub node_id: String,
    /// Initially advertised hostname.
    pub hostname: String,
    /// Initially advertised log frontend port.
    pub log_port: u16,
    /// Capacity of the host command channel.
    pub command_capacity: usize,
    /// Retry policy for store writes and watch re-establishment.
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    /// Config for the given node id with default knobs.
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            hostname: node_id.clone(),
            node_id,
            log_port: 0,
            command_capacity: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Errors surfaced by controller operations.
#[derive(Debug, Snafu)]
pub enum ControllerError {
    /// A store operation failed during startup.
    #[snafu(display("store operation failed: {source}"))]
    Store {
        /// The underlying store error.
        source: StoreError,
    },

    /// The controller's event loop has stopped.
    #[snafu(display("controller is shut down"))]
    ShutDown,
}

enum Command {
    NewTreeHead(SignedTreeHead),
    SetNodeHostPort { host: String, port: u16 },
    Quiesce(oneshot::Sender<()>),
}

/// Handle to a running cluster state controller.
///
/// Cloneable state snapshots are served from watch channels, so reads
/// never block the event loop. Dropping the handle stops the loop.
pub struct ClusterStateController {
    command_tx: mpsc::Sender<Command>,
    local_rx: watch::Receiver<ClusterNodeState>,
    calculated_rx: watch::Receiver<Option<SignedTreeHead>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ClusterStateController {
    /// Start a controller against the given collaborators.
    ///
    /// Grants a lease, publishes the initial `/nodes/{node_id}` entry, and
    /// establishes the three watches before the event loop starts.
    pub async fn spawn(
        config: ControllerConfig,
        store: Arc<dyn ConsistentStore>,
        database: Arc<dyn TreeHeadDatabase>,
        election: Arc<dyn MasterElection>,
        fetcher: Arc<dyn ContinuousFetcher>,
    ) -> Result<Self, ControllerError> {
        let lease = store.grant_lease().await.context(StoreSnafu)?;

        let mirror_floor = match database.latest_tree_head().await {
            Ok(floor) => floor,
            Err(error) => {
                warn!(%error, "failed to read recovered tree head, mirroring from scratch");
                None
            }
        };

        let peers_watch = store.watch(NODES_PREFIX).await.context(StoreSnafu)?;
        let config_watch = store.watch(CLUSTER_CONFIG_KEY).await.context(StoreSnafu)?;
        let serving_watch = store.watch(SERVING_STH_KEY).await.context(StoreSnafu)?;

        let local = ClusterNodeState {
            hostname: config.hostname.clone(),
            log_port: config.log_port,
            newest_sth: None,
            extra: serde_json::Map::new(),
        };
        let (local_tx, local_rx) = watch::channel(local.clone());
        let (calculated_tx, calculated_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let cancel = CancellationToken::new();

        let mut inner = ControllerInner {
            config,
            store,
            database,
            election,
            fetcher,
            lease,
            peers: PeerStateView::new(),
            cluster_config: ClusterConfigView::new(),
            serving: None,
            serving_version: None,
            local,
            gate: ElectionGate::new(),
            mirror_floor,
            dirty: false,
            local_tx,
            calculated_tx,
            peers_watch,
            config_watch,
            serving_watch,
            command_rx,
        };
        inner.publish_local_state().await;

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move { inner.run(loop_cancel).await });

        Ok(Self {
            command_tx,
            local_rx,
            calculated_rx,
            cancel,
            task: Some(task),
        })
    }

    /// Report a new local tree head; the node state is republished and the
    /// serving calculation re-run.
    pub async fn new_tree_head(&self, sth: SignedTreeHead) -> Result<(), ControllerError> {
        self.command_tx
            .send(Command::NewTreeHead(sth))
            .await
            .map_err(|_| ControllerError::ShutDown)
    }

    /// Update the advertised host and port in the published node state.
    pub async fn set_node_host_port(
        &self,
        host: impl Into<String>,
        port: u16,
    ) -> Result<(), ControllerError> {
        self.command_tx
            .send(Command::SetNodeHostPort {
                host: host.into(),
                port,
            })
            .await
            .map_err(|_| ControllerError::ShutDown)
    }

    /// Snapshot of the local node state as currently published.
    pub fn local_node_state(&self) -> ClusterNodeState {
        self.local_rx.borrow().clone()
    }

    /// Latest calculator verdict; `None` means the visible peers cannot
    /// support serving yet.
    pub fn calculated_serving_sth(&self) -> Option<SignedTreeHead> {
        self.calculated_rx.borrow().clone()
    }

    /// Subscribe to calculator verdict changes.
    pub fn subscribe_calculated(&self) -> watch::Receiver<Option<SignedTreeHead>> {
        self.calculated_rx.clone()
    }

    /// Wait until every event enqueued before this call has been processed
    /// and the calculator is idle.
    pub async fn quiesce(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Quiesce(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the event loop, revoking the node lease so this node
    /// disappears from its peers' views.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClusterStateController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ControllerInner {
    config: ControllerConfig,
    store: Arc<dyn ConsistentStore>,
    database: Arc<dyn TreeHeadDatabase>,
    election: Arc<dyn MasterElection>,
    fetcher: Arc<dyn ContinuousFetcher>,
    lease: LeaseId,

    peers: PeerStateView,
    cluster_config: ClusterConfigView,
    /// Serving tree head as last read from the store, with its version.
    serving: Option<SignedTreeHead>,
    serving_version: Option<u64>,
    local: ClusterNodeState,
    gate: ElectionGate,
    /// Newest head already mirrored to the database.
    mirror_floor: Option<SignedTreeHead>,
    /// Set when an event may have changed the calculator's inputs.
    dirty: bool,

    local_tx: watch::Sender<ClusterNodeState>,
    calculated_tx: watch::Sender<Option<SignedTreeHead>>,

    peers_watch: WatchStream,
    config_watch: WatchStream,
    serving_watch: WatchStream,
    command_rx: mpsc::Receiver<Command>,
}

impl ControllerInner {
    async fn run(mut self, cancel: CancellationToken) {
        info!(node_id = %self.config.node_id, "cluster state controller started");

        loop {
            self.settle().await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.peers_watch.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => {
                        let Some(stream) = self.rewatch(NODES_PREFIX).await else { break };
                        self.peers.clear();
                        self.peers_watch = stream;
                        self.dirty = true;
                    }
                },
                event = self.config_watch.recv() => match event {
                    Some(event) => self.handle_config_event(event),
                    None => {
                        let Some(stream) = self.rewatch(CLUSTER_CONFIG_KEY).await else { break };
                        self.cluster_config.clear();
                        self.config_watch = stream;
                        self.dirty = true;
                    }
                },
                event = self.serving_watch.recv() => match event {
                    Some(event) => self.handle_serving_event(event).await,
                    None => {
                        let Some(stream) = self.rewatch(SERVING_STH_KEY).await else { break };
                        self.serving_watch = stream;
                        self.dirty = true;
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        if let Err(error) = self.store.revoke_lease(self.lease).await {
            warn!(%error, "failed to revoke node lease on shutdown");
        }
        info!(node_id = %self.config.node_id, "cluster state controller stopped");
    }

    /// Apply every event already queued, then recompute until nothing
    /// changes. Watch events produced by our own writes are folded in
    /// before the loop blocks again, which is what makes `quiesce`
    /// deterministic.
    async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            loop {
                if let Ok(event) = self.peers_watch.try_recv() {
                    self.handle_peer_event(event).await;
                    progressed = true;
                    continue;
                }
                if let Ok(event) = self.config_watch.try_recv() {
                    self.handle_config_event(event);
                    progressed = true;
                    continue;
                }
                if let Ok(event) = self.serving_watch.try_recv() {
                    self.handle_serving_event(event).await;
                    progressed = true;
                    continue;
                }
                break;
            }

            if self.dirty {
                self.dirty = false;
                self.recompute().await;
                progressed = true;
            }

            if !progressed {
                return;
            }
        }
    }

    async fn handle_peer_event(&mut self, event: WatchEvent) {
        let Some(delta) = self.peers.apply(&event) else {
            return;
        };
        match (&delta.previous, &delta.current) {
            (None, Some(state)) => self.fetcher.add_peer(&delta.node_id, state).await,
            (Some(_), None) => self.fetcher.remove_peer(&delta.node_id).await,
            _ => {}
        }
        self.dirty = true;
    }

    fn handle_config_event(&mut self, event: WatchEvent) {
        if self.cluster_config.apply(&event) {
            debug!(config = ?self.cluster_config.get(), "cluster config changed");
            self.dirty = true;
        }
    }

    async fn handle_serving_event(&mut self, event: WatchEvent) {
        match event.kind {
            WatchEventKind::Remove => {
                self.serving = None;
                self.serving_version = None;
                self.dirty = true;
            }
            WatchEventKind::Initial | WatchEventKind::Add | WatchEventKind::Update => {
                let Some(raw) = event.value.as_deref() else {
                    return;
                };
                match serde_json::from_str::<SignedTreeHead>(raw) {
                    Ok(sth) => {
                        self.serving_version = Some(event.version);
                        if self.serving.as_ref() != Some(&sth) {
                            debug!(serving = %sth, "serving tree head updated");
                            self.mirror_to_database(&sth).await;
                            self.serving = Some(sth);
                            self.dirty = true;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "undecodable serving tree head in store");
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::NewTreeHead(sth) => {
                debug!(tree_head = %sth, "host reported new local tree head");
                self.local.newest_sth = Some(sth);
                let _ = self.local_tx.send(self.local.clone());
                self.publish_local_state().await;
                self.dirty = true;
            }
            Command::SetNodeHostPort { host, port } => {
                self.local.hostname = host;
                self.local.log_port = port;
                let _ = self.local_tx.send(self.local.clone());
                self.publish_local_state().await;
                self.dirty = true;
            }
            Command::Quiesce(reply) => {
                self.settle().await;
                let _ = reply.send(());
            }
        }
    }

    async fn recompute(&mut self) {
        let verdict = next_serving_sth(
            self.peers.peers(),
            self.cluster_config.get(),
            self.serving.as_ref(),
        );

        if let Some(next) = verdict {
            if self.calculated_tx.borrow().as_ref() != Some(&next) {
                let _ = self.calculated_tx.send(Some(next.clone()));
            }
            if self.election.is_master() {
                self.publish_serving(&next).await;
            }
        }

        self.gate
            .reconcile(
                self.local.newest_sth.as_ref(),
                self.serving.as_ref(),
                self.election.as_ref(),
            )
            .await;
    }

    async fn publish_serving(&mut self, next: &SignedTreeHead) {
        let encoded = match serde_json::to_string(next) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(%error, "failed to encode serving tree head");
                return;
            }
        };
        let expected = match self.serving_version {
            Some(version) => VersionExpectation::Version(version),
            None => VersionExpectation::Absent,
        };

        let mut attempt = 0;
        loop {
            match self.store.put(SERVING_STH_KEY, &encoded, expected).await {
                Ok(version) => {
                    info!(
                        serving = %next,
                        version,
                        age_ms = now_unix_ms().saturating_sub(next.timestamp),
                        "published serving tree head"
                    );
                    self.serving = Some(next.clone());
                    self.serving_version = Some(version);
                    self.mirror_to_database(next).await;
                    return;
                }
                Err(StoreError::VersionConflict { actual, .. }) => {
                    debug!(?actual, "serving tree head changed underneath us, refreshing");
                    self.refresh_serving().await;
                    return;
                }
                Err(StoreError::Unavailable { reason }) => {
                    if attempt + 1 >= self.config.retry.max_attempts {
                        warn!(%reason, "store unavailable, deferring publication to the next event");
                        return;
                    }
                    let delay = self.config.retry.backoff(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(%error, "serving tree head publication failed");
                    return;
                }
            }
        }
    }

    /// Re-read the serving tree head after losing a CAS race. The watch
    /// event for the winning write also arrives, but reading directly
    /// keeps the next calculation from acting on a stale value when the
    /// watch lags.
    async fn refresh_serving(&mut self) {
        match self.store.get(SERVING_STH_KEY).await {
            Ok(Some(current)) => match serde_json::from_str::<SignedTreeHead>(&current.value) {
                Ok(sth) => {
                    self.serving_version = Some(current.version);
                    if self.serving.as_ref() != Some(&sth) {
                        self.mirror_to_database(&sth).await;
                        self.serving = Some(sth);
                        self.dirty = true;
                    }
                }
                Err(error) => warn!(%error, "undecodable serving tree head in store"),
            },
            Ok(None) => {
                self.serving = None;
                self.serving_version = None;
                self.dirty = true;
            }
            Err(error) => warn!(%error, "failed to refresh serving tree head"),
        }
    }

    async fn mirror_to_database(&mut self, sth: &SignedTreeHead) {
        if let Some(floor) = &self.mirror_floor {
            if sth.same_serving_point(floor) || !sth.is_not_older_than(floor) {
                return;
            }
        }
        match self.database.store_serving_sth(sth).await {
            Ok(()) => self.mirror_floor = Some(sth.clone()),
            Err(error) => warn!(%error, "failed to mirror serving tree head to database"),
        }
    }

    async fn publish_local_state(&mut self) {
        let encoded = match serde_json::to_string(&self.local) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(%error, "failed to encode local node state");
                return;
            }
        };
        let key = node_key(&self.config.node_id);
        if let Err(error) = self.store.put_leased(&key, &encoded, self.lease).await {
            warn!(%error, key = %key, "failed to publish local node state");
        }
    }

    async fn rewatch(&self, prefix: &str) -> Option<WatchStream> {
        warn!(prefix, "watch stream ended, re-establishing");
        for attempt in 0..self.config.retry.max_attempts {
            match self.store.watch(prefix).await {
                Ok(stream) => return Some(stream),
                Err(error) => {
                    warn!(%error, prefix, attempt, "watch re-establishment failed");
                    tokio::time::sleep(self.config.retry.backoff(attempt)).await;
                }
            }
        }
        None
    }
}
