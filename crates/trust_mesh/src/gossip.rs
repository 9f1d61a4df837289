//! Replication Transport
//!
//! Push/pull anti-entropy between node pairs. Each node keeps, per peer:
//! - `acked_seq`: highest local seq the peer has acknowledged
//! - `pulled_seq`: highest peer seq already pulled into the local log
//!
//! A round pushes local entries after `acked_seq` and pulls peer entries
//! after `pulled_seq`. Both directions are bounded by a timeout. A failed
//! or timed-out exchange leaves the peer stale until the next successful
//! round; it never blocks local work and never discards local state.
//!
//! Receivers apply each batch with one atomic logstore write, and cursors
//! only advance after an acknowledged exchange, so a cancelled round is
//! simply repeated and deduplicated by entry id.

use async_trait::async_trait;
use credmesh_core::{current_timestamp_ms, NodeId, Reachability, ReplicationConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::directory::MeshDirectory;
use crate::envelope::MeshEntry;
use crate::node::NodeHandle;

/// Entries pushed from one node to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBatch {
    /// Filled from the route when pushed over HTTP
    #[serde(default)]
    pub tenant_id: String,
    pub from_node: NodeId,
    /// Sender's seq the batch starts after
    pub after_seq: u64,
    pub entries: Vec<MeshEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub node_id: NodeId,
    pub accepted: usize,
    pub duplicates: usize,
    /// Entries failing the entry id integrity check
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub tenant_id: String,
    pub requester: NodeId,
    pub since: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub node_id: NodeId,
    pub entries: Vec<MeshEntry>,
    /// Responder's current last seq
    pub last_seq: u64,
    pub has_more: bool,
}

/// Availability errors. Transient by definition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Peer unreachable: {peer}")]
    Unreachable { peer: NodeId },

    #[error("Exchange with {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: NodeId, timeout_ms: u64 },

    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: NodeId },

    #[error("Peer {peer} rejected exchange: {reason}")]
    Rejected { peer: NodeId, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Moves batches between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, from: &str, peer: &str, batch: PushBatch)
        -> Result<PushAck, TransportError>;

    async fn pull(
        &self,
        from: &str,
        peer: &str,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError>;
}

/// Who can reach whom. Injected into the transport and peer selection;
/// mutated only by the scenario controller or an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReachabilityMatrix {
    states: BTreeMap<NodeId, Reachability>,
    islands: BTreeMap<NodeId, String>,
}

pub type SharedReachability = Arc<RwLock<ReachabilityMatrix>>;

impl ReachabilityMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedReachability {
        Arc::new(RwLock::new(self))
    }

    /// Unlisted nodes are healthy
    pub fn state(&self, node_id: &str) -> Reachability {
        self.states.get(node_id).copied().unwrap_or_default()
    }

    pub fn island(&self, node_id: &str) -> Option<&str> {
        self.islands.get(node_id).map(String::as_str)
    }

    /// Cut `nodes` off from everyone outside `island`.
    pub fn isolate<I, S>(&mut self, island: &str, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        for node in nodes {
            let node = node.into();
            self.states.insert(node.clone(), Reachability::Partitioned);
            self.islands.insert(node, island.to_string());
        }
    }

    pub fn set_offline(&mut self, node_id: &str) {
        self.states.insert(node_id.to_string(), Reachability::Offline);
        self.islands.remove(node_id);
    }

    pub fn restore(&mut self, node_id: &str) {
        self.states.remove(node_id);
        self.islands.remove(node_id);
    }

    pub fn restore_all(&mut self) {
        self.states.clear();
        self.islands.clear();
    }

    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        match (self.state(from), self.state(to)) {
            (Reachability::Offline, _) | (_, Reachability::Offline) => false,
            (Reachability::Healthy, Reachability::Healthy) => true,
            (Reachability::Partitioned, Reachability::Partitioned) => {
                self.island(from) == self.island(to)
            }
            _ => false,
        }
    }
}

/// Peers of `node_id` split by current reachability
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSelection {
    pub reachable: Vec<NodeId>,
    pub unreachable: Vec<NodeId>,
}

pub fn select_peers(
    node_id: &str,
    directory: &MeshDirectory,
    matrix: &ReachabilityMatrix,
) -> PeerSelection {
    let mut selection = PeerSelection::default();
    for peer in directory.peers_of(node_id) {
        if matrix.can_reach(node_id, &peer.node_id) {
            selection.reachable.push(peer.node_id.clone());
        } else {
            selection.unreachable.push(peer.node_id.clone());
        }
    }
    selection
}

/// Local view of one peer
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerView {
    pub acked_seq: u64,
    pub pulled_seq: u64,
    pub last_success_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub live: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReplicationMetrics {
    pub rounds_total: u64,
    pub exchanges_ok_total: u64,
    pub exchanges_failed_total: u64,
    pub timeouts_total: u64,
    pub entries_pushed_total: u64,
    pub entries_pulled_total: u64,
    pub entries_rejected_total: u64,
}

/// Outcome of one replication round
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub pushed: usize,
    pub pulled: usize,
    pub failures: Vec<(NodeId, TransportError)>,
    pub live_peers: BTreeSet<NodeId>,
}

/// Drives push/pull rounds for one node
pub struct Replicator {
    node_id: NodeId,
    tenant_id: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    batch_limit: usize,
    peers: BTreeMap<NodeId, PeerView>,
    metrics: ReplicationMetrics,
}

impl Replicator {
    pub fn new(
        node_id: impl Into<NodeId>,
        tenant_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            tenant_id: tenant_id.into(),
            transport,
            timeout: Duration::from_millis(config.timeout_ms),
            batch_limit: config.batch_limit.max(1),
            peers: BTreeMap::new(),
            metrics: ReplicationMetrics::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_views(&self) -> &BTreeMap<NodeId, PeerView> {
        &self.peers
    }

    pub fn metrics(&self) -> &ReplicationMetrics {
        &self.metrics
    }

    pub fn live_peers(&self) -> BTreeSet<NodeId> {
        self.peers
            .iter()
            .filter(|(_, v)| v.live)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn mark_failure(&mut self, peer: &str, error: TransportError, report: &mut RoundReport) {
        let view = self.peers.entry(peer.to_string()).or_default();
        if view.live {
            info!(node_id = %self.node_id, peer = %peer, error = %error, "Peer view is now stale");
        } else {
            debug!(node_id = %self.node_id, peer = %peer, error = %error, "Peer still unreachable");
        }
        view.live = false;
        view.consecutive_failures = view.consecutive_failures.saturating_add(1);
        self.metrics.exchanges_failed_total += 1;
        if matches!(error, TransportError::Timeout { .. }) {
            self.metrics.timeouts_total += 1;
        }
        report.failures.push((peer.to_string(), error));
    }

    /// One push/pull exchange with every peer, then publish liveness to
    /// the local node.
    pub async fn run_round(
        &mut self,
        local: &NodeHandle,
        directory: &MeshDirectory,
        matrix: &ReachabilityMatrix,
    ) -> RoundReport {
        self.metrics.rounds_total += 1;
        let mut report = RoundReport::default();
        let selection = select_peers(&self.node_id, directory, matrix);

        for peer in &selection.unreachable {
            self.mark_failure(
                peer,
                TransportError::Unreachable { peer: peer.clone() },
                &mut report,
            );
        }

        for peer in &selection.reachable {
            match self.exchange(local, peer).await {
                Ok((pushed, pulled)) => {
                    let view = self.peers.entry(peer.clone()).or_default();
                    if !view.live {
                        info!(node_id = %self.node_id, peer = %peer, "Peer view is live");
                    }
                    view.live = true;
                    view.consecutive_failures = 0;
                    view.last_success_ms = Some(current_timestamp_ms());
                    self.metrics.exchanges_ok_total += 1;
                    report.pushed += pushed;
                    report.pulled += pulled;
                }
                Err(e) => self.mark_failure(peer, e, &mut report),
            }
        }

        report.live_peers = self.live_peers();
        if local.update_liveness(report.live_peers.clone()).await.is_err() {
            debug!(node_id = %self.node_id, "Local node stopped before liveness update");
        }
        report
    }

    async fn exchange(&mut self, local: &NodeHandle, peer: &str) -> Result<(usize, usize), TransportError> {
        let view = self.peers.get(peer).cloned().unwrap_or_default();
        let snapshot = local.snapshot();

        // Push
        let outgoing = snapshot.entries_after(view.acked_seq, self.batch_limit);
        let mut pushed = 0;
        if let Some(last) = outgoing.last().map(|e| e.seq) {
            let batch = PushBatch {
                tenant_id: self.tenant_id.clone(),
                from_node: self.node_id.clone(),
                after_seq: view.acked_seq,
                entries: outgoing.to_vec(),
            };
            let ack = self
                .bounded(peer, self.transport.push(&self.node_id, peer, batch))
                .await?;
            pushed = ack.accepted;
            self.metrics.entries_pushed_total += ack.accepted as u64;
            self.peers.entry(peer.to_string()).or_default().acked_seq = last;
        }

        // Pull
        let request = PullRequest {
            tenant_id: self.tenant_id.clone(),
            requester: self.node_id.clone(),
            since: view.pulled_seq,
            limit: self.batch_limit,
        };
        let response = self
            .bounded(peer, self.transport.pull(&self.node_id, peer, request))
            .await?;
        let mut pulled = 0;
        if let Some(last) = response.entries.last().map(|e| e.seq) {
            let report = local
                .ingest(response.entries)
                .await
                .map_err(|e| TransportError::Protocol(format!("local ingest failed: {}", e)))?;
            pulled = report.accepted;
            self.metrics.entries_pulled_total += report.accepted as u64;
            self.metrics.entries_rejected_total += report.rejected as u64;
            self.peers.entry(peer.to_string()).or_default().pulled_seq = last;
        }
        Ok((pushed, pulled))
    }

    async fn bounded<T>(
        &self,
        peer: &str,
        fut: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                peer: peer.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// In-process transport between node tasks of one mesh instance.
///
/// Consults the shared reachability matrix on every call, so a partition
/// also fails exchanges that were selected before it took effect.
#[derive(Clone)]
pub struct LocalTransport {
    nodes: Arc<HashMap<NodeId, NodeHandle>>,
    reachability: SharedReachability,
}

impl LocalTransport {
    pub fn new(nodes: HashMap<NodeId, NodeHandle>, reachability: SharedReachability) -> Self {
        Self {
            nodes: Arc::new(nodes),
            reachability,
        }
    }

    async fn route(&self, from: &str, peer: &str) -> Result<&NodeHandle, TransportError> {
        if !self.reachability.read().await.can_reach(from, peer) {
            return Err(TransportError::Unreachable {
                peer: peer.to_string(),
            });
        }
        self.nodes.get(peer).ok_or_else(|| TransportError::UnknownPeer {
            peer: peer.to_string(),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn push(
        &self,
        from: &str,
        peer: &str,
        batch: PushBatch,
    ) -> Result<PushAck, TransportError> {
        self.route(from, peer).await?.accept_push(batch).await
    }

    async fn pull(
        &self,
        from: &str,
        peer: &str,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError> {
        self.route(from, peer).await?.serve_pull(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_nodes_reach_each_other() {
        let matrix = ReachabilityMatrix::new();
        assert!(matrix.can_reach("a", "b"));
        assert_eq!(matrix.state("a"), Reachability::Healthy);
    }

    #[test]
    fn test_partition_islands() {
        let mut matrix = ReachabilityMatrix::new();
        matrix.isolate("region-b", ["b1", "b2"]);

        assert!(matrix.can_reach("b1", "b2"));
        assert!(!matrix.can_reach("b1", "a1"));
        assert!(!matrix.can_reach("a1", "b2"));
        assert!(matrix.can_reach("a1", "c1"));

        matrix.isolate("other", ["c1"]);
        assert!(!matrix.can_reach("c1", "b1"));

        matrix.restore_all();
        assert!(matrix.can_reach("a1", "b2"));
    }

    #[test]
    fn test_offline_reaches_nobody() {
        let mut matrix = ReachabilityMatrix::new();
        matrix.set_offline("x");
        assert!(!matrix.can_reach("x", "y"));
        assert!(!matrix.can_reach("y", "x"));
        matrix.restore("x");
        assert!(matrix.can_reach("x", "y"));
    }
}
