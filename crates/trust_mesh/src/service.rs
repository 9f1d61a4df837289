//! Mesh Instance
//!
//! All nodes of one tenant running in one process: one task per node,
//! one replicator per node, an in-process transport and a shared
//! reachability matrix. A replication cycle runs the role pipeline
//! (edge, validator, aggregator, seal authority) with a full replication
//! round before every stage, so new evidence crosses the whole mesh in a
//! single cycle when the network allows it.

use credmesh_core::{
    current_timestamp_ms, ClaimStatus, Logstore, MeshConfig, NodeId, NodeRole, Reachability,
};
use credmesh_crypto::{backend_for, Keyring};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::audit::{MeshVerifier, VerificationReport};
use crate::directory::MeshDirectory;
use crate::envelope::{AggregationRecord, EvidenceEnvelope, MeshEntry, SealChainEntry};
use crate::error::{MeshError, MeshResult};
use crate::gossip::{LocalTransport, ReachabilityMatrix, Replicator, SharedReachability};
use crate::node::{spawn_node, MeshNode, NodeHandle, NodePaths, Observation, StepReport};
use crate::projection::latest_aggregations;
use crate::quorum::FederatedQuorumEngine;
use crate::summary::{MeshSummary, NodeStatus};

pub const KEYRING_FILE: &str = "keyring.json";

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub steps: Vec<StepReport>,
    /// Nodes whose step failed, with the error. The rest of the cycle
    /// still ran.
    pub step_failures: Vec<(NodeId, String)>,
    pub replication_failures: usize,
    pub entries_replicated: usize,
}

impl CycleReport {
    pub fn appended(&self) -> usize {
        self.steps.iter().map(|s| s.appended).sum()
    }
}

pub struct MeshInstance {
    config: MeshConfig,
    directory: Arc<MeshDirectory>,
    engine: Arc<FederatedQuorumEngine>,
    reachability: SharedReachability,
    handles: BTreeMap<NodeId, NodeHandle>,
    replicators: BTreeMap<NodeId, Arc<Mutex<Replicator>>>,
    tasks: Vec<JoinHandle<()>>,
    cycle: u64,
}

impl MeshInstance {
    /// Create the tenant directory, keyring and empty node logs.
    ///
    /// An existing keyring is kept as long as it covers every configured
    /// node with the configured scheme.
    pub fn initialize(config: &MeshConfig) -> MeshResult<Keyring> {
        config.validate()?;
        let tenant_dir = config.tenant_dir();
        fs::create_dir_all(&tenant_dir)?;

        let keyring_path = tenant_dir.join(KEYRING_FILE);
        let keyring = if keyring_path.exists() {
            let existing = Keyring::load(&keyring_path)?;
            if existing.scheme != config.signature_scheme {
                return Err(MeshError::Config(format!(
                    "existing keyring uses {:?}, config asks for {:?}",
                    existing.scheme, config.signature_scheme
                )));
            }
            if let Some(missing) = config
                .nodes
                .iter()
                .find(|n| existing.public_key(&n.node_id).is_none())
            {
                return Err(MeshError::Config(format!(
                    "existing keyring has no key for '{}'",
                    missing.node_id
                )));
            }
            existing
        } else {
            let backend = backend_for(config.signature_scheme);
            let keyring = Keyring::generate(
                backend.as_ref(),
                config.nodes.iter().map(|n| n.node_id.as_str()),
            );
            keyring.save(&keyring_path)?;
            keyring
        };

        for spec in &config.nodes {
            let paths = NodePaths::for_node(&tenant_dir, &spec.node_id);
            if let Some(dir) = paths.log.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut targets = vec![&paths.log];
            if spec.role == NodeRole::SealAuthority {
                targets.push(&paths.seal_mirror);
            }
            for path in targets {
                fs::OpenOptions::new().create(true).append(true).open(path)?;
            }
        }

        info!(
            tenant_id = %config.tenant_id,
            nodes = config.nodes.len(),
            path = %tenant_dir.display(),
            "Mesh instance initialized"
        );
        Ok(keyring)
    }

    /// Open every node's log and spawn its task. Requires a tokio runtime.
    pub async fn open(config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        let tenant_dir = config.tenant_dir();
        let keyring = Keyring::load(tenant_dir.join(KEYRING_FILE))?;
        let directory = Arc::new(MeshDirectory::from_config(&config, &keyring)?);
        let engine = Arc::new(FederatedQuorumEngine::new(Arc::new(config.policy.clone()))?);
        let reachability = ReachabilityMatrix::new().shared();

        let mut handles = BTreeMap::new();
        let mut tasks = Vec::new();
        for spec in &config.nodes {
            let node = MeshNode::open(
                &spec.node_id,
                keyring.keypair(&spec.node_id)?,
                directory.clone(),
                engine.clone(),
                &NodePaths::for_node(&tenant_dir, &spec.node_id),
            )?
            .with_sync(config.sync.clone());
            let (handle, task) = spawn_node(node);
            handles.insert(spec.node_id.clone(), handle);
            tasks.push(task);
        }

        let routes: HashMap<NodeId, NodeHandle> =
            handles.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let transport = Arc::new(LocalTransport::new(routes, reachability.clone()));
        let replicators = config
            .nodes
            .iter()
            .map(|spec| {
                let replicator = Replicator::new(
                    spec.node_id.clone(),
                    config.tenant_id.clone(),
                    transport.clone(),
                    &config.replication,
                );
                (spec.node_id.clone(), Arc::new(Mutex::new(replicator)))
            })
            .collect();

        info!(
            tenant_id = %config.tenant_id,
            nodes = handles.len(),
            policy_hash = %engine.policy_hash(),
            trust_level = ?directory.trust_level(),
            "Mesh instance opened"
        );

        Ok(Self {
            config,
            directory,
            engine,
            reachability,
            handles,
            replicators,
            tasks,
            cycle: 0,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn directory(&self) -> &MeshDirectory {
        &self.directory
    }

    pub fn engine(&self) -> &FederatedQuorumEngine {
        &self.engine
    }

    pub fn reachability(&self) -> SharedReachability {
        self.reachability.clone()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    pub fn handle(&self, node_id: &str) -> MeshResult<&NodeHandle> {
        self.handles.get(node_id).ok_or_else(|| MeshError::NodeNotFound {
            node_id: node_id.to_string(),
        })
    }

    pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.values()
    }

    /// Change reachability, e.g. to start or heal a partition.
    pub async fn update_reachability(&self, change: impl FnOnce(&mut ReachabilityMatrix)) {
        let mut matrix = self.reachability.write().await;
        change(&mut *matrix);
        debug!(tenant_id = %self.config.tenant_id, "Reachability updated");
    }

    /// Hand an observation to an edge node. It becomes a claim and an
    /// envelope on the node's next step.
    pub async fn observe(
        &self,
        edge_id: &str,
        claim_id: &str,
        content: &str,
        payload: serde_json::Value,
    ) -> MeshResult<()> {
        let handle = self.handle(edge_id)?;
        if handle.role() != NodeRole::Edge {
            return Err(MeshError::Config(format!("'{}' is not an edge node", edge_id)));
        }
        handle
            .observe(Observation {
                claim_id: claim_id.to_string(),
                content: content.to_string(),
                payload,
                observed_at: current_timestamp_ms(),
            })
            .await
    }

    /// Append a prebuilt envelope to a node's log unchanged.
    pub async fn inject_envelope(&self, node_id: &str, envelope: EvidenceEnvelope) -> MeshResult<()> {
        self.handle(node_id)?.inject_envelope(envelope).await
    }

    async fn replicate_all(&self) -> (usize, usize) {
        let matrix = self.reachability.read().await.clone();
        let mut rounds = JoinSet::new();
        for (node_id, replicator) in &self.replicators {
            if matrix.state(node_id) == Reachability::Offline {
                continue;
            }
            let Some(handle) = self.handles.get(node_id).cloned() else {
                continue;
            };
            let replicator = replicator.clone();
            let directory = self.directory.clone();
            let matrix = matrix.clone();
            rounds.spawn(async move {
                replicator
                    .lock()
                    .await
                    .run_round(&handle, &directory, &matrix)
                    .await
            });
        }

        let (mut failures, mut moved) = (0, 0);
        while let Some(joined) = rounds.join_next().await {
            match joined {
                Ok(report) => {
                    failures += report.failures.len();
                    moved += report.pushed + report.pulled;
                }
                Err(e) => error!(error = %e, "Replication round panicked"),
            }
        }
        (failures, moved)
    }

    /// One full pass of the role pipeline. A failing node is reported in
    /// the cycle report and skipped; every other node still steps.
    pub async fn run_cycle(&mut self) -> MeshResult<CycleReport> {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        for role in NodeRole::PIPELINE {
            let (failures, moved) = self.replicate_all().await;
            report.replication_failures += failures;
            report.entries_replicated += moved;

            let matrix = self.reachability.read().await.clone();
            let now = current_timestamp_ms();
            for handle in self.handles.values().filter(|h| h.role() == role) {
                if matrix.state(handle.node_id()) == Reachability::Offline {
                    continue;
                }
                match handle.step(now).await {
                    Ok(step) => report.steps.push(step),
                    Err(e) => {
                        error!(
                            tenant_id = %self.config.tenant_id,
                            node_id = %handle.node_id(),
                            error = %e,
                            "Node step failed, continuing cycle"
                        );
                        report.step_failures.push((handle.node_id().to_string(), e.to_string()));
                    }
                }
            }
        }

        info!(
            tenant_id = %self.config.tenant_id,
            cycle = report.cycle,
            appended = report.appended(),
            step_failures = report.step_failures.len(),
            replicated = report.entries_replicated,
            replication_failures = report.replication_failures,
            "Cycle complete"
        );
        Ok(report)
    }

    pub async fn run_cycles(&mut self, cycles: usize) -> MeshResult<Vec<CycleReport>> {
        let mut reports = Vec::with_capacity(cycles);
        for _ in 0..cycles {
            reports.push(self.run_cycle().await?);
        }
        Ok(reports)
    }

    /// Latest aggregation for a claim as recorded by one aggregator
    pub fn latest_aggregation(&self, aggregator_id: &str, claim_id: &str) -> MeshResult<Option<AggregationRecord>> {
        let snapshot = self.handle(aggregator_id)?.snapshot();
        Ok(latest_aggregations(&snapshot.entries, Some(aggregator_id))
            .get(claim_id)
            .map(|a| (*a).clone()))
    }

    /// Claim status as decided by one aggregator; UNKNOWN until it decides.
    pub fn claim_status(&self, aggregator_id: &str, claim_id: &str) -> MeshResult<ClaimStatus> {
        Ok(self
            .latest_aggregation(aggregator_id, claim_id)?
            .map(|a| a.resulting_status)
            .unwrap_or_default())
    }

    pub async fn node_status(&self, node_id: &str) -> MeshResult<NodeStatus> {
        let handle = self.handle(node_id)?;
        let descriptor = self.directory.get(node_id).ok_or_else(|| MeshError::NodeNotFound {
            node_id: node_id.to_string(),
        })?;
        let reachability = self.reachability.read().await.state(node_id);
        Ok(NodeStatus::from_snapshot(descriptor, &handle.snapshot(), reachability))
    }

    fn current_logs(&self) -> BTreeMap<NodeId, Vec<MeshEntry>> {
        self.handles
            .iter()
            .map(|(id, h)| (id.clone(), h.snapshot().entries.as_ref().clone()))
            .collect()
    }

    fn current_mirrors(&self) -> MeshResult<BTreeMap<NodeId, Vec<SealChainEntry>>> {
        let tenant_dir = self.config.tenant_dir();
        let mut mirrors = BTreeMap::new();
        for node in self.directory.with_role(NodeRole::SealAuthority) {
            let paths = NodePaths::for_node(&tenant_dir, &node.node_id);
            let chain = Logstore::<SealChainEntry>::read_file(&paths.seal_mirror)?
                .into_iter()
                .map(|e| e.record)
                .collect();
            mirrors.insert(node.node_id.clone(), chain);
        }
        Ok(mirrors)
    }

    /// Run the verifier over the live node snapshots.
    pub fn verify(&self) -> MeshResult<VerificationReport> {
        let logs = self.current_logs();
        let mirrors = self.current_mirrors()?;
        Ok(MeshVerifier::new(&self.directory).verify(&logs, &mirrors))
    }

    pub async fn summary(&self) -> MeshResult<MeshSummary> {
        let logs = self.current_logs();
        let verification = MeshVerifier::new(&self.directory).verify(&logs, &self.current_mirrors()?);
        let mut nodes = Vec::with_capacity(self.handles.len());
        for node_id in self.handles.keys() {
            nodes.push(self.node_status(node_id).await?);
        }
        Ok(MeshSummary::build(
            &self.directory,
            &self.config.sync,
            &self.config.policy.version,
            self.engine.policy_hash(),
            nodes,
            &logs,
            &verification,
        ))
    }

    /// Stop every node task and wait for it to finish.
    pub async fn shutdown(self) {
        for handle in self.handles.values() {
            let _ = handle.shutdown().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Node task ended abnormally");
            }
        }
        info!(tenant_id = %self.config.tenant_id, "Mesh instance stopped");
    }
}
