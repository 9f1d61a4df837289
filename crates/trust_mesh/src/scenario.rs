//! Scenario Controller
//!
//! Drives named phases against a running mesh instance by changing only
//! the reachability matrix and what edge nodes observe. Outcomes are read
//! back through the instance like any operator would.

use credmesh_core::{current_timestamp_ms, ClaimStatus, NodeId, NodeRole};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::audit::Verdict;
use crate::envelope::EvidenceEnvelope;
use crate::error::{MeshError, MeshResult};
use crate::service::MeshInstance;

pub const BASELINE_CLAIM: &str = "claim-baseline";
pub const PARTITION_CLAIM: &str = "claim-partition";
pub const CORRELATED_CLAIM: &str = "claim-correlated";

/// Reading carried by every report from the correlated group's shared feed
pub const SHARED_FEED_READING: f64 = 118.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    /// Healthy mesh, every edge supports one claim
    Baseline,
    /// One region cut off from everyone else
    Partition,
    /// One correlation group isolated and emitting evidence on its own
    CorrelatedFailure,
    /// Everything reachable again, plus a patch of independent evidence
    Recovery,
}

impl ScenarioPhase {
    pub const ALL: [ScenarioPhase; 4] = [
        ScenarioPhase::Baseline,
        ScenarioPhase::Partition,
        ScenarioPhase::CorrelatedFailure,
        ScenarioPhase::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioPhase::Baseline => "baseline",
            ScenarioPhase::Partition => "partition",
            ScenarioPhase::CorrelatedFailure => "correlated_failure",
            ScenarioPhase::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioPhase {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| MeshError::Config(format!("unknown scenario phase '{}'", s)))
    }
}

/// Mesh state after a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: ScenarioPhase,
    pub cycles: usize,
    /// Nodes cut off from the main mesh during this phase
    pub isolated: BTreeSet<NodeId>,
    /// Status per claim as decided by the observing aggregator
    pub claims: BTreeMap<String, ClaimStatus>,
    pub verification: Verdict,
}

pub struct ScenarioController<'a> {
    mesh: &'a mut MeshInstance,
    observer: NodeId,
    cycles_per_phase: usize,
}

impl<'a> ScenarioController<'a> {
    /// Statuses are read from the first aggregator in the directory.
    pub fn new(mesh: &'a mut MeshInstance) -> MeshResult<Self> {
        let observer = mesh
            .directory()
            .with_role(NodeRole::Aggregator)
            .next()
            .map(|n| n.node_id.clone())
            .ok_or_else(|| MeshError::Config("scenario needs an aggregator".to_string()))?;
        Ok(Self {
            mesh,
            observer,
            cycles_per_phase: 1,
        })
    }

    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles_per_phase = cycles.max(1);
        self
    }

    pub fn observer(&self) -> &str {
        &self.observer
    }

    fn nodes_where(&self, keep: impl Fn(&crate::directory::NodeDescriptor) -> bool) -> Vec<NodeId> {
        self.mesh
            .directory()
            .nodes()
            .filter(|n| keep(*n))
            .map(|n| n.node_id.clone())
            .collect()
    }

    fn observer_descriptor(&self) -> MeshResult<crate::directory::NodeDescriptor> {
        self.mesh
            .directory()
            .get(&self.observer)
            .cloned()
            .ok_or_else(|| MeshError::NodeNotFound {
                node_id: self.observer.clone(),
            })
    }

    async fn observe_all(&self, edges: &[NodeId], claim_id: &str, content: &str, stance: &str) -> MeshResult<()> {
        for (sample, edge) in edges.iter().enumerate() {
            self.mesh
                .observe(edge, claim_id, content, json!({"stance": stance, "sample": sample}))
                .await?;
        }
        Ok(())
    }

    /// Region isolated by the partition phase: the first one the observer
    /// is not in.
    fn partitioned_region(&self) -> MeshResult<String> {
        let observer = self.observer_descriptor()?;
        self.mesh
            .directory()
            .nodes()
            .map(|n| n.region.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .find(|r| *r != observer.region)
            .ok_or_else(|| MeshError::Config("partition needs a second region".to_string()))
    }

    async fn prepare(&self, phase: ScenarioPhase) -> MeshResult<BTreeSet<NodeId>> {
        let edges = self.nodes_where(|n| n.role == NodeRole::Edge);
        match phase {
            ScenarioPhase::Baseline => {
                self.mesh.update_reachability(|m| m.restore_all()).await;
                self.observe_all(&edges, BASELINE_CLAIM, "baseline: sensor array reports nominal", "supports")
                    .await?;
                Ok(BTreeSet::new())
            }
            ScenarioPhase::Partition => {
                let region = self.partitioned_region()?;
                let isolated = self.nodes_where(|n| n.region == region);
                let island = isolated.clone();
                self.mesh
                    .update_reachability(|m| {
                        m.restore_all();
                        m.isolate(&region, island);
                    })
                    .await;
                let outside: Vec<NodeId> = edges.into_iter().filter(|e| !isolated.contains(e)).collect();
                self.observe_all(&outside, PARTITION_CLAIM, "partition: relay tower reports outage", "supports")
                    .await?;
                Ok(isolated.into_iter().collect())
            }
            ScenarioPhase::CorrelatedFailure => {
                let group = self.observer_descriptor()?.correlation_group;
                let isolated = self.nodes_where(|n| n.correlation_group == group);
                let island = isolated.clone();
                self.mesh
                    .update_reachability(|m| {
                        m.restore_all();
                        m.isolate(&group, island);
                    })
                    .await;

                let group_edges: Vec<NodeId> = edges.into_iter().filter(|e| isolated.contains(e)).collect();
                let Some(first_edge) = group_edges.first().cloned() else {
                    return Err(MeshError::Config(format!("group '{}' has no edge node", group)));
                };
                // Every report repeats the shared feed's reading
                let content = "correlated: shared upstream feed reports surge";
                for (sample, edge) in group_edges.iter().enumerate() {
                    self.mesh
                        .observe(
                            edge,
                            CORRELATED_CLAIM,
                            content,
                            json!({"stance": "supports", "sample": sample, "value": SHARED_FEED_READING}),
                        )
                        .await?;
                }
                self.mesh
                    .observe(
                        &first_edge,
                        CORRELATED_CLAIM,
                        content,
                        json!({"stance": "supports", "sample": "repeat", "value": SHARED_FEED_READING}),
                    )
                    .await?;
                self.mesh
                    .observe(
                        &first_edge,
                        CORRELATED_CLAIM,
                        content,
                        json!({"stance": "contradicts", "value": SHARED_FEED_READING}),
                    )
                    .await?;

                // Envelope claiming to come from the edge but signed with a
                // key nobody in the directory holds
                let backend = self.mesh.directory().backend();
                let rogue = backend.generate();
                let forged = EvidenceEnvelope::create(
                    backend,
                    &rogue,
                    &first_edge,
                    CORRELATED_CLAIM,
                    json!({"stance": "supports", "sample": "forged"}),
                    current_timestamp_ms(),
                )?;
                self.mesh.inject_envelope(&first_edge, forged).await?;
                Ok(isolated.into_iter().collect())
            }
            ScenarioPhase::Recovery => {
                self.mesh.update_reachability(|m| m.restore_all()).await;
                let group = self.observer_descriptor()?.correlation_group;
                let patch_edges = self.nodes_where(|n| n.role == NodeRole::Edge && n.correlation_group != group);
                self.observe_all(&patch_edges, CORRELATED_CLAIM, "correlated: shared upstream feed reports surge", "supports")
                    .await?;
                Ok(BTreeSet::new())
            }
        }
    }

    /// Apply a phase and run the configured number of cycles.
    pub async fn run(&mut self, phase: ScenarioPhase) -> MeshResult<PhaseReport> {
        info!(phase = %phase, observer = %self.observer, "Scenario phase starting");
        let isolated = self.prepare(phase).await?;
        self.mesh.run_cycles(self.cycles_per_phase).await?;

        let mut claims = BTreeMap::new();
        for claim_id in [BASELINE_CLAIM, PARTITION_CLAIM, CORRELATED_CLAIM] {
            let known = self
                .mesh
                .handle(&self.observer)?
                .snapshot()
                .entries
                .iter()
                .any(|e| e.record.claim_id() == Some(claim_id));
            if known {
                claims.insert(claim_id.to_string(), self.mesh.claim_status(&self.observer, claim_id)?);
            }
        }
        let verification = self.mesh.verify()?.verdict;

        info!(phase = %phase, claims = ?claims, verification = ?verification, "Scenario phase complete");
        Ok(PhaseReport {
            phase,
            cycles: self.cycles_per_phase,
            isolated,
            claims,
            verification,
        })
    }

    pub async fn run_all(&mut self) -> MeshResult<Vec<PhaseReport>> {
        let mut reports = Vec::with_capacity(ScenarioPhase::ALL.len());
        for phase in ScenarioPhase::ALL {
            reports.push(self.run(phase).await?);
        }
        Ok(reports)
    }
}
