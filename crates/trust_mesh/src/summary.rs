//! Tenant summary served to operators and the summary endpoint.

use credmesh_core::{
    ClaimStatus, Logstore, LogstoreHealth, MeshConfig, NodeId, NodeRole, Reachability, SchemeKind,
    SyncConfig,
};
use credmesh_crypto::{Keyring, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::audit::{verify_tenant, Verdict, VerificationReport};
use crate::directory::{MeshDirectory, NodeDescriptor};
use crate::envelope::{AggregationRecord, DecisionReason, MeshEntry, MeshRecord, SealChainEntry};
use crate::error::MeshResult;
use crate::node::{LogSnapshot, NodeMetrics, NodePaths};
use crate::projection::{integrity_flags, latest_aggregations};
use crate::sync::SourceHealth;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub region: String,
    pub correlation_group: String,
    pub reachability: Reachability,
    pub log_length: usize,
    pub last_seq: u64,
    pub live_peers: BTreeSet<NodeId>,
    pub health: LogstoreHealth,
    /// Only known for nodes running in this process
    pub metrics: Option<NodeMetrics>,
}

impl NodeStatus {
    pub fn from_snapshot(descriptor: &NodeDescriptor, snapshot: &LogSnapshot, reachability: Reachability) -> Self {
        Self {
            node_id: descriptor.node_id.clone(),
            role: descriptor.role,
            region: descriptor.region.clone(),
            correlation_group: descriptor.correlation_group.clone(),
            reachability,
            log_length: snapshot.entries.len(),
            last_seq: snapshot.last_seq(),
            live_peers: snapshot.live_peers.clone(),
            health: snapshot.health.clone(),
            metrics: Some(snapshot.metrics.clone()),
        }
    }

    fn from_entries(descriptor: &NodeDescriptor, entries: &[MeshEntry], health: LogstoreHealth) -> Self {
        Self {
            node_id: descriptor.node_id.clone(),
            role: descriptor.role,
            region: descriptor.region.clone(),
            correlation_group: descriptor.correlation_group.clone(),
            reachability: Reachability::Healthy,
            log_length: entries.len(),
            last_seq: entries.last().map(|e| e.seq).unwrap_or(0),
            live_peers: BTreeSet::new(),
            health,
            metrics: None,
        }
    }
}

/// Latest decision on one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSummary {
    pub status: ClaimStatus,
    pub reason: DecisionReason,
    pub aggregator_id: NodeId,
    pub policy_tier: String,
    pub regions_covered: BTreeSet<String>,
    pub groups_covered: BTreeSet<String>,
    pub confirm_count: usize,
    pub deny_count: usize,
    pub needs_review: bool,
}

impl From<&AggregationRecord> for ClaimSummary {
    fn from(a: &AggregationRecord) -> Self {
        Self {
            status: a.resulting_status,
            reason: a.reason,
            aggregator_id: a.aggregator_id.clone(),
            policy_tier: a.policy_tier.clone(),
            regions_covered: a.regions_covered.clone(),
            groups_covered: a.groups_covered.clone(),
            confirm_count: a.confirm_count,
            deny_count: a.deny_count,
            needs_review: a.needs_review,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealSummary {
    pub sealed_by: NodeId,
    pub seal_index: u64,
    pub seal_hash: String,
    pub claim_id: String,
    pub sealed_at: u64,
}

impl From<&SealChainEntry> for SealSummary {
    fn from(s: &SealChainEntry) -> Self {
        Self {
            sealed_by: s.sealed_by.clone(),
            seal_index: s.seal_index,
            seal_hash: s.seal_hash.clone(),
            claim_id: s.aggregation.claim_id.clone(),
            sealed_at: s.sealed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationHealth {
    pub verdict: Verdict,
    pub entries_checked: usize,
    pub seals_checked: usize,
    pub signature_failures: usize,
    pub entry_id_mismatches: usize,
    pub mirror_divergences: usize,
    pub broken_link: Option<String>,
}

impl From<&VerificationReport> for VerificationHealth {
    fn from(r: &VerificationReport) -> Self {
        Self {
            verdict: r.verdict,
            entries_checked: r.entries_checked,
            seals_checked: r.seals_checked,
            signature_failures: r.signature_failures.len(),
            entry_id_mismatches: r.entry_id_mismatches.len(),
            mirror_divergences: r.mirror_divergences.len(),
            broken_link: r
                .first_broken_link
                .as_ref()
                .map(|b| format!("{}#{}: {}", b.authority, b.index, b.error_type)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSummary {
    pub tenant_id: String,
    pub signature_scheme: SchemeKind,
    pub trust_level: TrustLevel,
    pub policy_version: String,
    pub policy_hash: String,
    pub nodes: Vec<NodeStatus>,
    pub claims: BTreeMap<String, ClaimSummary>,
    pub last_aggregation: Option<ClaimSummary>,
    pub last_seal: Option<SealSummary>,
    pub integrity_flags: usize,
    /// Source ordering, region shares and correlation clusters
    pub sources: SourceHealth,
    pub verification: VerificationHealth,
}

impl MeshSummary {
    pub fn build(
        directory: &MeshDirectory,
        sync: &SyncConfig,
        policy_version: &str,
        policy_hash: &str,
        nodes: Vec<NodeStatus>,
        logs: &BTreeMap<NodeId, Vec<MeshEntry>>,
        verification: &VerificationReport,
    ) -> Self {
        let mut claims: BTreeMap<String, &AggregationRecord> = BTreeMap::new();
        let mut last_aggregation: Option<&AggregationRecord> = None;
        let mut last_seal: Option<&SealChainEntry> = None;
        let mut flags = BTreeSet::new();

        for (node_id, entries) in logs {
            let Some(node) = directory.get(node_id) else {
                continue;
            };
            for flag in integrity_flags(entries) {
                flags.insert((flag.raised_by.as_str(), flag.record_ref.as_str()));
            }
            match node.role {
                NodeRole::Aggregator => {
                    for (claim_id, record) in latest_aggregations(entries, Some(node_id.as_str())) {
                        let newer = claims
                            .get(claim_id)
                            .map_or(true, |current| current.computed_at < record.computed_at);
                        if newer {
                            claims.insert(claim_id.to_string(), record);
                        }
                    }
                    let own_last = entries.iter().rev().find_map(|e| match &e.record {
                        MeshRecord::Aggregation(a) if &a.aggregator_id == node_id => Some(a),
                        _ => None,
                    });
                    if let Some(a) = own_last {
                        if last_aggregation.map_or(true, |l| l.computed_at <= a.computed_at) {
                            last_aggregation = Some(a);
                        }
                    }
                }
                NodeRole::SealAuthority => {
                    let own_last = entries.iter().rev().find_map(|e| match &e.record {
                        MeshRecord::Seal(s) if &s.sealed_by == node_id => Some(s),
                        _ => None,
                    });
                    if let Some(s) = own_last {
                        if last_seal.map_or(true, |l| l.sealed_at <= s.sealed_at) {
                            last_seal = Some(s);
                        }
                    }
                }
                _ => {}
            }
        }

        Self {
            tenant_id: directory.tenant_id().to_string(),
            signature_scheme: directory.scheme(),
            trust_level: directory.trust_level(),
            policy_version: policy_version.to_string(),
            policy_hash: policy_hash.to_string(),
            nodes,
            claims: claims
                .into_iter()
                .map(|(id, a)| (id, ClaimSummary::from(a)))
                .collect(),
            last_aggregation: last_aggregation.map(ClaimSummary::from),
            last_seal: last_seal.map(SealSummary::from),
            integrity_flags: flags.len(),
            sources: SourceHealth::from_logs(directory, sync, logs.values().map(Vec::as_slice)),
            verification: VerificationHealth::from(verification),
        }
    }

    /// Summarize persisted state only; nothing is opened for writing.
    pub fn from_disk(config: &MeshConfig) -> MeshResult<Self> {
        let tenant_dir = config.tenant_dir();
        let keyring = Keyring::load(tenant_dir.join(crate::service::KEYRING_FILE))?;
        let directory = MeshDirectory::from_config(config, &keyring)?;
        let policy_hash = config.policy.content_hash()?;

        let mut logs = BTreeMap::new();
        let mut nodes = Vec::new();
        for descriptor in directory.nodes() {
            let paths = NodePaths::for_node(&tenant_dir, &descriptor.node_id);
            let (entries, health) = match Logstore::<MeshRecord>::read_file(&paths.log) {
                Ok(entries) => (entries, LogstoreHealth::Ok),
                Err(e) => (
                    Vec::new(),
                    LogstoreHealth::Corrupted {
                        last_good_seq: None,
                        first_bad_line: 0,
                        error_type: e.to_string(),
                    },
                ),
            };
            nodes.push(NodeStatus::from_entries(descriptor, &entries, health));
            logs.insert(descriptor.node_id.clone(), entries);
        }

        let verification = verify_tenant(config)?;
        Ok(Self::build(
            &directory,
            &config.sync,
            &config.policy.version,
            &policy_hash,
            nodes,
            &logs,
            &verification,
        ))
    }
}
