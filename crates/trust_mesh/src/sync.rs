//! Source Synchronization
//!
//! Checks the evidence stream of every source in the order it reached a
//! node's log. Each source numbers its envelopes; a number that goes
//! backwards is a replay (same content) or a sequence violation (different
//! content) and quarantines the source. Timestamps are held against a
//! per-region watermark and against the receiving node's own clock.
//!
//! The same module reports how evidence is spread across regions and how
//! tightly the readings inside one correlation group move together.

use credmesh_core::{NodeId, SyncConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::directory::MeshDirectory;
use crate::envelope::{EvidenceEnvelope, IntegritySignal, MeshEntry, MeshRecord};

/// Cluster members listed per report
const CLUSTER_MEMBER_LIMIT: usize = 10;
/// Readings needed before a coefficient is computed
const MIN_CORRELATION_SAMPLES: usize = 3;

/// Why the monitor objected to one envelope
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFinding {
    pub signal: IntegritySignal,
    pub detail: String,
}

#[derive(Debug, Default)]
struct SourceState {
    last_seq: u64,
    content_by_seq: BTreeMap<u64, String>,
}

/// Per-node view of every source's ordering, built from log order.
pub struct SyncMonitor<'a> {
    directory: &'a MeshDirectory,
    config: &'a SyncConfig,
    sources: BTreeMap<NodeId, SourceState>,
    watermarks: BTreeMap<String, u64>,
    quarantined: BTreeSet<NodeId>,
    region_counts: BTreeMap<String, usize>,
}

impl<'a> SyncMonitor<'a> {
    pub fn new(directory: &'a MeshDirectory, config: &'a SyncConfig) -> Self {
        Self {
            directory,
            config,
            sources: BTreeMap::new(),
            watermarks: BTreeMap::new(),
            quarantined: BTreeSet::new(),
            region_counts: BTreeMap::new(),
        }
    }

    fn region_of(&self, node_id: &str) -> String {
        self.directory
            .get(node_id)
            .map(|n| n.region.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Check one signature-valid envelope. Envelopes the finding excludes
    /// leave the source's state untouched.
    pub fn observe(&mut self, envelope: &EvidenceEnvelope, now_ms: u64) -> Option<SyncFinding> {
        let signer = envelope.signer_node_id.as_str();

        let horizon = now_ms.saturating_add(self.config.max_clock_skew_ms);
        if envelope.created_at > horizon {
            return Some(SyncFinding {
                signal: IntegritySignal::ClockSkew,
                detail: format!(
                    "created_at {} is {} ms ahead of local clock",
                    envelope.created_at,
                    envelope.created_at - now_ms
                ),
            });
        }

        if envelope.source_seq > 0 {
            let state = self.sources.entry(signer.to_string()).or_default();
            if envelope.source_seq <= state.last_seq {
                let content = envelope.content_digest();
                let replay = state.content_by_seq.get(&envelope.source_seq) == Some(&content);
                let finding = if replay {
                    SyncFinding {
                        signal: IntegritySignal::ReplayDetected,
                        detail: format!("sequence {} replayed with identical content", envelope.source_seq),
                    }
                } else {
                    SyncFinding {
                        signal: IntegritySignal::SequenceViolation,
                        detail: format!(
                            "sequence {} after {} with different content",
                            envelope.source_seq, state.last_seq
                        ),
                    }
                };
                if self.quarantined.insert(signer.to_string()) {
                    debug!(source = %signer, signal = %finding.signal.as_str(), "Source quarantined");
                }
                return Some(finding);
            }
            state.last_seq = envelope.source_seq;
            state
                .content_by_seq
                .insert(envelope.source_seq, envelope.content_digest());
        }

        let region = self.region_of(signer);
        *self.region_counts.entry(region.clone()).or_default() += 1;
        let watermark = self.watermarks.entry(region.clone()).or_insert(0);
        let late = envelope.created_at.saturating_add(self.config.late_arrival_ms) < *watermark;
        let behind = watermark.saturating_sub(envelope.created_at);
        *watermark = (*watermark).max(envelope.created_at);
        late.then(|| SyncFinding {
            signal: IntegritySignal::LateArrival,
            detail: format!("created_at {} ms behind {} watermark", behind, region),
        })
    }

    pub fn quarantined(&self) -> &BTreeSet<NodeId> {
        &self.quarantined
    }

    /// Share of accepted evidence per region
    pub fn authority_distribution(&self) -> BTreeMap<String, f64> {
        authority_shares(&self.region_counts)
    }
}

fn authority_shares(counts: &BTreeMap<String, usize>) -> BTreeMap<String, f64> {
    let total: usize = counts.values().sum();
    counts
        .iter()
        .filter(|_| total > 0)
        .map(|(region, count)| (region.clone(), *count as f64 / total as f64))
        .collect()
}

/// How strongly a group's readings move together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationRisk {
    Low,
    Review,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationCluster {
    pub cluster_id: String,
    pub correlation_group: String,
    /// 1.0 for identical readings, 0.0 once they spread as far as their mean
    pub coefficient: f64,
    pub risk: CorrelationRisk,
    pub samples: usize,
    pub members: Vec<String>,
}

/// `max(0, 1 - stddev / |mean|)`, or 0 below the sample minimum or for a
/// zero mean.
pub fn correlation_coefficient(values: &[f64]) -> f64 {
    if values.len() < MIN_CORRELATION_SAMPLES {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let coefficient = (1.0 - variance.sqrt() / mean.abs()).max(0.0);
    (coefficient * 10_000.0).round() / 10_000.0
}

/// One cluster per correlation group, from the numeric `payload.value`
/// of each envelope.
pub fn correlation_clusters<'e>(
    directory: &MeshDirectory,
    config: &SyncConfig,
    envelopes: impl IntoIterator<Item = &'e EvidenceEnvelope>,
) -> Vec<CorrelationCluster> {
    let mut by_group: BTreeMap<String, Vec<&EvidenceEnvelope>> = BTreeMap::new();
    for envelope in envelopes {
        if let Some(node) = directory.get(&envelope.signer_node_id) {
            by_group
                .entry(node.correlation_group.clone())
                .or_default()
                .push(envelope);
        }
    }

    by_group
        .into_iter()
        .map(|(group, members)| {
            let values: Vec<f64> = members
                .iter()
                .filter_map(|e| e.payload.get("value").and_then(serde_json::Value::as_f64))
                .collect();
            let coefficient = correlation_coefficient(&values);
            let risk = if coefficient >= config.correlation_invalid_threshold {
                CorrelationRisk::Invalid
            } else if coefficient >= config.correlation_review_threshold {
                CorrelationRisk::Review
            } else {
                CorrelationRisk::Low
            };
            let mut ids: Vec<String> = members.iter().map(|e| e.envelope_id.clone()).collect();
            ids.sort();
            ids.truncate(CLUSTER_MEMBER_LIMIT);
            CorrelationCluster {
                cluster_id: format!("corr-{}", group),
                correlation_group: group,
                coefficient,
                risk,
                samples: values.len(),
                members: ids,
            }
        })
        .collect()
}

/// Mesh-wide source health assembled from every node's log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    /// Distinct flagged records per signal
    pub signals: BTreeMap<String, usize>,
    pub quarantined_sources: BTreeSet<NodeId>,
    /// Share of accepted evidence per region
    pub region_authority: BTreeMap<String, f64>,
    pub regions_over_authority: Vec<String>,
    pub correlation: Vec<CorrelationCluster>,
}

impl SourceHealth {
    /// Envelopes are deduplicated across logs; any envelope some node
    /// excluded through a flag is left out of the shares and clusters.
    pub fn from_logs<'l>(
        directory: &MeshDirectory,
        config: &SyncConfig,
        logs: impl IntoIterator<Item = &'l [MeshEntry]>,
    ) -> Self {
        let mut health = SourceHealth::default();
        let mut flagged: BTreeSet<(IntegritySignal, &str)> = BTreeSet::new();
        let mut excluded: BTreeSet<&str> = BTreeSet::new();
        let mut envelopes: BTreeMap<&str, &EvidenceEnvelope> = BTreeMap::new();

        for entries in logs {
            for entry in entries {
                match &entry.record {
                    MeshRecord::Flag(flag) => {
                        flagged.insert((flag.signal, flag.record_ref.as_str()));
                        if flag.signal.excludes_record() {
                            excluded.insert(flag.record_ref.as_str());
                        }
                        if flag.signal.quarantines_source() {
                            health.quarantined_sources.insert(flag.flagged_node.clone());
                        }
                    }
                    MeshRecord::Envelope(env) => {
                        envelopes.entry(env.envelope_id.as_str()).or_insert(env);
                    }
                    _ => {}
                }
            }
        }
        for (signal, _) in &flagged {
            *health.signals.entry(signal.as_str().to_string()).or_default() += 1;
        }

        let accepted: Vec<&EvidenceEnvelope> = envelopes
            .into_iter()
            .filter(|(id, env)| !excluded.contains(id) && directory.get(&env.signer_node_id).is_some())
            .map(|(_, env)| env)
            .collect();

        let mut region_counts: BTreeMap<String, usize> = BTreeMap::new();
        for env in &accepted {
            if let Some(node) = directory.get(&env.signer_node_id) {
                *region_counts.entry(node.region.clone()).or_default() += 1;
            }
        }
        health.region_authority = authority_shares(&region_counts);
        health.regions_over_authority = health
            .region_authority
            .iter()
            .filter(|(_, share)| **share > config.max_region_authority)
            .map(|(region, _)| region.clone())
            .collect();
        health.correlation = correlation_clusters(directory, config, accepted);
        health
    }
}
