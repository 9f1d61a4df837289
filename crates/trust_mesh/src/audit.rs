//! Cross-Node Verifier
//!
//! Read-only audit over the visible log state of a tenant's nodes:
//! - re-verifies every envelope and validation signature against the
//!   claimed signer's public key
//! - recomputes every entry id from its record
//! - walks each seal authority's chain from genesis, reporting the first
//!   broken link, and cross-checks it against the authority's mirror file
//! - reports which regions and groups confirmed which claims
//!
//! Nothing here mutates a log. Failures are reported, never corrected.

use credmesh_core::{ClaimStatus, Logstore, MeshConfig, NodeId, NodeRole, Vote};
use credmesh_crypto::{verify_chain, Keyring, VerifyResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{info, warn};

use crate::directory::MeshDirectory;
use crate::envelope::{
    entry_id_matches, AggregationRecord, FlaggedKind, IntegrityFlag, IntegritySignal, MeshEntry,
    MeshRecord, SealChainEntry,
};
use crate::error::MeshResult;
use crate::node::NodePaths;
use crate::quorum::effective_votes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// A record whose signature does not verify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureFinding {
    pub kind: FlaggedKind,
    pub record_ref: String,
    pub signer: NodeId,
    /// Whether some node already raised an integrity flag for it
    pub flagged_in_mesh: bool,
}

/// Result of walking one authority's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub authority: NodeId,
    pub length: usize,
    pub result: VerifyResult,
    pub mirror_length: Option<usize>,
    pub mirror_result: Option<VerifyResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub authority: NodeId,
    pub index: usize,
    pub error_type: String,
}

/// Mirror file and log disagree for an authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorDivergence {
    pub authority: NodeId,
    pub log_length: usize,
    pub mirror_length: usize,
    /// First seal index at which the two differ
    pub first_difference: usize,
}

/// Evidence diversity behind one claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimCoverage {
    pub confirm_regions: BTreeSet<String>,
    pub confirm_groups: BTreeSet<String>,
    pub confirming_validators: BTreeSet<NodeId>,
    pub deny_regions: BTreeSet<String>,
    pub denying_validators: BTreeSet<NodeId>,
    /// Latest aggregated status, UNKNOWN if never aggregated
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub tenant_id: String,
    pub verdict: Verdict,
    pub logs_checked: usize,
    pub entries_checked: usize,
    pub envelopes_checked: usize,
    pub validations_checked: usize,
    pub seals_checked: usize,
    pub integrity_flags: usize,
    /// Logs that could not be read at all
    pub unreadable_logs: BTreeMap<NodeId, String>,
    /// `(node, entry_id)` pairs whose id does not match the record
    pub entry_id_mismatches: Vec<(NodeId, String)>,
    /// Two different seals claiming the same authority and index
    pub forks: Vec<(NodeId, u64)>,
    pub signature_failures: Vec<SignatureFinding>,
    pub chains: Vec<ChainReport>,
    pub first_broken_link: Option<BrokenLink>,
    pub mirror_divergences: Vec<MirrorDivergence>,
    pub coverage: BTreeMap<String, ClaimCoverage>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Stateless verifier bound to a tenant directory
pub struct MeshVerifier<'a> {
    directory: &'a MeshDirectory,
}

impl<'a> MeshVerifier<'a> {
    pub fn new(directory: &'a MeshDirectory) -> Self {
        Self { directory }
    }

    /// Audit node logs and seal mirrors.
    pub fn verify(
        &self,
        logs: &BTreeMap<NodeId, Vec<MeshEntry>>,
        mirrors: &BTreeMap<NodeId, Vec<SealChainEntry>>,
    ) -> VerificationReport {
        let mut report = VerificationReport {
            tenant_id: self.directory.tenant_id().to_string(),
            verdict: Verdict::Pass,
            logs_checked: logs.len(),
            entries_checked: 0,
            envelopes_checked: 0,
            validations_checked: 0,
            seals_checked: 0,
            integrity_flags: 0,
            unreadable_logs: BTreeMap::new(),
            entry_id_mismatches: Vec::new(),
            forks: Vec::new(),
            signature_failures: Vec::new(),
            chains: Vec::new(),
            first_broken_link: None,
            mirror_divergences: Vec::new(),
            coverage: BTreeMap::new(),
        };

        // Distinct records across every log
        let mut seen = HashSet::new();
        let mut records: Vec<&MeshRecord> = Vec::new();
        for (node_id, entries) in logs {
            for entry in entries {
                report.entries_checked += 1;
                if !entry_id_matches(entry) {
                    report
                        .entry_id_mismatches
                        .push((node_id.clone(), entry.entry_id.clone()));
                    continue;
                }
                if seen.insert(entry.entry_id.as_str()) {
                    records.push(&entry.record);
                }
            }
        }

        let flags: Vec<&IntegrityFlag> = records
            .iter()
            .filter_map(|r| match r {
                MeshRecord::Flag(f) => Some(f),
                _ => None,
            })
            .collect();
        report.integrity_flags = flags
            .iter()
            .map(|f| f.record_ref.as_str())
            .collect::<HashSet<_>>()
            .len();
        // Only signature flags account for a signature failure
        let flagged: HashSet<&str> = flags
            .iter()
            .filter(|f| f.signal == IntegritySignal::BadSignature)
            .map(|f| f.record_ref.as_str())
            .collect();

        // (a) signatures
        let mut valid_votes = Vec::new();
        for record in &records {
            match record {
                MeshRecord::Envelope(env) => {
                    report.envelopes_checked += 1;
                    if !self.directory.verify_envelope(env) {
                        report.signature_failures.push(SignatureFinding {
                            kind: FlaggedKind::Envelope,
                            record_ref: env.envelope_id.clone(),
                            signer: env.signer_node_id.clone(),
                            flagged_in_mesh: flagged.contains(env.envelope_id.as_str()),
                        });
                    }
                }
                MeshRecord::Validation(v) => {
                    report.validations_checked += 1;
                    if self.directory.verify_validation(v) {
                        valid_votes.push(v);
                    } else {
                        report.signature_failures.push(SignatureFinding {
                            kind: FlaggedKind::Validation,
                            record_ref: v.validation_id.clone(),
                            signer: v.validator_id.clone(),
                            flagged_in_mesh: flagged.contains(v.validation_id.as_str()),
                        });
                    }
                }
                _ => {}
            }
        }

        // (b) seal chains
        let mut by_authority: BTreeMap<&str, BTreeMap<u64, &SealChainEntry>> = BTreeMap::new();
        for record in &records {
            if let MeshRecord::Seal(seal) = record {
                report.seals_checked += 1;
                let chain = by_authority.entry(seal.sealed_by.as_str()).or_default();
                match chain.get(&seal.seal_index) {
                    Some(existing) if existing.seal_hash != seal.seal_hash => {
                        report.forks.push((seal.sealed_by.clone(), seal.seal_index));
                    }
                    Some(_) => {}
                    None => {
                        chain.insert(seal.seal_index, seal);
                    }
                }
            }
        }
        let authorities: BTreeSet<&str> = self
            .directory
            .with_role(NodeRole::SealAuthority)
            .map(|n| n.node_id.as_str())
            .chain(by_authority.keys().copied())
            .collect();

        for authority in authorities {
            let chain: Vec<SealChainEntry> = by_authority
                .get(authority)
                .map(|c| c.values().map(|s| (*s).clone()).collect())
                .unwrap_or_default();
            let result = verify_chain(&chain);
            if let VerifyResult::Error { error_type, index } = &result {
                warn!(authority = %authority, index, error = %error_type, "Seal chain broken");
                if report.first_broken_link.is_none() {
                    report.first_broken_link = Some(BrokenLink {
                        authority: authority.to_string(),
                        index: *index,
                        error_type: error_type.clone(),
                    });
                }
            }

            let mirror = mirrors.get(authority);
            let mirror_result = mirror.map(|m| verify_chain(m));
            if let Some(mirror) = mirror {
                let differs_at = chain
                    .iter()
                    .zip(mirror.iter())
                    .position(|(a, b)| a != b)
                    .or_else(|| (chain.len() != mirror.len()).then(|| chain.len().min(mirror.len())));
                if let Some(first_difference) = differs_at {
                    warn!(authority = %authority, first_difference, "Seal mirror diverges from log");
                    report.mirror_divergences.push(MirrorDivergence {
                        authority: authority.to_string(),
                        log_length: chain.len(),
                        mirror_length: mirror.len(),
                        first_difference,
                    });
                }
            }
            report.chains.push(ChainReport {
                authority: authority.to_string(),
                length: chain.len(),
                result,
                mirror_length: mirror.map(Vec::len),
                mirror_result,
            });
        }

        // (c) coverage
        let mut latest_status: BTreeMap<&str, &AggregationRecord> = BTreeMap::new();
        for record in &records {
            if let MeshRecord::Aggregation(a) = record {
                match latest_status.get(a.claim_id.as_str()) {
                    Some(current)
                        if (current.computed_at, &current.aggregation_id)
                            >= (a.computed_at, &a.aggregation_id) => {}
                    _ => {
                        latest_status.insert(a.claim_id.as_str(), a);
                    }
                }
            }
        }
        let mut votes_by_claim: BTreeMap<&str, Vec<_>> = BTreeMap::new();
        for vote in valid_votes {
            votes_by_claim.entry(vote.claim_id.as_str()).or_default().push(vote);
        }
        let claims: BTreeSet<&str> = records.iter().filter_map(|r| r.claim_id()).collect();
        for claim_id in claims {
            let mut coverage = ClaimCoverage {
                status: latest_status
                    .get(claim_id)
                    .map(|a| a.resulting_status)
                    .unwrap_or_default(),
                ..ClaimCoverage::default()
            };
            let votes = votes_by_claim.remove(claim_id).unwrap_or_default();
            for (validator_id, vote) in effective_votes(votes) {
                let Some(node) = self.directory.get(validator_id) else {
                    continue;
                };
                match vote.vote {
                    Vote::Confirm => {
                        coverage.confirm_regions.insert(node.region.clone());
                        coverage.confirm_groups.insert(node.correlation_group.clone());
                        coverage.confirming_validators.insert(node.node_id.clone());
                    }
                    Vote::Deny => {
                        coverage.deny_regions.insert(node.region.clone());
                        coverage.denying_validators.insert(node.node_id.clone());
                    }
                    Vote::Abstain => {}
                }
            }
            report.coverage.insert(claim_id.to_string(), coverage);
        }

        report.verdict = self.verdict(&report);
        info!(
            tenant_id = %report.tenant_id,
            verdict = ?report.verdict,
            entries = report.entries_checked,
            seals = report.seals_checked,
            "Verification complete"
        );
        report
    }

    /// Flagged signature failures were already caught and excluded by the
    /// mesh; everything else fails the audit.
    fn verdict(&self, report: &VerificationReport) -> Verdict {
        let clean = report.unreadable_logs.is_empty()
            && report.entry_id_mismatches.is_empty()
            && report.forks.is_empty()
            && report.first_broken_link.is_none()
            && report.mirror_divergences.is_empty()
            && report
                .chains
                .iter()
                .all(|c| c.mirror_result.as_ref().map_or(true, VerifyResult::is_ok))
            && report.signature_failures.iter().all(|f| f.flagged_in_mesh);
        if clean {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

/// Run the verifier over a tenant's persisted state without opening any
/// log for writing.
pub fn verify_tenant(config: &MeshConfig) -> MeshResult<VerificationReport> {
    let tenant_dir = config.tenant_dir();
    let keyring = Keyring::load(tenant_dir.join(crate::service::KEYRING_FILE))?;
    let directory = MeshDirectory::from_config(config, &keyring)?;

    let mut logs = BTreeMap::new();
    let mut mirrors = BTreeMap::new();
    let mut unreadable = BTreeMap::new();
    for spec in &config.nodes {
        let paths = NodePaths::for_node(&tenant_dir, &spec.node_id);
        match Logstore::<MeshRecord>::read_file(&paths.log) {
            Ok(entries) => {
                logs.insert(spec.node_id.clone(), entries);
            }
            Err(e) => {
                warn!(node_id = %spec.node_id, error = %e, "Log unreadable");
                unreadable.insert(spec.node_id.clone(), e.to_string());
            }
        }
        if spec.role == NodeRole::SealAuthority {
            match Logstore::<SealChainEntry>::read_file(&paths.seal_mirror) {
                Ok(entries) => {
                    mirrors.insert(
                        spec.node_id.clone(),
                        entries.into_iter().map(|e| e.record).collect::<Vec<_>>(),
                    );
                }
                Err(e) => {
                    unreadable.insert(format!("{}/seal_chain", spec.node_id), e.to_string());
                }
            }
        }
    }

    let mut report = MeshVerifier::new(&directory).verify(&logs, &mirrors);
    if !unreadable.is_empty() {
        report.unreadable_logs = unreadable;
        report.verdict = Verdict::Fail;
    }
    Ok(report)
}
