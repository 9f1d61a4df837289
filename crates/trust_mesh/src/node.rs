//! Mesh Node
//!
//! A node has exactly one role, owns one append-only log and runs as one
//! tokio task. Role behaviour lives in the `*_records` functions below: each
//! is a pure function of the node's current log plus its context (keys,
//! directory, policy engine, liveness view and the current time), so a step
//! can be replayed from the log alone.
//!
//! Other tasks talk to a node only through its [`NodeHandle`]: commands go
//! over an mpsc queue, reads come from a `watch` snapshot that the task
//! republishes after every mutation.

use credmesh_core::{
    canonical_json, digest_hex, ledger::entries_after, Logstore, LogstoreHealth, NodeId,
    NodeRole, PendingEntry, SyncConfig, Vote,
};
use credmesh_crypto::{compute_seal_hash, compute_snapshot_hash, SigningKeypair, GENESIS_MARKER};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::directory::{MeshDirectory, NodeDescriptor};
use crate::envelope::{
    entry_id_matches, AggregationRecord, ClaimRecord, EvidenceEnvelope, FlaggedKind,
    IntegrityFlag, IntegritySignal, MeshEntry, MeshRecord, SealChainEntry, SourceStamp,
    ValidationRecord, VoteDraft,
};
use crate::error::{MeshError, MeshResult};
use crate::gossip::{PullRequest, PullResponse, PushAck, PushBatch, TransportError};
use crate::quorum::{FederatedQuorumEngine, QuorumInput};
use crate::sync::SyncMonitor;

pub const COMMAND_QUEUE_DEPTH: usize = 256;

/// Raw observation handed to an edge node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub claim_id: String,
    pub content: String,
    pub payload: serde_json::Value,
    pub observed_at: u64,
}

/// How a validator reads one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stance {
    Supports,
    Contradicts,
    Inconclusive,
}

/// Validator evaluation hook.
pub trait ValidatorHeuristic: Send + Sync {
    fn assess(&self, envelope: &EvidenceEnvelope) -> Stance;
}

/// Reads `payload.stance`: `"supports"` or `"contradicts"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StanceHeuristic;

impl ValidatorHeuristic for StanceHeuristic {
    fn assess(&self, envelope: &EvidenceEnvelope) -> Stance {
        match envelope
            .payload
            .get("stance")
            .and_then(serde_json::Value::as_str)
        {
            Some("supports") => Stance::Supports,
            Some("contradicts") => Stance::Contradicts,
            _ => Stance::Inconclusive,
        }
    }
}

/// Inputs of a role step other than the log itself
pub struct RoleContext<'a> {
    pub node_id: &'a str,
    pub keypair: &'a SigningKeypair,
    pub directory: &'a MeshDirectory,
    pub engine: &'a FederatedQuorumEngine,
    pub heuristic: &'a dyn ValidatorHeuristic,
    pub sync: &'a SyncConfig,
    /// Peers whose last replication exchange succeeded
    pub live_peers: &'a BTreeSet<NodeId>,
    pub now_ms: u64,
}

impl RoleContext<'_> {
    fn flag(
        &self,
        flagged_node: &str,
        kind: FlaggedKind,
        signal: IntegritySignal,
        record_ref: &str,
        reason: &str,
    ) -> MeshRecord {
        warn!(
            node_id = %self.node_id,
            flagged_node = %flagged_node,
            record_ref = %record_ref,
            signal = %signal.as_str(),
            excluded = signal.excludes_record(),
            reason = %reason,
            "Integrity flag raised"
        );
        MeshRecord::Flag(IntegrityFlag {
            raised_by: self.node_id.to_string(),
            flagged_node: flagged_node.to_string(),
            record_kind: kind,
            signal,
            record_ref: record_ref.to_string(),
            reason: reason.to_string(),
            raised_at: self.now_ms,
        })
    }
}

/// Flags this node already raised, by record ref
fn own_flags<'a>(node_id: &str, log: &'a [MeshEntry]) -> BTreeMap<&'a str, IntegritySignal> {
    log.iter()
        .filter_map(|e| match &e.record {
            MeshRecord::Flag(f) if f.raised_by == node_id => Some((f.record_ref.as_str(), f.signal)),
            _ => None,
        })
        .collect()
}

/// Edge: record first sightings of claims and sign one envelope per
/// observation, numbered after the last envelope this edge signed.
pub fn edge_records(
    ctx: &RoleContext<'_>,
    log: &[MeshEntry],
    observations: &[Observation],
) -> MeshResult<Vec<MeshRecord>> {
    let mut claim_content: BTreeMap<&str, &str> = BTreeMap::new();
    let mut last_seq = 0;
    for entry in log {
        match &entry.record {
            MeshRecord::Claim(c) => {
                claim_content.entry(c.claim_id.as_str()).or_insert(c.content.as_str());
            }
            MeshRecord::Envelope(env) if env.signer_node_id == ctx.node_id => {
                last_seq = last_seq.max(env.source_seq);
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    for observation in observations {
        if !claim_content.contains_key(observation.claim_id.as_str()) {
            claim_content.insert(&observation.claim_id, &observation.content);
            out.push(MeshRecord::Claim(ClaimRecord {
                claim_id: observation.claim_id.clone(),
                content: observation.content.clone(),
                submitted_by: ctx.node_id.to_string(),
                submitted_at: observation.observed_at,
            }));
        }
        let content = claim_content.get(observation.claim_id.as_str()).copied();
        last_seq += 1;
        let stamp = SourceStamp {
            source_seq: last_seq,
            ttl_ms: ctx
                .engine
                .tier_for(&observation.claim_id, content)
                .and_then(|tier| tier.envelope_ttl_ms),
        };
        let envelope = EvidenceEnvelope::create_stamped(
            ctx.directory.backend(),
            ctx.keypair,
            ctx.node_id,
            &observation.claim_id,
            observation.payload.clone(),
            observation.observed_at,
            stamp,
        )?;
        out.push(MeshRecord::Envelope(envelope));
    }
    Ok(out)
}

#[derive(Default)]
struct EvidenceTally {
    accepted: BTreeSet<String>,
    supports: usize,
    contradicts: usize,
    rejected: usize,
    expired: usize,
}

/// Validator: verify every envelope, run the source sync checks in log
/// order, vote per claim from the valid unexpired ones, and re-vote only
/// when the verdict changes.
pub fn validator_records(ctx: &RoleContext<'_>, log: &[MeshEntry]) -> MeshResult<Vec<MeshRecord>> {
    let mut previous: BTreeMap<&str, &ValidationRecord> = BTreeMap::new();
    for entry in log {
        if let MeshRecord::Validation(v) = &entry.record {
            if v.validator_id != ctx.node_id {
                continue;
            }
            match previous.get(v.claim_id.as_str()) {
                Some(current)
                    if (current.revision, &current.validation_id)
                        >= (v.revision, &v.validation_id) => {}
                _ => {
                    previous.insert(v.claim_id.as_str(), v);
                }
            }
        }
    }
    let mut flagged = own_flags(ctx.node_id, log);
    let mut monitor = SyncMonitor::new(ctx.directory, ctx.sync);

    let mut out = Vec::new();
    let mut tallies: BTreeMap<&str, EvidenceTally> = BTreeMap::new();
    for entry in log {
        let MeshRecord::Envelope(env) = &entry.record else {
            continue;
        };
        let tally = tallies.entry(env.claim_id.as_str()).or_default();

        // Sync exclusions stick; signatures are rechecked every step
        let prior = flagged.get(env.envelope_id.as_str()).copied();
        if prior.is_some_and(|s| s != IntegritySignal::BadSignature && s.excludes_record()) {
            tally.rejected += 1;
            continue;
        }
        if !ctx.directory.verify_envelope(env) {
            tally.rejected += 1;
            if prior.is_none() {
                flagged.insert(env.envelope_id.as_str(), IntegritySignal::BadSignature);
                out.push(ctx.flag(
                    &env.signer_node_id,
                    FlaggedKind::Envelope,
                    IntegritySignal::BadSignature,
                    &env.envelope_id,
                    "envelope signature, payload hash or id does not verify",
                ));
            }
            continue;
        }
        if let Some(finding) = monitor.observe(env, ctx.now_ms) {
            if !flagged.contains_key(env.envelope_id.as_str()) {
                flagged.insert(env.envelope_id.as_str(), finding.signal);
                out.push(ctx.flag(
                    &env.signer_node_id,
                    FlaggedKind::Envelope,
                    finding.signal,
                    &env.envelope_id,
                    &finding.detail,
                ));
            }
            if finding.signal.excludes_record() {
                tally.rejected += 1;
                continue;
            }
        }
        if env.is_expired(ctx.now_ms) {
            tally.expired += 1;
            continue;
        }
        tally.accepted.insert(env.envelope_id.clone());
        match ctx.heuristic.assess(env) {
            Stance::Supports => tally.supports += 1,
            Stance::Contradicts => tally.contradicts += 1,
            Stance::Inconclusive => {}
        }
    }

    for (claim_id, tally) in tallies {
        let last = previous.get(claim_id);
        // Nothing usable; expiry still withdraws an earlier vote
        if tally.accepted.is_empty() && (tally.expired == 0 || last.is_none()) {
            continue;
        }
        let vote = if tally.supports > tally.contradicts {
            Vote::Confirm
        } else if tally.contradicts > tally.supports {
            Vote::Deny
        } else {
            Vote::Abstain
        };

        if last.is_some_and(|v| v.vote == vote) {
            continue;
        }
        let revision = last.map(|v| v.revision + 1).unwrap_or(1);
        let draft = VoteDraft {
            claim_id: claim_id.to_string(),
            vote,
            revision,
            reasons: vec![
                format!("valid_envelopes:{}", tally.accepted.len()),
                format!("supports:{}", tally.supports),
                format!("contradicts:{}", tally.contradicts),
                format!("rejected:{}", tally.rejected),
                format!("expired:{}", tally.expired),
            ],
            envelope_ids: tally.accepted.into_iter().collect(),
        };
        debug!(node_id = %ctx.node_id, claim_id = %claim_id, vote = ?vote, revision, "Casting vote");
        let record = ValidationRecord::create(
            ctx.directory.backend(),
            ctx.keypair,
            ctx.node_id,
            draft,
            ctx.now_ms,
        )?;
        out.push(MeshRecord::Validation(record));
    }
    if !monitor.quarantined().is_empty() {
        debug!(node_id = %ctx.node_id, quarantined = ?monitor.quarantined(), "Quarantined sources");
    }
    Ok(out)
}

/// Aggregator: run the quorum engine over verified votes of live
/// validators and append a record whenever a claim's outcome changes.
pub fn aggregator_records(ctx: &RoleContext<'_>, log: &[MeshEntry]) -> MeshResult<Vec<MeshRecord>> {
    let mut flagged = own_flags(ctx.node_id, log);
    let mut contents: BTreeMap<&str, &str> = BTreeMap::new();
    let mut votes: BTreeMap<&str, Vec<&ValidationRecord>> = BTreeMap::new();
    let mut last_digest: BTreeMap<&str, &str> = BTreeMap::new();
    let mut out = Vec::new();

    for entry in log {
        match &entry.record {
            MeshRecord::Claim(c) => {
                contents.entry(c.claim_id.as_str()).or_insert(c.content.as_str());
            }
            MeshRecord::Validation(v) => {
                if ctx.directory.verify_validation(v) {
                    votes.entry(v.claim_id.as_str()).or_default().push(v);
                } else if !flagged.contains_key(v.validation_id.as_str()) {
                    flagged.insert(v.validation_id.as_str(), IntegritySignal::BadSignature);
                    out.push(ctx.flag(
                        &v.validator_id,
                        FlaggedKind::Validation,
                        IntegritySignal::BadSignature,
                        &v.validation_id,
                        "validation signature or id does not verify",
                    ));
                }
            }
            MeshRecord::Aggregation(a) if a.aggregator_id == ctx.node_id => {
                last_digest.insert(a.claim_id.as_str(), a.outcome_digest.as_str());
            }
            _ => {}
        }
    }

    let live: BTreeSet<NodeId> = ctx
        .directory
        .with_role(NodeRole::Validator)
        .filter(|n| n.node_id == ctx.node_id || ctx.live_peers.contains(&n.node_id))
        .map(|n| n.node_id.clone())
        .collect();

    for (claim_id, validations) in votes {
        let input = QuorumInput {
            claim_id,
            content: contents.get(claim_id).copied(),
            validations,
            live_validators: Some(&live),
        };
        let outcome = match ctx.engine.evaluate(ctx.directory, &input) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(node_id = %ctx.node_id, claim_id = %claim_id, error = %e, "Quorum evaluation halted for claim");
                continue;
            }
        };
        let outcome_digest = outcome.digest();
        if last_digest.get(claim_id) == Some(&outcome_digest.as_str()) {
            continue;
        }
        info!(
            node_id = %ctx.node_id,
            claim_id = %claim_id,
            status = %outcome.resulting_status,
            reason = ?outcome.reason,
            "Claim status changed"
        );
        let aggregation_id = format!(
            "agg-{}",
            &digest_hex(format!("{}|{}|{}", ctx.node_id, outcome_digest, ctx.now_ms).as_bytes())[..24]
        );
        out.push(MeshRecord::Aggregation(AggregationRecord {
            aggregation_id,
            aggregator_id: ctx.node_id.to_string(),
            claim_id: outcome.claim_id,
            policy_tier: outcome.policy_tier,
            policy_hash: ctx.engine.policy_hash().to_string(),
            quorum_met: outcome.quorum_met,
            resulting_status: outcome.resulting_status,
            reason: outcome.reason,
            regions_covered: outcome.regions_covered,
            groups_covered: outcome.groups_covered,
            confirm_count: outcome.confirm_count,
            deny_count: outcome.deny_count,
            abstain_count: outcome.abstain_count,
            eligible_validators: outcome.eligible_validators,
            out_of_band_confirmed: outcome.out_of_band_confirmed,
            needs_review: outcome.needs_review,
            trust_level: outcome.trust_level,
            outcome_digest,
            computed_at: ctx.now_ms,
        }));
    }
    Ok(out)
}

/// Seal authority: extend this authority's chain with every aggregation
/// it has not sealed yet, in log order.
pub fn seal_records(ctx: &RoleContext<'_>, log: &[MeshEntry]) -> MeshResult<Vec<SealChainEntry>> {
    let mut sealed: BTreeSet<&str> = BTreeSet::new();
    let mut last: Option<&SealChainEntry> = None;
    for entry in log {
        if let MeshRecord::Seal(s) = &entry.record {
            if s.sealed_by == ctx.node_id {
                sealed.insert(s.aggregation.aggregation_id.as_str());
                last = Some(s);
            }
        }
    }

    let mut prev = last
        .map(|s| s.seal_hash.clone())
        .unwrap_or_else(|| GENESIS_MARKER.to_string());
    let mut seal_index = last.map(|s| s.seal_index + 1).unwrap_or(0);
    let mut out = Vec::new();

    for entry in log {
        let MeshRecord::Aggregation(aggregation) = &entry.record else {
            continue;
        };
        if !sealed.insert(aggregation.aggregation_id.as_str()) {
            continue;
        }
        let canonical = canonical_json(aggregation)?;
        let snapshot_hash = compute_snapshot_hash(&canonical);
        let seal_hash = compute_seal_hash(&prev, &aggregation.policy_hash, &snapshot_hash, &canonical);
        out.push(SealChainEntry {
            seal_index,
            seal_hash: seal_hash.clone(),
            prev_seal_hash: std::mem::replace(&mut prev, seal_hash),
            policy_hash: aggregation.policy_hash.clone(),
            snapshot_hash,
            sealed_at: ctx.now_ms,
            sealed_by: ctx.node_id.to_string(),
            aggregation: aggregation.clone(),
        });
        seal_index += 1;
    }
    Ok(out)
}

/// On-disk locations of one node's state
#[derive(Debug, Clone, PartialEq)]
pub struct NodePaths {
    pub log: PathBuf,
    pub seal_mirror: PathBuf,
}

impl NodePaths {
    /// `<tenant_dir>/<node_id>/{log.jsonl,seal_chain.jsonl}`
    pub fn for_node(tenant_dir: &Path, node_id: &str) -> Self {
        let dir = tenant_dir.join(node_id);
        Self {
            log: dir.join("log.jsonl"),
            seal_mirror: dir.join("seal_chain.jsonl"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub steps_total: u64,
    pub records_produced_total: u64,
    pub entries_ingested_total: u64,
    pub duplicates_total: u64,
    pub rejected_total: u64,
    pub integrity_flags_total: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub appended: usize,
    pub last_seq: u64,
}

/// Point-in-time view of a node, published after every mutation
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub entries: Arc<Vec<MeshEntry>>,
    pub live_peers: BTreeSet<NodeId>,
    pub health: LogstoreHealth,
    pub metrics: NodeMetrics,
}

impl LogSnapshot {
    pub fn last_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn entries_after(&self, after: u64, limit: usize) -> &[MeshEntry] {
        entries_after(&self.entries, after, limit)
    }
}

/// A node's state and role logic. Owned by its task once spawned.
pub struct MeshNode {
    descriptor: NodeDescriptor,
    keypair: SigningKeypair,
    directory: Arc<MeshDirectory>,
    engine: Arc<FederatedQuorumEngine>,
    heuristic: Arc<dyn ValidatorHeuristic>,
    sync: SyncConfig,
    log: Logstore<MeshRecord>,
    seal_mirror: Option<Logstore<SealChainEntry>>,
    observations: Vec<Observation>,
    live_peers: BTreeSet<NodeId>,
    metrics: NodeMetrics,
}

impl MeshNode {
    /// Open (or create) the node's log and, for seal authorities, its
    /// chain mirror. Both go through the startup continuity check.
    pub fn open(
        node_id: &str,
        keypair: SigningKeypair,
        directory: Arc<MeshDirectory>,
        engine: Arc<FederatedQuorumEngine>,
        paths: &NodePaths,
    ) -> MeshResult<Self> {
        let descriptor = directory
            .get(node_id)
            .cloned()
            .ok_or_else(|| MeshError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        if keypair.public() != descriptor.public_key.as_slice() {
            return Err(MeshError::Config(format!(
                "keypair for '{}' does not match its directory public key",
                node_id
            )));
        }

        let log = Logstore::open(&paths.log, node_id)?;
        let seal_mirror = match descriptor.role {
            NodeRole::SealAuthority => Some(Logstore::open(&paths.seal_mirror, node_id)?),
            _ => None,
        };

        let mut node = Self {
            descriptor,
            keypair,
            directory,
            engine,
            heuristic: Arc::new(StanceHeuristic),
            sync: SyncConfig::default(),
            log,
            seal_mirror,
            observations: Vec::new(),
            live_peers: BTreeSet::new(),
            metrics: NodeMetrics::default(),
        };
        node.reconcile_seal_mirror()?;
        info!(
            node_id = %node.descriptor.node_id,
            role = %node.descriptor.role,
            entries = node.log.len(),
            "Mesh node opened"
        );
        Ok(node)
    }

    pub fn with_heuristic(mut self, heuristic: Arc<dyn ValidatorHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.descriptor.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.descriptor.role
    }

    pub fn entries(&self) -> &[MeshEntry] {
        self.log.entries()
    }

    /// This authority's mirrored chain, if it is a seal authority
    pub fn seal_mirror_chain(&self) -> Option<Vec<SealChainEntry>> {
        self.seal_mirror
            .as_ref()
            .map(|m| m.entries().iter().map(|e| e.record.clone()).collect())
    }

    /// Own seals present in the log but missing from the mirror are
    /// copied over; this covers a crash between the two writes.
    fn reconcile_seal_mirror(&mut self) -> MeshResult<()> {
        let Some(mirror) = self.seal_mirror.as_mut() else {
            return Ok(());
        };
        let missing: Vec<PendingEntry<SealChainEntry>> = self
            .log
            .entries()
            .iter()
            .filter_map(|e| match &e.record {
                MeshRecord::Seal(s) if s.sealed_by == self.descriptor.node_id => Some(s),
                _ => None,
            })
            .filter(|s| !mirror.contains(&s.seal_hash))
            .map(|s| PendingEntry {
                entry_id: s.seal_hash.clone(),
                origin: self.descriptor.node_id.clone(),
                record: s.clone(),
            })
            .collect();
        if !missing.is_empty() {
            warn!(
                node_id = %self.descriptor.node_id,
                missing = missing.len(),
                "Seal mirror behind log, catching up"
            );
            mirror.append_batch(missing)?;
        }
        Ok(())
    }

    pub fn observe(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    /// Append an already-signed envelope exactly as given.
    pub fn inject_envelope(&mut self, envelope: EvidenceEnvelope) -> MeshResult<()> {
        let record = MeshRecord::Envelope(envelope);
        let entry_id = record.entry_id()?;
        self.log
            .append(entry_id, self.descriptor.node_id.clone(), record)?;
        Ok(())
    }

    pub fn set_live_peers(&mut self, live_peers: BTreeSet<NodeId>) {
        self.live_peers = live_peers;
    }

    /// Run this node's role once over its current log.
    pub fn step(&mut self, now_ms: u64) -> MeshResult<StepReport> {
        let records = {
            let ctx = RoleContext {
                node_id: &self.descriptor.node_id,
                keypair: &self.keypair,
                directory: &self.directory,
                engine: &self.engine,
                heuristic: self.heuristic.as_ref(),
                sync: &self.sync,
                live_peers: &self.live_peers,
                now_ms,
            };
            let log = self.log.entries();
            match self.descriptor.role {
                NodeRole::Edge => edge_records(&ctx, log, &self.observations)?,
                NodeRole::Validator => validator_records(&ctx, log)?,
                NodeRole::Aggregator => aggregator_records(&ctx, log)?,
                NodeRole::SealAuthority => seal_records(&ctx, log)?
                    .into_iter()
                    .map(MeshRecord::Seal)
                    .collect(),
            }
        };

        let pending = records
            .into_iter()
            .map(|record| -> MeshResult<PendingEntry<MeshRecord>> {
                Ok(PendingEntry {
                    entry_id: record.entry_id()?,
                    origin: self.descriptor.node_id.clone(),
                    record,
                })
            })
            .collect::<MeshResult<Vec<_>>>()?;
        let seals: Vec<PendingEntry<SealChainEntry>> = pending
            .iter()
            .filter_map(|p| match &p.record {
                MeshRecord::Seal(s) => Some(PendingEntry {
                    entry_id: s.seal_hash.clone(),
                    origin: p.origin.clone(),
                    record: s.clone(),
                }),
                _ => None,
            })
            .collect();
        let flags = pending
            .iter()
            .filter(|p| matches!(p.record, MeshRecord::Flag(_)))
            .count();

        let appended = self
            .log
            .append_batch(pending)?
            .iter()
            .filter(|o| matches!(o, credmesh_core::AppendOutcome::Appended(_)))
            .count();
        if let Some(mirror) = self.seal_mirror.as_mut() {
            if !seals.is_empty() {
                mirror.append_batch(seals)?;
            }
        }
        self.observations.clear();

        self.metrics.steps_total += 1;
        self.metrics.records_produced_total += appended as u64;
        self.metrics.integrity_flags_total += flags as u64;

        Ok(StepReport {
            node_id: self.descriptor.node_id.clone(),
            role: self.descriptor.role,
            appended,
            last_seq: self.log.last_seq(),
        })
    }

    /// Apply a replicated batch with one atomic write. Entries whose id
    /// does not match their content are rejected individually.
    pub fn ingest(&mut self, entries: Vec<MeshEntry>) -> MeshResult<IngestReport> {
        let mut report = IngestReport::default();
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry_id_matches(&entry) {
                warn!(
                    node_id = %self.descriptor.node_id,
                    origin = %entry.origin,
                    entry_id = %entry.entry_id,
                    "Rejecting replicated entry with mismatched id"
                );
                report.rejected += 1;
                continue;
            }
            pending.push(PendingEntry {
                entry_id: entry.entry_id,
                origin: entry.origin,
                record: entry.record,
            });
        }
        for outcome in self.log.append_batch(pending)? {
            match outcome {
                credmesh_core::AppendOutcome::Appended(_) => report.accepted += 1,
                credmesh_core::AppendOutcome::Duplicate => report.duplicates += 1,
            }
        }
        self.metrics.entries_ingested_total += report.accepted as u64;
        self.metrics.duplicates_total += report.duplicates as u64;
        self.metrics.rejected_total += report.rejected as u64;
        Ok(report)
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            node_id: self.descriptor.node_id.clone(),
            role: self.descriptor.role,
            entries: Arc::new(self.log.entries().to_vec()),
            live_peers: self.live_peers.clone(),
            health: self.log.health().clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Commands accepted by a node task
pub enum NodeCommand {
    Step {
        now_ms: u64,
        reply: oneshot::Sender<MeshResult<StepReport>>,
    },
    Ingest {
        entries: Vec<MeshEntry>,
        reply: oneshot::Sender<MeshResult<IngestReport>>,
    },
    Observe(Observation),
    InjectEnvelope {
        envelope: EvidenceEnvelope,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    UpdateLiveness(BTreeSet<NodeId>),
    Shutdown,
}

/// Cloneable handle to a running node task
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    role: NodeRole,
    tenant_id: String,
    tx: mpsc::Sender<NodeCommand>,
    snapshot: watch::Receiver<Arc<LogSnapshot>>,
}

/// Move `node` onto its own task.
pub fn spawn_node(mut node: MeshNode) -> (NodeHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(node.snapshot()));
    let handle = NodeHandle {
        node_id: node.node_id().to_string(),
        role: node.role(),
        tenant_id: node.directory.tenant_id().to_string(),
        tx,
        snapshot: snapshot_rx,
    };

    // The snapshot is published before any reply, so a caller that saw its
    // command complete always reads a snapshot including its effect.
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                NodeCommand::Step { now_ms, reply } => {
                    let result = node.step(now_ms);
                    if let Err(e) = &result {
                        error!(node_id = %node.node_id(), error = %e, "Role step failed");
                    }
                    snapshot_tx.send_replace(Arc::new(node.snapshot()));
                    let _ = reply.send(result);
                }
                NodeCommand::Ingest { entries, reply } => {
                    let result = node.ingest(entries);
                    snapshot_tx.send_replace(Arc::new(node.snapshot()));
                    let _ = reply.send(result);
                }
                NodeCommand::Observe(observation) => node.observe(observation),
                NodeCommand::InjectEnvelope { envelope, reply } => {
                    let result = node.inject_envelope(envelope);
                    snapshot_tx.send_replace(Arc::new(node.snapshot()));
                    let _ = reply.send(result);
                }
                NodeCommand::UpdateLiveness(live) => {
                    node.set_live_peers(live);
                    snapshot_tx.send_replace(Arc::new(node.snapshot()));
                }
                NodeCommand::Shutdown => break,
            }
        }
        info!(node_id = %node.node_id(), "Node task stopped");
    });

    (handle, task)
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Latest published snapshot. Never waits on the node task.
    pub fn snapshot(&self) -> Arc<LogSnapshot> {
        self.snapshot.borrow().clone()
    }

    fn unavailable(&self) -> MeshError {
        MeshError::NodeUnavailable {
            node_id: self.node_id.clone(),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<MeshResult<T>>) -> NodeCommand,
    ) -> MeshResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| self.unavailable())?;
        response.await.map_err(|_| self.unavailable())?
    }

    pub async fn step(&self, now_ms: u64) -> MeshResult<StepReport> {
        self.request(|reply| NodeCommand::Step { now_ms, reply }).await
    }

    pub async fn ingest(&self, entries: Vec<MeshEntry>) -> MeshResult<IngestReport> {
        self.request(|reply| NodeCommand::Ingest { entries, reply })
            .await
    }

    pub async fn observe(&self, observation: Observation) -> MeshResult<()> {
        self.tx
            .send(NodeCommand::Observe(observation))
            .await
            .map_err(|_| self.unavailable())
    }

    pub async fn inject_envelope(&self, envelope: EvidenceEnvelope) -> MeshResult<()> {
        self.request(|reply| NodeCommand::InjectEnvelope { envelope, reply })
            .await
    }

    pub async fn update_liveness(&self, live_peers: BTreeSet<NodeId>) -> MeshResult<()> {
        self.tx
            .send(NodeCommand::UpdateLiveness(live_peers))
            .await
            .map_err(|_| self.unavailable())
    }

    pub async fn shutdown(&self) -> MeshResult<()> {
        self.tx
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| self.unavailable())
    }

    fn check_tenant(&self, tenant_id: &str) -> Result<(), TransportError> {
        if tenant_id != self.tenant_id {
            return Err(TransportError::Rejected {
                peer: self.node_id.clone(),
                reason: format!("tenant '{}' is not served here", tenant_id),
            });
        }
        Ok(())
    }

    /// Receive side of a push.
    pub async fn accept_push(&self, batch: PushBatch) -> Result<PushAck, TransportError> {
        self.check_tenant(&batch.tenant_id)?;
        debug!(
            node_id = %self.node_id,
            from = %batch.from_node,
            entries = batch.entries.len(),
            "Accepting pushed batch"
        );
        let report = self
            .ingest(batch.entries)
            .await
            .map_err(|e| TransportError::Rejected {
                peer: self.node_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(PushAck {
            node_id: self.node_id.clone(),
            accepted: report.accepted,
            duplicates: report.duplicates,
            rejected: report.rejected,
        })
    }

    /// Serve a pull from the latest snapshot.
    pub fn serve_pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.check_tenant(&request.tenant_id)?;
        let snapshot = self.snapshot();
        let entries = snapshot.entries_after(request.since, request.limit).to_vec();
        let last_seq = snapshot.last_seq();
        let has_more = entries.last().is_some_and(|e| e.seq < last_seq);
        Ok(PullResponse {
            node_id: self.node_id.clone(),
            entries,
            last_seq,
            has_more,
        })
    }
}
