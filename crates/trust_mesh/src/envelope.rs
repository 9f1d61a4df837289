//! Mesh Records
//!
//! Everything a node appends to its log is one of the [`MeshRecord`]
//! variants. Records are immutable once created; corrections arrive as new
//! records that logically supersede older ones.
//!
//! Entry ids are the BLAKE3 digest of the record's canonical JSON, so a
//! replicated entry can be checked against its own content.

use credmesh_core::{canonical_json, digest_hex, ClaimStatus, LogEntry, NodeId, SchemeKind, Vote};
use credmesh_crypto::{
    sign_payload, verify_payload, ChainError, SealLink, SignatureBackend, SigningError,
    SigningKeypair, TrustLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A log entry holding a mesh record
pub type MeshEntry = LogEntry<MeshRecord>;

/// A claim first observed by an edge node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim_id: String,
    pub content: String,
    pub submitted_by: NodeId,
    pub submitted_at: u64,
}

/// Signed unit of claim-supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEnvelope {
    pub envelope_id: String,
    pub claim_id: String,
    /// Opaque claim-supporting content
    pub payload: serde_json::Value,
    /// Digest of the signed body (claim, signer, time, sequence, ttl and payload)
    pub payload_hash: String,
    /// Hex signature over `payload_hash`
    pub signature: String,
    pub signer_node_id: NodeId,
    pub scheme: SchemeKind,
    pub created_at: u64,
    /// Per-signer sequence number; 0 for unsequenced sources
    #[serde(default)]
    pub source_seq: u64,
    /// Evidence stops counting `ttl_ms` after `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

/// Ordering and freshness metadata signed into an envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStamp {
    pub source_seq: u64,
    pub ttl_ms: Option<u64>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    claim_id: &'a str,
    signer_node_id: &'a str,
    created_at: u64,
    source_seq: u64,
    ttl_ms: Option<u64>,
    payload: &'a serde_json::Value,
}

/// `<prefix>-<first 24 hex chars of digest>`
fn derived_id(prefix: &str, digest: &str) -> String {
    format!("{}-{}", prefix, digest.get(..24).unwrap_or(digest))
}

impl EvidenceEnvelope {
    /// Hash and sign `payload` on behalf of an unsequenced source.
    pub fn create(
        backend: &dyn SignatureBackend,
        keypair: &SigningKeypair,
        signer_node_id: &str,
        claim_id: &str,
        payload: serde_json::Value,
        created_at: u64,
    ) -> Result<Self, SigningError> {
        Self::create_stamped(
            backend,
            keypair,
            signer_node_id,
            claim_id,
            payload,
            created_at,
            SourceStamp::default(),
        )
    }

    /// Hash and sign `payload` with a source sequence number and ttl.
    pub fn create_stamped(
        backend: &dyn SignatureBackend,
        keypair: &SigningKeypair,
        signer_node_id: &str,
        claim_id: &str,
        payload: serde_json::Value,
        created_at: u64,
        stamp: SourceStamp,
    ) -> Result<Self, SigningError> {
        let body = canonical_json(&EnvelopeBody {
            claim_id,
            signer_node_id,
            created_at,
            source_seq: stamp.source_seq,
            ttl_ms: stamp.ttl_ms,
            payload: &payload,
        })?;
        let (payload_hash, signature) = sign_payload(backend, keypair, &body)?;
        Ok(Self {
            envelope_id: derived_id("env", &payload_hash),
            claim_id: claim_id.to_string(),
            payload,
            payload_hash,
            signature: hex::encode(signature),
            signer_node_id: signer_node_id.to_string(),
            scheme: backend.scheme(),
            created_at,
            source_seq: stamp.source_seq,
            ttl_ms: stamp.ttl_ms,
        })
    }

    fn signed_body(&self) -> Option<Vec<u8>> {
        canonical_json(&EnvelopeBody {
            claim_id: &self.claim_id,
            signer_node_id: &self.signer_node_id,
            created_at: self.created_at,
            source_seq: self.source_seq,
            ttl_ms: self.ttl_ms,
            payload: &self.payload,
        })
        .ok()
    }

    /// Recompute the payload hash, check the signature over it and check
    /// that the envelope id is the one derived from that hash.
    pub fn verify(&self, backend: &dyn SignatureBackend, public_key: &[u8]) -> bool {
        if backend.scheme() != self.scheme {
            return false;
        }
        if self.envelope_id != derived_id("env", &self.payload_hash) {
            return false;
        }
        let (Some(body), Ok(signature)) = (self.signed_body(), hex::decode(&self.signature)) else {
            return false;
        };
        verify_payload(backend, public_key, &body, &self.payload_hash, &signature)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| self.created_at.saturating_add(ttl) <= now_ms)
    }

    /// Digest of the payload alone, independent of time and sequence
    pub fn content_digest(&self) -> String {
        canonical_json(&self.payload)
            .map(|bytes| digest_hex(&bytes))
            .unwrap_or_default()
    }
}

/// A validator's signed vote on a claim.
///
/// Supersession is by `revision` within one validator and claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub validation_id: String,
    pub validator_id: NodeId,
    pub claim_id: String,
    pub vote: Vote,
    pub revision: u64,
    pub reasons: Vec<String>,
    /// Envelopes the vote was computed from
    pub envelope_ids: Vec<String>,
    pub scheme: SchemeKind,
    pub created_at: u64,
    pub signature: String,
}

#[derive(Serialize)]
struct ValidationBody<'a> {
    validator_id: &'a str,
    claim_id: &'a str,
    vote: Vote,
    revision: u64,
    reasons: &'a [String],
    envelope_ids: &'a [String],
    scheme: SchemeKind,
    created_at: u64,
}

/// Unsigned vote content produced by a validator's evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct VoteDraft {
    pub claim_id: String,
    pub vote: Vote,
    pub revision: u64,
    pub reasons: Vec<String>,
    pub envelope_ids: Vec<String>,
}

impl ValidationRecord {
    fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical_json(&ValidationBody {
            validator_id: &self.validator_id,
            claim_id: &self.claim_id,
            vote: self.vote,
            revision: self.revision,
            reasons: &self.reasons,
            envelope_ids: &self.envelope_ids,
            scheme: self.scheme,
            created_at: self.created_at,
        })
    }

    pub fn create(
        backend: &dyn SignatureBackend,
        keypair: &SigningKeypair,
        validator_id: &str,
        draft: VoteDraft,
        created_at: u64,
    ) -> Result<Self, SigningError> {
        let body = canonical_json(&ValidationBody {
            validator_id,
            claim_id: &draft.claim_id,
            vote: draft.vote,
            revision: draft.revision,
            reasons: &draft.reasons,
            envelope_ids: &draft.envelope_ids,
            scheme: backend.scheme(),
            created_at,
        })?;
        let signature = backend.sign(keypair, &body)?;
        Ok(Self {
            validation_id: derived_id("val", &digest_hex(&body)),
            validator_id: validator_id.to_string(),
            claim_id: draft.claim_id,
            vote: draft.vote,
            revision: draft.revision,
            reasons: draft.reasons,
            envelope_ids: draft.envelope_ids,
            scheme: backend.scheme(),
            created_at,
            signature: hex::encode(signature),
        })
    }

    /// Check the signature and that the validation id is derived from
    /// the signed body.
    pub fn verify(&self, backend: &dyn SignatureBackend, public_key: &[u8]) -> bool {
        if backend.scheme() != self.scheme {
            return false;
        }
        match (self.body(), hex::decode(&self.signature)) {
            (Ok(body), Ok(signature)) => {
                self.validation_id == derived_id("val", &digest_hex(&body))
                    && backend.verify(public_key, &body, &signature)
            }
            _ => false,
        }
    }
}

/// Why the quorum engine reached its status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    InsufficientDiversity,
    QuorumReached,
    OutOfBandMissing,
    DenialQuorum,
    Disagreement,
    /// Fewer live validators than the tier's `k_required`
    InsufficientEligible,
    InsufficientVotes,
}

/// Quorum outcome for a claim, as appended by an aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRecord {
    pub aggregation_id: String,
    pub aggregator_id: NodeId,
    pub claim_id: String,
    pub policy_tier: String,
    pub policy_hash: String,
    pub quorum_met: bool,
    pub resulting_status: ClaimStatus,
    pub reason: DecisionReason,
    pub regions_covered: BTreeSet<String>,
    pub groups_covered: BTreeSet<String>,
    pub confirm_count: usize,
    pub deny_count: usize,
    pub abstain_count: usize,
    pub eligible_validators: usize,
    pub out_of_band_confirmed: bool,
    pub needs_review: bool,
    pub trust_level: TrustLevel,
    /// Digest of the deterministic outcome this record was built from
    pub outcome_digest: String,
    pub computed_at: u64,
}

/// One link in a seal authority's hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealChainEntry {
    pub seal_index: u64,
    pub seal_hash: String,
    pub prev_seal_hash: String,
    pub policy_hash: String,
    pub snapshot_hash: String,
    pub sealed_at: u64,
    pub sealed_by: NodeId,
    pub aggregation: AggregationRecord,
}

impl SealLink for SealChainEntry {
    fn seal_hash(&self) -> &str {
        &self.seal_hash
    }

    fn prev_seal_hash(&self) -> &str {
        &self.prev_seal_hash
    }

    fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    fn snapshot_hash(&self) -> &str {
        &self.snapshot_hash
    }

    fn sealed_canonical(&self) -> Result<Vec<u8>, ChainError> {
        canonical_json(&self.aggregation).map_err(|e| ChainError::Canonicalization(e.to_string()))
    }
}

/// Kind of record an integrity flag refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlaggedKind {
    Envelope,
    Validation,
}

/// What an integrity flag reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegritySignal {
    /// Signature, payload hash or derived id does not verify
    #[default]
    BadSignature,
    /// Source reused a sequence number for the same content
    ReplayDetected,
    /// Source sequence went backwards with different content
    SequenceViolation,
    /// Timestamped behind its region's watermark
    LateArrival,
    /// Timestamped ahead of the receiving node's clock
    ClockSkew,
}

impl IntegritySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegritySignal::BadSignature => "bad_signature",
            IntegritySignal::ReplayDetected => "replay_detected",
            IntegritySignal::SequenceViolation => "sequence_violation",
            IntegritySignal::LateArrival => "late_arrival",
            IntegritySignal::ClockSkew => "clock_skew",
        }
    }

    /// Whether the flagged record is kept out of evaluation
    pub fn excludes_record(&self) -> bool {
        !matches!(self, IntegritySignal::LateArrival)
    }

    /// Whether the flagged source is quarantined
    pub fn quarantines_source(&self) -> bool {
        matches!(
            self,
            IntegritySignal::ReplayDetected | IntegritySignal::SequenceViolation
        )
    }
}

/// A reported integrity failure. Never auto-repaired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFlag {
    pub raised_by: NodeId,
    pub flagged_node: NodeId,
    pub record_kind: FlaggedKind,
    #[serde(default)]
    pub signal: IntegritySignal,
    /// envelope_id or validation_id of the offending record
    pub record_ref: String,
    pub reason: String,
    pub raised_at: u64,
}

/// Anything that can be appended to a node's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshRecord {
    Claim(ClaimRecord),
    Envelope(EvidenceEnvelope),
    Validation(ValidationRecord),
    Aggregation(AggregationRecord),
    Seal(SealChainEntry),
    Flag(IntegrityFlag),
}

impl MeshRecord {
    /// Stable content id used for replication dedup
    pub fn entry_id(&self) -> Result<String, serde_json::Error> {
        Ok(digest_hex(&canonical_json(self)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeshRecord::Claim(_) => "claim",
            MeshRecord::Envelope(_) => "envelope",
            MeshRecord::Validation(_) => "validation",
            MeshRecord::Aggregation(_) => "aggregation",
            MeshRecord::Seal(_) => "seal",
            MeshRecord::Flag(_) => "flag",
        }
    }

    pub fn claim_id(&self) -> Option<&str> {
        match self {
            MeshRecord::Claim(c) => Some(&c.claim_id),
            MeshRecord::Envelope(e) => Some(&e.claim_id),
            MeshRecord::Validation(v) => Some(&v.claim_id),
            MeshRecord::Aggregation(a) => Some(&a.claim_id),
            MeshRecord::Seal(s) => Some(&s.aggregation.claim_id),
            MeshRecord::Flag(_) => None,
        }
    }
}

/// True when the entry's id matches its record content
pub fn entry_id_matches(entry: &MeshEntry) -> bool {
    entry
        .record
        .entry_id()
        .map(|id| id == entry.entry_id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use credmesh_crypto::{Ed25519Backend, KeyedDigestBackend};
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip_verifies() {
        let backend = Ed25519Backend;
        let keypair = backend.generate();
        let env = EvidenceEnvelope::create(
            &backend,
            &keypair,
            "edge-a",
            "claim-1",
            json!({"stance": "supports", "reading": 42}),
            1_700_000_000_000,
        )
        .unwrap();

        assert!(env.envelope_id.starts_with("env-"));
        assert!(env.verify(&backend, keypair.public()));
    }

    #[test]
    fn test_envelope_tamper_fails() {
        let backend = Ed25519Backend;
        let keypair = backend.generate();
        let env = EvidenceEnvelope::create(
            &backend,
            &keypair,
            "edge-a",
            "claim-1",
            json!({"stance": "supports"}),
            1_700_000_000_000,
        )
        .unwrap();

        let mut relabeled = env.clone();
        relabeled.claim_id = "claim-2".to_string();
        assert!(!relabeled.verify(&backend, keypair.public()));

        let mut edited = env.clone();
        edited.payload = json!({"stance": "contradicts"});
        assert!(!edited.verify(&backend, keypair.public()));

        let mut bad_hex = env;
        bad_hex.signature = "zz".to_string();
        assert!(!bad_hex.verify(&backend, keypair.public()));
    }

    #[test]
    fn test_envelope_scheme_must_match_backend() {
        let keypair = KeyedDigestBackend.generate();
        let env = EvidenceEnvelope::create(
            &KeyedDigestBackend,
            &keypair,
            "edge-a",
            "claim-1",
            json!({}),
            1,
        )
        .unwrap();
        assert!(env.verify(&KeyedDigestBackend, keypair.public()));
        assert!(!env.verify(&Ed25519Backend, keypair.public()));
    }

    #[test]
    fn test_validation_signature() {
        let backend = Ed25519Backend;
        let keypair = backend.generate();
        let record = ValidationRecord::create(
            &backend,
            &keypair,
            "validator-a1",
            VoteDraft {
                claim_id: "claim-1".into(),
                vote: Vote::Confirm,
                revision: 1,
                reasons: vec!["stance:supports".into()],
                envelope_ids: vec!["env-1".into()],
            },
            5,
        )
        .unwrap();
        assert!(record.verify(&backend, keypair.public()));

        let mut flipped = record;
        flipped.vote = Vote::Deny;
        assert!(!flipped.verify(&backend, keypair.public()));
    }

    #[test]
    fn test_envelope_id_must_derive_from_hash() {
        let backend = Ed25519Backend;
        let keypair = backend.generate();
        let env = EvidenceEnvelope::create(&backend, &keypair, "edge-a", "claim-1", json!({"stance": "supports"}), 9)
            .unwrap();

        let mut spoofed = env.clone();
        spoofed.envelope_id = "env-000000000000000000000000".to_string();
        assert!(!spoofed.verify(&backend, keypair.public()));

        // A short hash must not panic the id derivation
        let mut truncated = env;
        truncated.payload_hash = "abc".to_string();
        truncated.envelope_id = "env-abc".to_string();
        assert!(!truncated.verify(&backend, keypair.public()));
    }

    #[test]
    fn test_validation_id_must_derive_from_body() {
        let backend = KeyedDigestBackend;
        let keypair = backend.generate();
        let record = ValidationRecord::create(
            &backend,
            &keypair,
            "validator-b1",
            VoteDraft {
                claim_id: "claim-1".into(),
                vote: Vote::Deny,
                revision: 2,
                reasons: vec![],
                envelope_ids: vec![],
            },
            12,
        )
        .unwrap();
        assert!(record.verify(&backend, keypair.public()));

        let mut spoofed = record;
        spoofed.validation_id = "val-shadowing-another-vote".to_string();
        assert!(!spoofed.verify(&backend, keypair.public()));
    }

    #[test]
    fn test_sequence_and_ttl_are_signed() {
        let backend = Ed25519Backend;
        let keypair = backend.generate();
        let env = EvidenceEnvelope::create_stamped(
            &backend,
            &keypair,
            "edge-a",
            "claim-1",
            json!({"stance": "supports", "value": 7}),
            1_000,
            SourceStamp {
                source_seq: 4,
                ttl_ms: Some(500),
            },
        )
        .unwrap();
        assert!(env.verify(&backend, keypair.public()));
        assert!(!env.is_expired(1_499));
        assert!(env.is_expired(1_500));

        let mut resequenced = env.clone();
        resequenced.source_seq = 9;
        assert!(!resequenced.verify(&backend, keypair.public()));

        let mut extended = env.clone();
        extended.ttl_ms = None;
        assert!(!extended.verify(&backend, keypair.public()));
        assert!(!extended.is_expired(u64::MAX));

        // Same payload at another time and sequence keeps its content digest
        let later = EvidenceEnvelope::create_stamped(
            &backend,
            &keypair,
            "edge-a",
            "claim-1",
            json!({"value": 7, "stance": "supports"}),
            2_000,
            SourceStamp {
                source_seq: 5,
                ttl_ms: None,
            },
        )
        .unwrap();
        assert_eq!(env.content_digest(), later.content_digest());
        assert_ne!(env.envelope_id, later.envelope_id);
    }

    #[test]
    fn test_record_entry_id_is_content_hash() {
        let record = MeshRecord::Claim(ClaimRecord {
            claim_id: "claim-1".into(),
            content: "bridge is open".into(),
            submitted_by: "edge-a".into(),
            submitted_at: 10,
        });
        let id = record.entry_id().unwrap();
        let entry = MeshEntry {
            seq: 1,
            entry_id: id,
            origin: "edge-a".into(),
            recorded_at: 11,
            record: record.clone(),
        };
        assert!(entry_id_matches(&entry));

        let mut forged = entry;
        forged.record = MeshRecord::Claim(ClaimRecord {
            claim_id: "claim-1".into(),
            content: "bridge is closed".into(),
            submitted_by: "edge-a".into(),
            submitted_at: 10,
        });
        assert!(!entry_id_matches(&forged));
    }
}
