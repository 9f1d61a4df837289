//! Federated Quorum Engine
//!
//! Computes a claim's status from the validation records visible to one
//! aggregator. The rule is evaluated in order:
//!
//! 1. Participation coverage below the tier's region or group minimum:
//!    UNKNOWN. This is the partition-safe default; a correlated or
//!    regionally isolated validator set can never promote a claim alone.
//! 2. `k_required` confirmations whose own coverage meets the minimums,
//!    plus a full-trust out-of-band confirmation when the tier requires one:
//!    VERIFIED.
//! 3. `k_required` denials with no confirmations and sufficient deny
//!    coverage: INVALID.
//! 4. Confirm and deny coexisting with a minority share at or above the
//!    policy's `disagreement_threshold`: PENDING, flagged for review.
//! 5. Fewer live eligible validators than `k_required`: UNKNOWN, since no
//!    quorum can form until more of the pool is reachable.
//! 6. Otherwise PENDING.
//!
//! Only the latest vote per validator counts, and only from validators the
//! caller reports as live. Evaluation is a pure function of its inputs.

use credmesh_core::{
    canonical_json, digest_hex, ClaimStatus, NodeId, NodeRole, PolicyDocument, QuorumPolicy,
    TierRule, Vote,
};
use credmesh_crypto::{trust_level, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::directory::MeshDirectory;
use crate::envelope::{DecisionReason, ValidationRecord};

/// Quorum engine errors
#[derive(Debug, Error)]
pub enum QuorumError {
    /// Tier selected for a claim is not defined by the policy
    #[error("Unknown policy tier '{tier}' for claim {claim_id}")]
    UnknownTier { tier: String, claim_id: String },

    /// Policy failed validation
    #[error("Invalid quorum policy: {0}")]
    InvalidPolicy(String),
}

/// Resolves the policy tier for a claim from its content.
pub trait TierSelector: Send + Sync {
    fn select_tier(&self, claim_id: &str, content: Option<&str>) -> String;
}

/// First matching content prefix wins, otherwise the default tier.
#[derive(Debug, Clone)]
pub struct PrefixTierSelector {
    rules: Vec<TierRule>,
    default_tier: String,
}

impl PrefixTierSelector {
    pub fn from_policy(policy: &PolicyDocument) -> Self {
        Self {
            rules: policy.tier_rules.clone(),
            default_tier: policy.default_tier.clone(),
        }
    }
}

impl TierSelector for PrefixTierSelector {
    fn select_tier(&self, _claim_id: &str, content: Option<&str>) -> String {
        content
            .and_then(|c| {
                self.rules
                    .iter()
                    .find(|r| c.starts_with(&r.content_prefix))
            })
            .map(|r| r.tier.clone())
            .unwrap_or_else(|| self.default_tier.clone())
    }
}

/// Evidence for one claim as seen by an aggregator
#[derive(Debug, Clone)]
pub struct QuorumInput<'a> {
    pub claim_id: &'a str,
    pub content: Option<&'a str>,
    /// Every signature-checked validation record for the claim
    pub validations: Vec<&'a ValidationRecord>,
    /// Validators currently reachable; `None` treats all as live
    pub live_validators: Option<&'a BTreeSet<NodeId>>,
}

/// Deterministic result of evaluating one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumOutcome {
    pub claim_id: String,
    pub policy_tier: String,
    pub quorum_met: bool,
    pub resulting_status: ClaimStatus,
    pub reason: DecisionReason,
    /// Regions with a live confirm or deny vote
    pub regions_covered: BTreeSet<String>,
    pub groups_covered: BTreeSet<String>,
    /// Regions with a live confirm vote
    pub confirm_regions: BTreeSet<String>,
    pub confirm_groups: BTreeSet<String>,
    pub confirm_count: usize,
    pub deny_count: usize,
    pub abstain_count: usize,
    pub eligible_validators: usize,
    pub out_of_band_confirmed: bool,
    pub needs_review: bool,
    pub trust_level: TrustLevel,
    /// Sorted ids of the votes that were counted
    pub counted_votes: Vec<String>,
}

impl QuorumOutcome {
    /// Digest identifying this outcome; equal inputs give equal digests.
    pub fn digest(&self) -> String {
        canonical_json(self)
            .map(|bytes| digest_hex(&bytes))
            .unwrap_or_default()
    }
}

/// Latest vote per validator: highest revision, ties broken by id.
pub fn effective_votes<'a>(
    records: impl IntoIterator<Item = &'a ValidationRecord>,
) -> BTreeMap<&'a str, &'a ValidationRecord> {
    let mut latest: BTreeMap<&'a str, &'a ValidationRecord> = BTreeMap::new();
    for record in records {
        match latest.get(record.validator_id.as_str()) {
            Some(current)
                if (current.revision, &current.validation_id)
                    >= (record.revision, &record.validation_id) => {}
            _ => {
                latest.insert(record.validator_id.as_str(), record);
            }
        }
    }
    latest
}

#[derive(Default)]
struct Tally {
    confirm: usize,
    deny: usize,
    abstain: usize,
    regions: BTreeSet<String>,
    groups: BTreeSet<String>,
    confirm_regions: BTreeSet<String>,
    confirm_groups: BTreeSet<String>,
    deny_regions: BTreeSet<String>,
    deny_groups: BTreeSet<String>,
    out_of_band_confirmed: bool,
    counted: Vec<String>,
}

/// Federated quorum engine bound to one policy document
pub struct FederatedQuorumEngine {
    policy: Arc<PolicyDocument>,
    policy_hash: String,
    selector: Box<dyn TierSelector>,
}

impl std::fmt::Debug for FederatedQuorumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedQuorumEngine")
            .field("policy_version", &self.policy.version)
            .field("policy_hash", &self.policy_hash)
            .finish()
    }
}

impl FederatedQuorumEngine {
    pub fn new(policy: Arc<PolicyDocument>) -> Result<Self, QuorumError> {
        let selector = Box::new(PrefixTierSelector::from_policy(&policy));
        Self::with_selector(policy, selector)
    }

    /// Use an external tier selector instead of the policy's prefix rules.
    pub fn with_selector(
        policy: Arc<PolicyDocument>,
        selector: Box<dyn TierSelector>,
    ) -> Result<Self, QuorumError> {
        policy
            .validate()
            .map_err(|e| QuorumError::InvalidPolicy(e.to_string()))?;
        let policy_hash = policy
            .content_hash()
            .map_err(|e| QuorumError::InvalidPolicy(e.to_string()))?;
        Ok(Self {
            policy,
            policy_hash,
            selector,
        })
    }

    pub fn policy(&self) -> &PolicyDocument {
        &self.policy
    }

    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    /// Tier a claim with this content is evaluated under
    pub fn tier_for(&self, claim_id: &str, content: Option<&str>) -> Option<&QuorumPolicy> {
        self.policy.tier(&self.selector.select_tier(claim_id, content))
    }

    fn resolve_tier(&self, input: &QuorumInput<'_>) -> Result<(String, &QuorumPolicy), QuorumError> {
        let tier = self.selector.select_tier(input.claim_id, input.content);
        match self.policy.tier(&tier) {
            Some(policy) => Ok((tier, policy)),
            None => Err(QuorumError::UnknownTier {
                tier,
                claim_id: input.claim_id.to_string(),
            }),
        }
    }

    /// Evaluate one claim.
    pub fn evaluate(
        &self,
        directory: &MeshDirectory,
        input: &QuorumInput<'_>,
    ) -> Result<QuorumOutcome, QuorumError> {
        let (tier_name, tier) = self.resolve_tier(input)?;

        let is_live = |id: &str| input.live_validators.map_or(true, |live| live.contains(id));
        let eligible_validators = directory
            .with_role(NodeRole::Validator)
            .filter(|v| is_live(&v.node_id))
            .count()
            .min(tier.n_total);

        let mut tally = Tally::default();
        let claim_votes = input
            .validations
            .iter()
            .copied()
            .filter(|v| v.claim_id == input.claim_id);
        for (validator_id, record) in effective_votes(claim_votes) {
            let Some(node) = directory.get(validator_id) else {
                continue;
            };
            if node.role != NodeRole::Validator || !is_live(validator_id) {
                continue;
            }
            tally.counted.push(record.validation_id.clone());
            match record.vote {
                Vote::Confirm => {
                    tally.confirm += 1;
                    tally.confirm_regions.insert(node.region.clone());
                    tally.confirm_groups.insert(node.correlation_group.clone());
                    if node.out_of_band && trust_level(record.scheme) == TrustLevel::Full {
                        tally.out_of_band_confirmed = true;
                    }
                }
                Vote::Deny => {
                    tally.deny += 1;
                    tally.deny_regions.insert(node.region.clone());
                    tally.deny_groups.insert(node.correlation_group.clone());
                }
                Vote::Abstain => {
                    tally.abstain += 1;
                    continue;
                }
            }
            tally.regions.insert(node.region.clone());
            tally.groups.insert(node.correlation_group.clone());
        }
        tally.counted.sort();

        let diverse = |regions: &BTreeSet<String>, groups: &BTreeSet<String>| {
            regions.len() >= tier.min_regions && groups.len() >= tier.min_correlation_groups
        };

        let mut needs_review = false;
        let (status, reason) = if !diverse(&tally.regions, &tally.groups) {
            (ClaimStatus::Unknown, DecisionReason::InsufficientDiversity)
        } else if tally.confirm >= tier.k_required
            && diverse(&tally.confirm_regions, &tally.confirm_groups)
            && (!tier.out_of_band_required || tally.out_of_band_confirmed)
        {
            (ClaimStatus::Verified, DecisionReason::QuorumReached)
        } else if tally.deny >= tier.k_required
            && tally.confirm == 0
            && diverse(&tally.deny_regions, &tally.deny_groups)
        {
            (ClaimStatus::Invalid, DecisionReason::DenialQuorum)
        } else if tally.confirm > 0
            && tally.deny > 0
            && minority_share(tally.confirm, tally.deny) >= self.policy.disagreement_threshold
        {
            needs_review = true;
            (ClaimStatus::Pending, DecisionReason::Disagreement)
        } else if eligible_validators < tier.k_required {
            (ClaimStatus::Unknown, DecisionReason::InsufficientEligible)
        } else if tally.confirm >= tier.k_required
            && tier.out_of_band_required
            && !tally.out_of_band_confirmed
        {
            (ClaimStatus::Pending, DecisionReason::OutOfBandMissing)
        } else {
            (ClaimStatus::Pending, DecisionReason::InsufficientVotes)
        };

        debug!(
            claim_id = %input.claim_id,
            tier = %tier_name,
            confirm = tally.confirm,
            deny = tally.deny,
            regions = tally.regions.len(),
            groups = tally.groups.len(),
            eligible = eligible_validators,
            status = %status,
            "Quorum evaluated"
        );

        Ok(QuorumOutcome {
            claim_id: input.claim_id.to_string(),
            policy_tier: tier_name,
            quorum_met: matches!(status, ClaimStatus::Verified | ClaimStatus::Invalid),
            resulting_status: status,
            reason,
            regions_covered: tally.regions,
            groups_covered: tally.groups,
            confirm_regions: tally.confirm_regions,
            confirm_groups: tally.confirm_groups,
            confirm_count: tally.confirm,
            deny_count: tally.deny,
            abstain_count: tally.abstain,
            eligible_validators,
            out_of_band_confirmed: tally.out_of_band_confirmed,
            needs_review,
            trust_level: directory.trust_level(),
            counted_votes: tally.counted,
        })
    }
}

fn minority_share(confirm: usize, deny: usize) -> f64 {
    confirm.min(deny) as f64 / (confirm + deny) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use credmesh_core::{MeshConfig, NodeSpec, SchemeKind};
    use credmesh_crypto::{Ed25519Backend, Keyring, KeyedDigestBackend, SignatureBackend};
    use proptest::prelude::*;

    fn validator(id: &str, region: &str, group: &str) -> NodeSpec {
        NodeSpec {
            node_id: id.to_string(),
            role: NodeRole::Validator,
            region: region.to_string(),
            correlation_group: group.to_string(),
            out_of_band: false,
            listen_addr: None,
        }
    }

    /// Five validators across three regions and two groups
    fn five_validator_mesh(scheme: SchemeKind) -> (MeshDirectory, PolicyDocument) {
        let mut config = MeshConfig::demo("tenant-q", "/tmp/unused");
        config.signature_scheme = scheme;
        config.nodes = vec![
            validator("v1", "r1", "g1"),
            validator("v2", "r1", "g2"),
            validator("v3", "r2", "g1"),
            validator("v4", "r2", "g2"),
            validator("v5", "r3", "g1"),
        ];
        config.nodes[3].out_of_band = true;
        let mut policy = PolicyDocument::demo();
        {
            let standard = policy.tiers.get_mut("standard").unwrap();
            standard.k_required = 3;
            standard.n_total = 5;
            standard.min_regions = 2;
            standard.min_correlation_groups = 2;
        }
        {
            let critical = policy.tiers.get_mut("critical").unwrap();
            critical.k_required = 3;
            critical.min_regions = 2;
        }
        config.policy = policy.clone();

        let backend: &dyn SignatureBackend = match scheme {
            SchemeKind::Ed25519 => &Ed25519Backend,
            SchemeKind::KeyedDigest => &KeyedDigestBackend,
        };
        let keyring = Keyring::generate(backend, config.nodes.iter().map(|n| n.node_id.as_str()));
        (MeshDirectory::from_config(&config, &keyring).unwrap(), policy)
    }

    fn vote(validator: &str, claim: &str, vote: Vote, revision: u64) -> ValidationRecord {
        ValidationRecord {
            validation_id: format!("val-{}-{}-{}", validator, claim, revision),
            validator_id: validator.to_string(),
            claim_id: claim.to_string(),
            vote,
            revision,
            reasons: vec![],
            envelope_ids: vec![],
            scheme: SchemeKind::Ed25519,
            created_at: revision,
            signature: String::new(),
        }
    }

    fn evaluate(
        engine: &FederatedQuorumEngine,
        directory: &MeshDirectory,
        content: Option<&str>,
        votes: &[ValidationRecord],
    ) -> QuorumOutcome {
        engine
            .evaluate(
                directory,
                &QuorumInput {
                    claim_id: "claim-1",
                    content,
                    validations: votes.iter().collect(),
                    live_validators: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_three_confirms_two_regions_two_groups_verifies() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        // v1 (r1,g1), v2 (r1,g2), v3 (r2,g1)
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
        ];
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.resulting_status, ClaimStatus::Verified);
        assert!(outcome.quorum_met);
        assert_eq!(outcome.regions_covered.len(), 2);
        assert_eq!(outcome.groups_covered.len(), 2);

        // Dropping region r2 leaves a single region
        let single_region: Vec<_> = votes.into_iter().filter(|v| v.validator_id != "v3").collect();
        let outcome = evaluate(&engine, &directory, None, &single_region);
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
        assert_eq!(outcome.reason, DecisionReason::InsufficientDiversity);
    }

    #[test]
    fn test_single_group_never_verifies() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        // All of g1, spanning three regions
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
            vote("v5", "claim-1", Vote::Confirm, 1),
        ];
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.confirm_count, 3);
        assert_eq!(outcome.groups_covered.len(), 1);
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
    }

    #[test]
    fn test_no_votes_is_unknown() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let outcome = evaluate(&engine, &directory, None, &[]);
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
        assert!(!outcome.quorum_met);
    }

    #[test]
    fn test_later_revision_supersedes() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Abstain, 2),
        ];
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.confirm_count, 2);
        assert_eq!(outcome.abstain_count, 1);
        assert_eq!(outcome.counted_votes.len(), 3);
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
    }

    #[test]
    fn test_disagreement_flags_review_never_invalid() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Deny, 1),
            vote("v4", "claim-1", Vote::Deny, 1),
        ];
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.resulting_status, ClaimStatus::Pending);
        assert!(outcome.needs_review);
        assert_eq!(outcome.reason, DecisionReason::Disagreement);
    }

    #[test]
    fn test_small_minority_is_plain_pending() {
        let (directory, mut policy) = five_validator_mesh(SchemeKind::Ed25519);
        policy.tiers.get_mut("standard").unwrap().k_required = 5;
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
            vote("v4", "claim-1", Vote::Confirm, 1),
            vote("v5", "claim-1", Vote::Deny, 1),
        ];
        // Minority share 0.2 is under the 0.25 threshold
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.resulting_status, ClaimStatus::Pending);
        assert!(!outcome.needs_review);
        assert_eq!(outcome.reason, DecisionReason::InsufficientVotes);
    }

    #[test]
    fn test_denial_quorum_is_invalid() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes = vec![
            vote("v1", "claim-1", Vote::Deny, 1),
            vote("v2", "claim-1", Vote::Deny, 1),
            vote("v3", "claim-1", Vote::Deny, 1),
        ];
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.resulting_status, ClaimStatus::Invalid);
        assert_eq!(outcome.reason, DecisionReason::DenialQuorum);
    }

    #[test]
    fn test_out_of_band_requirement() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let without_oob = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
        ];
        let outcome = evaluate(&engine, &directory, Some("critical: dam breach"), &without_oob);
        assert_eq!(outcome.policy_tier, "critical");
        assert_eq!(outcome.resulting_status, ClaimStatus::Pending);
        assert_eq!(outcome.reason, DecisionReason::OutOfBandMissing);

        let mut with_oob = without_oob;
        with_oob.push(vote("v4", "claim-1", Vote::Confirm, 1));
        let outcome = evaluate(&engine, &directory, Some("critical: dam breach"), &with_oob);
        assert!(outcome.out_of_band_confirmed);
        assert_eq!(outcome.resulting_status, ClaimStatus::Verified);
    }

    #[test]
    fn test_fallback_signed_vote_cannot_satisfy_out_of_band() {
        let (directory, policy) = five_validator_mesh(SchemeKind::KeyedDigest);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes: Vec<_> = ["v1", "v2", "v3", "v4"]
            .iter()
            .map(|v| {
                let mut record = vote(v, "claim-1", Vote::Confirm, 1);
                record.scheme = SchemeKind::KeyedDigest;
                record
            })
            .collect();
        let outcome = evaluate(&engine, &directory, Some("critical: dam breach"), &votes);
        assert!(!outcome.out_of_band_confirmed);
        assert_eq!(outcome.trust_level, TrustLevel::Degraded);
        assert_ne!(outcome.resulting_status, ClaimStatus::Verified);
    }

    #[test]
    fn test_stale_validators_are_excluded() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
        ];
        let live: BTreeSet<NodeId> = ["v1", "v2"].iter().map(|s| s.to_string()).collect();
        let outcome = engine
            .evaluate(
                &directory,
                &QuorumInput {
                    claim_id: "claim-1",
                    content: None,
                    validations: votes.iter().collect(),
                    live_validators: Some(&live),
                },
            )
            .unwrap();
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
        assert_eq!(outcome.eligible_validators, 2);
    }

    #[test]
    fn test_too_few_live_validators_is_unknown() {
        let (directory, mut policy) = five_validator_mesh(SchemeKind::Ed25519);
        policy.tiers.get_mut("standard").unwrap().k_required = 4;
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        // v1 (r1,g1), v2 (r1,g2), v3 (r2,g1): coverage is met but only three
        // validators are reachable for a k of four
        let votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v2", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Confirm, 1),
        ];
        let live: BTreeSet<NodeId> = ["v1", "v2", "v3"].iter().map(|s| s.to_string()).collect();
        let input = QuorumInput {
            claim_id: "claim-1",
            content: None,
            validations: votes.iter().collect(),
            live_validators: Some(&live),
        };
        let outcome = engine.evaluate(&directory, &input).unwrap();
        assert_eq!(outcome.eligible_validators, 3);
        assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
        assert_eq!(outcome.reason, DecisionReason::InsufficientEligible);
        assert!(!outcome.quorum_met);

        // Same votes with the whole pool reachable wait for a fourth confirm
        let outcome = evaluate(&engine, &directory, None, &votes);
        assert_eq!(outcome.eligible_validators, 5);
        assert_eq!(outcome.resulting_status, ClaimStatus::Pending);
        assert_eq!(outcome.reason, DecisionReason::InsufficientVotes);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
        let mut votes = vec![
            vote("v1", "claim-1", Vote::Confirm, 1),
            vote("v4", "claim-1", Vote::Confirm, 1),
            vote("v3", "claim-1", Vote::Deny, 1),
        ];
        let a = evaluate(&engine, &directory, None, &votes);
        votes.reverse();
        let b = evaluate(&engine, &directory, None, &votes);
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_unknown_tier_is_an_error() {
        struct Fixed;
        impl TierSelector for Fixed {
            fn select_tier(&self, _: &str, _: Option<&str>) -> String {
                "missing".to_string()
            }
        }
        let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
        let engine =
            FederatedQuorumEngine::with_selector(Arc::new(policy), Box::new(Fixed)).unwrap();
        let result = engine.evaluate(
            &directory,
            &QuorumInput {
                claim_id: "claim-1",
                content: None,
                validations: vec![],
                live_validators: None,
            },
        );
        assert!(matches!(result, Err(QuorumError::UnknownTier { .. })));
    }

    proptest! {
        #[test]
        fn prop_insufficient_diversity_never_verifies(
            choices in proptest::collection::vec((0usize..5, 0u8..3, 1u64..4), 0..15)
        ) {
            let (directory, policy) = five_validator_mesh(SchemeKind::Ed25519);
            let min_regions = policy.tiers["standard"].min_regions;
            let min_groups = policy.tiers["standard"].min_correlation_groups;
            let engine = FederatedQuorumEngine::new(Arc::new(policy)).unwrap();
            let ids = ["v1", "v2", "v3", "v4", "v5"];
            let votes: Vec<_> = choices
                .iter()
                .map(|(v, kind, rev)| {
                    let kind = match kind { 0 => Vote::Confirm, 1 => Vote::Deny, _ => Vote::Abstain };
                    vote(ids[*v], "claim-1", kind, *rev)
                })
                .collect();
            let outcome = evaluate(&engine, &directory, None, &votes);
            if outcome.regions_covered.len() < min_regions
                || outcome.groups_covered.len() < min_groups
            {
                prop_assert_eq!(outcome.resulting_status, ClaimStatus::Unknown);
            }
            if outcome.resulting_status == ClaimStatus::Verified {
                prop_assert!(outcome.confirm_regions.len() >= min_regions);
                prop_assert!(outcome.confirm_groups.len() >= min_groups);
            }
        }
    }
}
