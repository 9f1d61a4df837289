//! Mesh configuration and the versioned quorum policy document.

use crate::canonical::{canonical_json, digest_hex};
use crate::error::{CoreError, Result};
use crate::types::{NodeId, NodeRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Signature scheme selected at mesh-instance construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    #[default]
    Ed25519,
    /// Symmetric keyed digest, for environments without key distribution
    KeyedDigest,
}

impl std::str::FromStr for SchemeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ed25519" => Ok(SchemeKind::Ed25519),
            "keyed_digest" => Ok(SchemeKind::KeyedDigest),
            other => Err(CoreError::Config(format!(
                "unknown signature scheme '{}'",
                other
            ))),
        }
    }
}

/// Quorum thresholds for one policy tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    /// Confirming votes required
    pub k_required: usize,
    /// Size of the eligible validator pool
    pub n_total: usize,
    pub min_regions: usize,
    pub min_correlation_groups: usize,
    /// Require at least one full-trust out-of-band confirmation
    #[serde(default)]
    pub out_of_band_required: bool,
    /// Lifetime stamped on evidence for claims in this tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_ttl_ms: Option<u64>,
}

/// Routes claims to a tier by content prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub content_prefix: String,
    pub tier: String,
}

/// Versioned, external quorum policy. Read-only at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: String,
    /// Minority share of confirm/deny votes at or above which a split
    /// claim is flagged for manual resolution.
    pub disagreement_threshold: f64,
    pub default_tier: String,
    pub tiers: BTreeMap<String, QuorumPolicy>,
    #[serde(default)]
    pub tier_rules: Vec<TierRule>,
}

impl PolicyDocument {
    /// Load a standalone policy document (TOML).
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let policy: PolicyDocument = toml::from_str(&content)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Content hash embedded in aggregation records and seal entries
    pub fn content_hash(&self) -> Result<String> {
        Ok(digest_hex(&canonical_json(self)?))
    }

    pub fn tier(&self, name: &str) -> Option<&QuorumPolicy> {
        self.tiers.get(name)
    }

    /// Reject policies that cannot be evaluated safely.
    pub fn validate(&self) -> Result<()> {
        if !(self.disagreement_threshold > 0.0 && self.disagreement_threshold <= 1.0) {
            return Err(CoreError::Config(format!(
                "disagreement_threshold must be in (0, 1], got {}",
                self.disagreement_threshold
            )));
        }
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(CoreError::Config(format!(
                "default tier '{}' is not defined",
                self.default_tier
            )));
        }
        for (name, tier) in &self.tiers {
            if tier.k_required == 0 {
                return Err(CoreError::Config(format!("tier '{}': k_required is 0", name)));
            }
            if tier.k_required > tier.n_total {
                return Err(CoreError::Config(format!(
                    "tier '{}': k_required {} exceeds n_total {}",
                    name, tier.k_required, tier.n_total
                )));
            }
            if tier.min_regions == 0 || tier.min_correlation_groups == 0 {
                return Err(CoreError::Config(format!(
                    "tier '{}': region and group minimums must be at least 1",
                    name
                )));
            }
            if tier.envelope_ttl_ms == Some(0) {
                return Err(CoreError::Config(format!("tier '{}': envelope_ttl_ms is 0", name)));
            }
        }
        for rule in &self.tier_rules {
            if !self.tiers.contains_key(&rule.tier) {
                return Err(CoreError::Config(format!(
                    "tier rule for prefix '{}' names unknown tier '{}'",
                    rule.content_prefix, rule.tier
                )));
            }
        }
        Ok(())
    }

    /// Policy used by the reference topology
    pub fn demo() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            "standard".to_string(),
            QuorumPolicy {
                k_required: 3,
                n_total: 5,
                min_regions: 3,
                min_correlation_groups: 2,
                out_of_band_required: false,
                envelope_ttl_ms: Some(900_000),
            },
        );
        tiers.insert(
            "critical".to_string(),
            QuorumPolicy {
                k_required: 4,
                n_total: 5,
                min_regions: 3,
                min_correlation_groups: 2,
                out_of_band_required: true,
                envelope_ttl_ms: Some(900_000),
            },
        );
        Self {
            version: "2026.1".to_string(),
            disagreement_threshold: 0.25,
            default_tier: "standard".to_string(),
            tiers,
            tier_rules: vec![TierRule {
                content_prefix: "critical:".to_string(),
                tier: "critical".to_string(),
            }],
        }
    }
}

/// Static description of one mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub region: String,
    pub correlation_group: String,
    /// Validator confirms over an independent channel
    #[serde(default)]
    pub out_of_band: bool,
    /// HTTP address when run as a standalone node process
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Upper bound on a single push or pull exchange
    pub timeout_ms: u64,
    /// Maximum entries per batch
    pub batch_limit: usize,
    /// Pause between rounds for standalone node processes
    pub interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            batch_limit: 512,
            interval_ms: 1_000,
        }
    }
}

/// Source ordering, clock and independence checks applied to evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How far ahead of the receiving node's clock evidence may be stamped
    pub max_clock_skew_ms: u64,
    /// How far behind its region's watermark evidence may be stamped
    pub late_arrival_ms: u64,
    /// Share of accepted evidence any one region may contribute
    pub max_region_authority: f64,
    /// Correlation coefficient at which a group is flagged for review
    pub correlation_review_threshold: f64,
    /// Correlation coefficient at which a group's evidence is suspect
    pub correlation_invalid_threshold: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_ms: 30_000,
            late_arrival_ms: 5_000,
            max_region_authority: 0.40,
            correlation_review_threshold: 0.7,
            correlation_invalid_threshold: 0.9,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_region_authority > 0.0 && self.max_region_authority <= 1.0) {
            return Err(CoreError::Config(format!(
                "sync.max_region_authority must be in (0, 1], got {}",
                self.max_region_authority
            )));
        }
        if !(0.0..=1.0).contains(&self.correlation_review_threshold)
            || !(0.0..=1.0).contains(&self.correlation_invalid_threshold)
            || self.correlation_review_threshold > self.correlation_invalid_threshold
        {
            return Err(CoreError::Config(format!(
                "sync correlation thresholds must satisfy 0 <= review ({}) <= invalid ({}) <= 1",
                self.correlation_review_threshold, self.correlation_invalid_threshold
            )));
        }
        Ok(())
    }
}

/// Configuration for one tenant's mesh instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub tenant_id: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub signature_scheme: SchemeKind,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub nodes: Vec<NodeSpec>,
    pub policy: PolicyDocument,
}

impl MeshConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MeshConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CREDMESH_DATA_DIR` and `CREDMESH_SIGNATURE_SCHEME` if set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CREDMESH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(scheme) = std::env::var("CREDMESH_SIGNATURE_SCHEME") {
            self.signature_scheme = scheme.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.is_empty()
            || self.tenant_id.contains(['/', '\\'])
            || self.tenant_id.starts_with('.')
        {
            return Err(CoreError::Config(format!(
                "invalid tenant id '{}'",
                self.tenant_id
            )));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate node id '{}'",
                    node.node_id
                )));
            }
            if node.node_id.is_empty() || node.node_id.contains(['/', '\\']) {
                return Err(CoreError::Config(format!(
                    "invalid node id '{}'",
                    node.node_id
                )));
            }
        }
        self.sync.validate()?;
        self.policy.validate()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Directory holding this tenant's keyring and per-node logs
    pub fn tenant_dir(&self) -> PathBuf {
        self.data_dir.join(&self.tenant_id)
    }

    /// Reference topology: three regions, two correlation groups,
    /// five validators, one aggregator and one seal authority.
    pub fn demo(tenant_id: &str, data_dir: impl Into<PathBuf>) -> Self {
        let node = |id: &str, role, region: &str, group: &str| NodeSpec {
            node_id: id.to_string(),
            role,
            region: region.to_string(),
            correlation_group: group.to_string(),
            out_of_band: false,
            listen_addr: None,
        };
        let mut nodes = vec![
            node("edge-a", NodeRole::Edge, "region-a", "g1"),
            node("aggregator-a", NodeRole::Aggregator, "region-a", "g1"),
            node("seal-a", NodeRole::SealAuthority, "region-a", "g1"),
            node("validator-a1", NodeRole::Validator, "region-a", "g1"),
            node("edge-b", NodeRole::Edge, "region-b", "g2"),
            node("validator-b1", NodeRole::Validator, "region-b", "g2"),
            node("validator-b2", NodeRole::Validator, "region-b", "g1"),
            node("edge-c", NodeRole::Edge, "region-c", "g2"),
            node("validator-c1", NodeRole::Validator, "region-c", "g2"),
            node("validator-c2", NodeRole::Validator, "region-c", "g1"),
        ];
        for (i, n) in nodes.iter_mut().enumerate() {
            n.listen_addr = Some(format!("127.0.0.1:{}", 8700 + i));
            if n.node_id == "validator-c1" {
                n.out_of_band = true;
            }
        }
        Self {
            tenant_id: tenant_id.to_string(),
            data_dir: data_dir.into(),
            signature_scheme: SchemeKind::Ed25519,
            replication: ReplicationConfig::default(),
            sync: SyncConfig::default(),
            nodes,
            policy: PolicyDocument::demo(),
        }
    }
}
