//! Core types shared by every mesh crate

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable node identifier, unique within a tenant mesh
pub type NodeId = String;

/// Role a node plays in the mesh. Fixed at mesh initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Observes payloads and emits signed evidence envelopes
    Edge,
    /// Evaluates envelopes and emits signed votes
    Validator,
    /// Runs the federated quorum engine over votes
    Aggregator,
    /// Hash-chains aggregation outcomes
    SealAuthority,
}

impl NodeRole {
    /// All roles in the order a mesh cycle drives them
    pub const PIPELINE: [NodeRole; 4] = [
        NodeRole::Edge,
        NodeRole::Validator,
        NodeRole::Aggregator,
        NodeRole::SealAuthority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Edge => "edge",
            NodeRole::Validator => "validator",
            NodeRole::Aggregator => "aggregator",
            NodeRole::SealAuthority => "seal_authority",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reachability of a node as seen by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Healthy,
    /// Reachable only from nodes in the same partition island
    Partitioned,
    /// Not reachable at all, and not running local work
    Offline,
}

/// Derived status of a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    /// Not enough diverse evidence to evaluate. The partition-safe default.
    #[default]
    Unknown,
    Pending,
    Verified,
    Invalid,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Unknown => "UNKNOWN",
            ClaimStatus::Pending => "PENDING",
            ClaimStatus::Verified => "VERIFIED",
            ClaimStatus::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// A validator's vote on a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Confirm,
    Deny,
    Abstain,
}

/// Current wall-clock time in Unix milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
