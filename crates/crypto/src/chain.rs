//! Seal Chain Module - BLAKE3 hash-linked seal entries
//!
//! Each seal authority keeps its own chain. An entry commits to the previous
//! entry's seal hash, the policy hash in force, and the snapshot of the
//! aggregation it seals:
//!
//! ```text
//! seal_hash = BLAKE3(prev_seal_hash | policy_hash | snapshot_hash | canonical(aggregation))
//! ```
//!
//! The first entry of every chain links to [`GENESIS_MARKER`].
//!
//! - Tamper detection: changing any committed field changes the seal hash
//! - Reordering detection: entries out of sequence break `prev_seal_hash`
//! - Verification is linear in chain length and stops at the first break

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `prev_seal_hash` of the first entry in a chain
pub const GENESIS_MARKER: &str = "GENESIS";

const FIELD_SEPARATOR: &[u8] = b"|";

/// Snapshot hash of an aggregation record's canonical bytes
pub fn compute_snapshot_hash(aggregation_canonical: &[u8]) -> String {
    credmesh_core::digest_hex(aggregation_canonical)
}

/// Seal hash over the four committed components.
pub fn compute_seal_hash(
    prev_seal_hash: &str,
    policy_hash: &str,
    snapshot_hash: &str,
    aggregation_canonical: &[u8],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_seal_hash.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(policy_hash.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(snapshot_hash.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(aggregation_canonical);
    hasher.finalize().to_hex().to_string()
}

/// Errors raised while checking a single link.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("Snapshot hash mismatch: stored {stored}, recomputed {recomputed}")]
    SnapshotMismatch { stored: String, recomputed: String },

    #[error("Seal hash mismatch: stored {stored}, recomputed {recomputed}")]
    HashMismatch { stored: String, recomputed: String },

    #[error("Broken link: expected prev {expected}, found {actual}")]
    BrokenLink { expected: String, actual: String },

    #[error("Invalid genesis: first entry links to {actual}")]
    InvalidGenesis { actual: String },

    #[error("Cannot canonicalize sealed record: {0}")]
    Canonicalization(String),
}

/// Something that can be checked as a seal-chain link.
pub trait SealLink {
    fn seal_hash(&self) -> &str;
    fn prev_seal_hash(&self) -> &str;
    fn policy_hash(&self) -> &str;
    fn snapshot_hash(&self) -> &str;
    /// Canonical bytes of the sealed aggregation
    fn sealed_canonical(&self) -> Result<Vec<u8>, ChainError>;

    /// Recompute snapshot and seal hash and compare with stored values.
    fn verify_hash(&self) -> Result<(), ChainError> {
        let canonical = self.sealed_canonical()?;
        let snapshot = compute_snapshot_hash(&canonical);
        if snapshot != self.snapshot_hash() {
            return Err(ChainError::SnapshotMismatch {
                stored: self.snapshot_hash().to_string(),
                recomputed: snapshot,
            });
        }
        let recomputed = compute_seal_hash(
            self.prev_seal_hash(),
            self.policy_hash(),
            self.snapshot_hash(),
            &canonical,
        );
        if recomputed != self.seal_hash() {
            return Err(ChainError::HashMismatch {
                stored: self.seal_hash().to_string(),
                recomputed,
            });
        }
        Ok(())
    }

    fn verify_link(&self, expected_prev: &str) -> Result<(), ChainError> {
        if self.prev_seal_hash() != expected_prev {
            return Err(ChainError::BrokenLink {
                expected: expected_prev.to_string(),
                actual: self.prev_seal_hash().to_string(),
            });
        }
        Ok(())
    }
}

/// Result of chain verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerifyResult {
    Ok,
    /// First broken link
    Error { error_type: String, index: usize },
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyResult::Ok)
    }
}

/// Verify a whole chain from genesis, reporting the first broken link.
///
/// An empty chain is valid: the authority has sealed nothing yet.
pub fn verify_chain<L: SealLink>(links: &[L]) -> VerifyResult {
    if let Some(first) = links.first() {
        if first.prev_seal_hash() != GENESIS_MARKER {
            return VerifyResult::Error {
                error_type: format!(
                    "invalid_genesis: {}",
                    ChainError::InvalidGenesis {
                        actual: first.prev_seal_hash().to_string()
                    }
                ),
                index: 0,
            };
        }
    }

    for (i, link) in links.iter().enumerate() {
        if let Err(e) = link.verify_hash() {
            let kind = match e {
                ChainError::SnapshotMismatch { .. } => "snapshot_mismatch",
                _ => "hash_mismatch",
            };
            return VerifyResult::Error {
                error_type: format!("{}: {}", kind, e),
                index: i,
            };
        }

        if i > 0 {
            if let Err(e) = link.verify_link(links[i - 1].seal_hash()) {
                return VerifyResult::Error {
                    error_type: format!("broken_link: {}", e),
                    index: i,
                };
            }
        }
    }

    VerifyResult::Ok
}
