//! Core functionality for the Credibility Mesh.
//!
//! This crate provides the fundamental types, configuration, logging and the
//! append-only logstore used across the mesh crates.

pub mod canonical;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod types;

pub use canonical::{canonical_json, digest_hex};
pub use config::{
    MeshConfig, NodeSpec, PolicyDocument, QuorumPolicy, ReplicationConfig, SchemeKind, SyncConfig,
    TierRule,
};
pub use error::{CoreError, Result};
pub use ledger::{
    segment_path, AppendOutcome, LogEntry, Logstore, LogstoreError, LogstoreHealth,
    LogstoreMetrics, PendingEntry, DEFAULT_SEGMENT_ENTRIES,
};
pub use types::{current_timestamp_ms, ClaimStatus, NodeId, NodeRole, Reachability, Vote};
