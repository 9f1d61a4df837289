//! Credibility Mesh
//!
//! This crate implements the distributed credibility mesh:
//! - Signed evidence envelopes, validation votes and integrity flags
//! - Push/pull log replication between nodes with partition simulation
//! - Node runtime with edge, validator, aggregator and seal authority roles
//! - Source sequence, watermark and correlation checks on incoming evidence
//! - Federated quorum engine with region and correlation-group diversity
//! - Hash-chained sealing of aggregation outcomes
//! - Cross-node verification of signatures and seal chains
//!
//! A claim is only ever VERIFIED by passing the full quorum rule; anything
//! the mesh cannot currently evaluate stays UNKNOWN.

pub mod audit;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod node;
pub mod projection;
pub mod quorum;
pub mod scenario;
pub mod service;
pub mod summary;
pub mod sync;

pub use audit::{verify_tenant, MeshVerifier, VerificationReport, Verdict};
pub use directory::{MeshDirectory, NodeDescriptor};
pub use envelope::{
    AggregationRecord, ClaimRecord, DecisionReason, EvidenceEnvelope, IntegrityFlag,
    IntegritySignal, MeshEntry, MeshRecord, SealChainEntry, SourceStamp, ValidationRecord,
    VoteDraft,
};
pub use error::{MeshError, MeshResult};
pub use gossip::{
    LocalTransport, PullRequest, PullResponse, PushAck, PushBatch, ReachabilityMatrix,
    Replicator, SharedReachability, Transport, TransportError,
};
pub use node::{
    spawn_node, IngestReport, LogSnapshot, MeshNode, NodeHandle, NodePaths, Observation,
    StanceHeuristic, StepReport, ValidatorHeuristic,
};
pub use quorum::{FederatedQuorumEngine, QuorumError, QuorumInput, QuorumOutcome};
pub use scenario::{PhaseReport, ScenarioController, ScenarioPhase};
pub use service::{CycleReport, MeshInstance};
pub use summary::{MeshSummary, NodeStatus};
pub use sync::{CorrelationCluster, CorrelationRisk, SourceHealth, SyncMonitor};
