//! Error types for credibility mesh operations.

use thiserror::Error;

use crate::gossip::TransportError;
use crate::quorum::QuorumError;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Logstore failure on a node's own log
    #[error("Logstore error: {0}")]
    Logstore(#[from] credmesh_core::LogstoreError),

    /// Configuration or policy errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signing error: {0}")]
    Signing(#[from] credmesh_crypto::SigningError),

    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    /// Node task has stopped and no longer accepts commands
    #[error("Node unavailable: {node_id}")]
    NodeUnavailable { node_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<credmesh_core::CoreError> for MeshError {
    fn from(e: credmesh_core::CoreError) -> Self {
        match e {
            credmesh_core::CoreError::Io(io) => MeshError::Io(io),
            credmesh_core::CoreError::Serialization(se) => MeshError::Serialization(se),
            other => MeshError::Config(other.to_string()),
        }
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
