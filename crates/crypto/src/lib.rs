//! Cryptographic primitives for the Credibility Mesh.
//!
//! This crate provides signing, verification, hashing and key management
//! for evidence envelopes, validation votes and seal chains.
//!
//! # Core Capabilities
//!
//! - **Digital Signatures**: pluggable [`SignatureBackend`] with Ed25519 and
//!   a keyed-digest fallback
//! - **Trust Levels**: every scheme maps to a [`TrustLevel`] so weaker
//!   evidence stays visibly weaker in quorum evaluation
//! - **Seal Chains**: BLAKE3 hash-linked seal entries with first-break
//!   verification
//! - **Key Management**: per-tenant keyring generation and persistence
//!
//! # Security Principles
//!
//! - Hashing is BLAKE3 throughout
//! - Secrets are never logged and are zeroized on drop
//! - Verification failures are values, never panics

pub mod chain;
pub mod keys;
pub mod signing;

pub use chain::{
    compute_seal_hash, compute_snapshot_hash, verify_chain, ChainError, SealLink, VerifyResult,
    GENESIS_MARKER,
};
pub use keys::{Keyring, SigningKeypair};
pub use signing::{
    backend_for, payload_hash, sign_payload, trust_level, verify_payload, Ed25519Backend,
    KeyedDigestBackend, SignatureBackend, SigningError, TrustLevel,
};
