//! Signature Backends - pluggable signing for evidence and votes
//!
//! Two implementations sit behind [`SignatureBackend`]:
//! - [`Ed25519Backend`]: asymmetric signatures, full trust
//! - [`KeyedDigestBackend`]: BLAKE3 keyed digest for meshes without key
//!   distribution. Anyone holding the keyring can forge, so evidence signed
//!   this way carries [`TrustLevel::Degraded`]
//!
//! The backend is chosen once per mesh instance. Verification never returns
//! an error: a malformed key or signature is simply `false`.

use credmesh_core::SchemeKind;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::keys::SigningKeypair;

/// How much a signature can be trusted as proof of origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Full,
    Degraded,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::Full => f.write_str("full"),
            TrustLevel::Degraded => f.write_str("degraded"),
        }
    }
}

/// Trust level carried by signatures produced under `scheme`
pub fn trust_level(scheme: SchemeKind) -> TrustLevel {
    match scheme {
        SchemeKind::Ed25519 => TrustLevel::Full,
        SchemeKind::KeyedDigest => TrustLevel::Degraded,
    }
}

/// Errors that can occur during signing operations.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Serialization error: {reason}")]
    SerializationError { reason: String },

    #[error("Cryptographic error: {reason}")]
    CryptoError { reason: String },

    #[error("Scheme mismatch: backend {backend:?}, key {key:?}")]
    SchemeMismatch { backend: SchemeKind, key: SchemeKind },

    #[error("Key not found: {key_id}")]
    KeyNotFound { key_id: String },
}

impl From<serde_json::Error> for SigningError {
    fn from(e: serde_json::Error) -> Self {
        SigningError::SerializationError {
            reason: e.to_string(),
        }
    }
}

/// A signature scheme implementation
pub trait SignatureBackend: Send + Sync + fmt::Debug {
    fn scheme(&self) -> SchemeKind;

    fn trust_level(&self) -> TrustLevel {
        trust_level(self.scheme())
    }

    /// Generate a fresh keypair for this scheme
    fn generate(&self) -> SigningKeypair;

    fn sign(&self, keypair: &SigningKeypair, message: &[u8]) -> Result<Vec<u8>, SigningError>;

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn check_scheme(backend: SchemeKind, keypair: &SigningKeypair) -> Result<(), SigningError> {
    if keypair.scheme() != backend {
        return Err(SigningError::SchemeMismatch {
            backend,
            key: keypair.scheme(),
        });
    }
    Ok(())
}

/// Ed25519 over the message bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Backend;

impl SignatureBackend for Ed25519Backend {
    fn scheme(&self) -> SchemeKind {
        SchemeKind::Ed25519
    }

    fn generate(&self) -> SigningKeypair {
        let secret = random_secret();
        let public = SigningKey::from_bytes(&secret).verifying_key().to_bytes().to_vec();
        SigningKeypair::new(SchemeKind::Ed25519, secret, public)
    }

    fn sign(&self, keypair: &SigningKeypair, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        check_scheme(self.scheme(), keypair)?;
        let signing_key = SigningKey::from_bytes(keypair.secret());
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

/// BLAKE3 keyed digest. The "public" key is the shared key itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyedDigestBackend;

impl SignatureBackend for KeyedDigestBackend {
    fn scheme(&self) -> SchemeKind {
        SchemeKind::KeyedDigest
    }

    fn generate(&self) -> SigningKeypair {
        let secret = random_secret();
        SigningKeypair::new(SchemeKind::KeyedDigest, secret, secret.to_vec())
    }

    fn sign(&self, keypair: &SigningKeypair, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        check_scheme(self.scheme(), keypair)?;
        Ok(blake3::keyed_hash(keypair.secret(), message).as_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(expected) = <[u8; 32]>::try_from(signature) else {
            return false;
        };
        // blake3::Hash equality is constant time
        blake3::keyed_hash(&key, message) == blake3::Hash::from(expected)
    }
}

/// Backend implementing `scheme`
pub fn backend_for(scheme: SchemeKind) -> Arc<dyn SignatureBackend> {
    match scheme {
        SchemeKind::Ed25519 => Arc::new(Ed25519Backend),
        SchemeKind::KeyedDigest => Arc::new(KeyedDigestBackend),
    }
}

/// Payload digest as hex
pub fn payload_hash(payload: &[u8]) -> String {
    credmesh_core::digest_hex(payload)
}

/// Hash `payload` and sign the hash. Returns `(payload_hash, signature)`.
pub fn sign_payload(
    backend: &dyn SignatureBackend,
    keypair: &SigningKeypair,
    payload: &[u8],
) -> Result<(String, Vec<u8>), SigningError> {
    let hash = payload_hash(payload);
    let signature = backend.sign(keypair, hash.as_bytes())?;
    Ok((hash, signature))
}

/// Check that `payload` hashes to `expected_hash` and that `signature`
/// covers that hash.
pub fn verify_payload(
    backend: &dyn SignatureBackend,
    public_key: &[u8],
    payload: &[u8],
    expected_hash: &str,
    signature: &[u8],
) -> bool {
    payload_hash(payload) == expected_hash
        && backend.verify(public_key, expected_hash.as_bytes(), signature)
}
