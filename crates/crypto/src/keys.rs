//! Cryptographic key management

use credmesh_core::{NodeId, SchemeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::signing::{SignatureBackend, SigningError};

/// A node's signing key material. Secret bytes are wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKeypair {
    #[zeroize(skip)]
    scheme: SchemeKind,
    secret: [u8; 32],
    public: Vec<u8>,
}

impl SigningKeypair {
    pub fn new(scheme: SchemeKind, secret: [u8; 32], public: Vec<u8>) -> Self {
        Self {
            scheme,
            secret,
            public,
        }
    }

    pub fn scheme(&self) -> SchemeKind {
        self.scheme
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub fn public_hex(&self) -> String {
        hex::encode(&self.public)
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("scheme", &self.scheme)
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyringEntry {
    public_key: String,
    secret_key: String,
}

/// Per-tenant key material for every node, persisted as `keyring.json`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Keyring {
    pub scheme: SchemeKind,
    entries: BTreeMap<NodeId, KeyringEntry>,
}

impl Keyring {
    /// Generate one keypair per node with `backend`.
    pub fn generate<'a>(
        backend: &dyn SignatureBackend,
        node_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let entries = node_ids
            .into_iter()
            .map(|id| {
                let keypair = backend.generate();
                (
                    id.to_string(),
                    KeyringEntry {
                        public_key: keypair.public_hex(),
                        secret_key: hex::encode(keypair.secret()),
                    },
                )
            })
            .collect();
        Self {
            scheme: backend.scheme(),
            entries,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let bytes = fs::read(path.as_ref()).map_err(|e| SigningError::KeyNotFound {
            key_id: format!("{}: {}", path.as_ref().display(), e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write atomically via a temp file and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SigningError> {
        let path = path.as_ref();
        let io_err = |e: std::io::Error| SigningError::CryptoError {
            reason: format!("writing keyring {}: {}", path.display(), e),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        info!(path = %path.display(), nodes = self.entries.len(), "Keyring saved");
        Ok(())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    pub fn public_key(&self, node_id: &str) -> Option<Vec<u8>> {
        self.entries
            .get(node_id)
            .and_then(|e| hex::decode(&e.public_key).ok())
    }

    pub fn keypair(&self, node_id: &str) -> Result<SigningKeypair, SigningError> {
        let entry = self
            .entries
            .get(node_id)
            .ok_or_else(|| SigningError::KeyNotFound {
                key_id: node_id.to_string(),
            })?;
        let bad = |what: &str| SigningError::CryptoError {
            reason: format!("malformed {} for {}", what, node_id),
        };
        let mut secret_bytes = hex::decode(&entry.secret_key).map_err(|_| bad("secret key"))?;
        let secret: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| bad("secret key"))?;
        secret_bytes.zeroize();
        let public = hex::decode(&entry.public_key).map_err(|_| bad("public key"))?;
        Ok(SigningKeypair::new(self.scheme, secret, public))
    }
}
