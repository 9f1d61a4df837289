//! Mesh Directory
//!
//! Immutable node identities for one tenant: role, region, correlation
//! group and public key. Built once at mesh-instance construction from the
//! configuration and the tenant keyring, then shared read-only.

use credmesh_core::{MeshConfig, NodeId, NodeRole, SchemeKind};
use credmesh_crypto::{backend_for, Keyring, SignatureBackend, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::envelope::{EvidenceEnvelope, ValidationRecord};
use crate::error::{MeshError, MeshResult};

/// Public identity of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub region: String,
    pub correlation_group: String,
    pub out_of_band: bool,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub listen_addr: Option<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// All node identities of a tenant mesh
#[derive(Debug, Clone)]
pub struct MeshDirectory {
    tenant_id: String,
    backend: Arc<dyn SignatureBackend>,
    nodes: BTreeMap<NodeId, NodeDescriptor>,
}

impl MeshDirectory {
    /// Join configured nodes with their keyring public keys.
    pub fn from_config(config: &MeshConfig, keyring: &Keyring) -> MeshResult<Self> {
        if keyring.scheme != config.signature_scheme {
            return Err(MeshError::Config(format!(
                "keyring scheme {:?} does not match configured scheme {:?}",
                keyring.scheme, config.signature_scheme
            )));
        }
        let mut nodes = BTreeMap::new();
        for spec in &config.nodes {
            let public_key =
                keyring
                    .public_key(&spec.node_id)
                    .ok_or_else(|| MeshError::Config(format!(
                        "no key for node '{}' in keyring",
                        spec.node_id
                    )))?;
            nodes.insert(
                spec.node_id.clone(),
                NodeDescriptor {
                    node_id: spec.node_id.clone(),
                    role: spec.role,
                    region: spec.region.clone(),
                    correlation_group: spec.correlation_group.clone(),
                    out_of_band: spec.out_of_band,
                    public_key,
                    listen_addr: spec.listen_addr.clone(),
                },
            );
        }
        Ok(Self {
            tenant_id: config.tenant_id.clone(),
            backend: backend_for(config.signature_scheme),
            nodes,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn scheme(&self) -> SchemeKind {
        self.backend.scheme()
    }

    pub fn backend(&self) -> &dyn SignatureBackend {
        self.backend.as_ref()
    }

    /// Trust level of every signature in this mesh
    pub fn trust_level(&self) -> TrustLevel {
        self.backend.trust_level()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    pub fn with_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(move |n| n.role == role)
    }

    /// Every other node of the tenant
    pub fn peers_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeDescriptor> {
        self.nodes.values().filter(move |n| n.node_id != node_id)
    }

    /// Verify an envelope against its claimed signer. Unknown signers fail.
    pub fn verify_envelope(&self, envelope: &EvidenceEnvelope) -> bool {
        self.get(&envelope.signer_node_id)
            .map(|n| envelope.verify(self.backend(), &n.public_key))
            .unwrap_or(false)
    }

    /// Verify a vote. The signer must exist and be a validator.
    pub fn verify_validation(&self, record: &ValidationRecord) -> bool {
        match self.get(&record.validator_id) {
            Some(n) if n.role == NodeRole::Validator => {
                record.verify(self.backend(), &n.public_key)
            }
            _ => false,
        }
    }
}
