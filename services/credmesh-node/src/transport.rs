//! Replication over HTTP between standalone node processes.

use async_trait::async_trait;
use credmesh_core::{NodeId, ReplicationConfig};
use credmesh_trust_mesh::{
    MeshDirectory, PullRequest, PullResponse, PushAck, PushBatch, Transport, TransportError,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

/// Resolves peers through their configured `listen_addr`.
pub struct HttpTransport {
    client: reqwest::Client,
    tenant_id: String,
    addrs: HashMap<NodeId, String>,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(directory: &MeshDirectory, config: &ReplicationConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TransportError::Protocol(format!("http client: {}", e)))?;
        let addrs = directory
            .nodes()
            .filter_map(|n| n.listen_addr.clone().map(|addr| (n.node_id.clone(), addr)))
            .collect();
        Ok(Self {
            client,
            tenant_id: directory.tenant_id().to_string(),
            addrs,
            timeout_ms: config.timeout_ms,
        })
    }

    fn url(&self, peer: &str, action: &str) -> Result<String, TransportError> {
        let addr = self.addrs.get(peer).ok_or_else(|| TransportError::UnknownPeer {
            peer: peer.to_string(),
        })?;
        Ok(format!("http://{}/mesh/{}/{}/{}", addr, self.tenant_id, peer, action))
    }

    fn map_error(&self, peer: &str, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                peer: peer.to_string(),
                timeout_ms: self.timeout_ms,
            }
        } else if error.is_connect() || error.is_request() {
            TransportError::Unreachable {
                peer: peer.to_string(),
            }
        } else {
            TransportError::Protocol(format!("{}: {}", peer, error))
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        peer: &str,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                peer: peer.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        response.json().await.map_err(|e| self.map_error(peer, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(&self, _from: &str, peer: &str, batch: PushBatch) -> Result<PushAck, TransportError> {
        let response = self
            .client
            .post(self.url(peer, "push")?)
            .json(&batch)
            .send()
            .await
            .map_err(|e| self.map_error(peer, e))?;
        self.decode(peer, response).await
    }

    async fn pull(
        &self,
        from: &str,
        peer: &str,
        request: PullRequest,
    ) -> Result<PullResponse, TransportError> {
        let response = self
            .client
            .get(self.url(peer, "pull")?)
            .query(&[
                ("since", request.since.to_string()),
                ("limit", request.limit.to_string()),
                ("requester", from.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.map_error(peer, e))?;
        self.decode(peer, response).await
    }
}
