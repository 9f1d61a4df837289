use credmesh_core::{MeshConfig, NodeId};
use credmesh_trust_mesh::{
    MeshDirectory, MeshInstance, MeshResult, MeshSummary, MeshVerifier, NodeHandle, NodeStatus,
    SharedReachability,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// What is running behind the HTTP surface
pub enum Runtime {
    /// Every node of the tenant, driven by the cycle loop
    Mesh(Arc<Mutex<MeshInstance>>),
    /// One node of a multi-process deployment
    Standalone,
}

pub struct AppState {
    pub config: MeshConfig,
    pub directory: Arc<MeshDirectory>,
    pub policy_hash: String,
    pub nodes: BTreeMap<NodeId, NodeHandle>,
    pub reachability: SharedReachability,
    pub runtime: Runtime,
    pub started_at: Instant,
}

impl AppState {
    /// Serve every node of an in-process mesh.
    pub fn for_mesh(mesh: MeshInstance) -> Self {
        let nodes = mesh
            .handles()
            .map(|h| (h.node_id().to_string(), h.clone()))
            .collect();
        Self {
            config: mesh.config().clone(),
            directory: Arc::new(mesh.directory().clone()),
            policy_hash: mesh.engine().policy_hash().to_string(),
            nodes,
            reachability: mesh.reachability(),
            runtime: Runtime::Mesh(Arc::new(Mutex::new(mesh))),
            started_at: Instant::now(),
        }
    }

    /// Serve a single node running in this process.
    pub fn for_node(
        config: MeshConfig,
        directory: Arc<MeshDirectory>,
        policy_hash: String,
        handle: NodeHandle,
        reachability: SharedReachability,
    ) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(handle.node_id().to_string(), handle);
        Self {
            config,
            directory,
            policy_hash,
            nodes,
            reachability,
            runtime: Runtime::Standalone,
            started_at: Instant::now(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    pub fn node(&self, tenant_id: &str, node_id: &str) -> Option<&NodeHandle> {
        if tenant_id != self.tenant_id() {
            return None;
        }
        self.nodes.get(node_id)
    }

    pub async fn node_status(&self, handle: &NodeHandle) -> Option<NodeStatus> {
        let descriptor = self.directory.get(handle.node_id())?;
        let reachability = self.reachability.read().await.state(handle.node_id());
        Some(NodeStatus::from_snapshot(
            descriptor,
            &handle.snapshot(),
            reachability,
        ))
    }

    /// Tenant summary. A standalone node summarizes its own replica.
    pub async fn summary(&self) -> MeshResult<MeshSummary> {
        match &self.runtime {
            Runtime::Mesh(mesh) => mesh.lock().await.summary().await,
            Runtime::Standalone => {
                let mut logs = BTreeMap::new();
                let mut statuses = Vec::with_capacity(self.nodes.len());
                for handle in self.nodes.values() {
                    logs.insert(
                        handle.node_id().to_string(),
                        handle.snapshot().entries.as_ref().clone(),
                    );
                    if let Some(status) = self.node_status(handle).await {
                        statuses.push(status);
                    }
                }
                let verification =
                    MeshVerifier::new(&self.directory).verify(&logs, &BTreeMap::new());
                Ok(MeshSummary::build(
                    &self.directory,
                    &self.config.sync,
                    &self.config.policy.version,
                    &self.policy_hash,
                    statuses,
                    &logs,
                    &verification,
                ))
            }
        }
    }
}
