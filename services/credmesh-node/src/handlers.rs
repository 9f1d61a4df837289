use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use credmesh_trust_mesh::{
    MeshSummary, NodeStatus, PullRequest, PullResponse, PushAck, PushBatch, TransportError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PullParams {
    #[serde(default)]
    pub since: u64,
    pub limit: Option<usize>,
    #[serde(default)]
    pub requester: String,
}

fn rejection_status(error: &TransportError) -> StatusCode {
    match error {
        TransportError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TransportError::UnknownPeer { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "credmesh",
        "version": env!("CARGO_PKG_VERSION"),
        "tenant_id": state.tenant_id(),
        "nodes": state.nodes.len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })))
}

pub async fn push(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, node_id)): Path<(String, String)>,
    Json(mut batch): Json<PushBatch>,
) -> Result<Json<PushAck>, StatusCode> {
    let handle = state
        .node(&tenant_id, &node_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    batch.tenant_id = tenant_id;

    match handle.accept_push(batch).await {
        Ok(ack) => {
            if ack.rejected > 0 {
                warn!(node_id = %node_id, rejected = ack.rejected, "Pushed batch held rejected entries");
            }
            Ok(Json(ack))
        }
        Err(e) => {
            error!(node_id = %node_id, error = %e, "Push failed");
            Err(rejection_status(&e))
        }
    }
}

pub async fn pull(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, node_id)): Path<(String, String)>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, StatusCode> {
    let handle = state
        .node(&tenant_id, &node_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let request = PullRequest {
        tenant_id,
        requester: params.requester,
        since: params.since,
        limit: params
            .limit
            .unwrap_or(state.config.replication.batch_limit)
            .max(1),
    };
    debug!(node_id = %node_id, requester = %request.requester, since = request.since, "Serving pull");
    handle
        .serve_pull(request)
        .map(Json)
        .map_err(|e| rejection_status(&e))
}

pub async fn node_status(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, node_id)): Path<(String, String)>,
) -> Result<Json<NodeStatus>, StatusCode> {
    let handle = state
        .node(&tenant_id, &node_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    state
        .node_status(handle)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn summary(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<MeshSummary>, StatusCode> {
    if tenant_id != state.tenant_id() {
        return Err(StatusCode::NOT_FOUND);
    }
    state.summary().await.map(Json).map_err(|e| {
        error!(tenant_id = %tenant_id, error = %e, "Summary failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
