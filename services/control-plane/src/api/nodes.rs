//! Node API endpoints.
//!
//! Registration and the desired-set fetch are called by node agents; the
//! list/get endpoints double as the operator surface. An agent's fetch of
//! its own node doubles as its heartbeat.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use corral_models::{Node, RegisterNodeRequest, StatusReport};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Create node routes, mounted at `/nodes`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(register_node))
        .route("/{id}", get(get_node))
        .route("/{id}/containers/{container_id}/status", post(report_status))
}

#[derive(Debug, Serialize)]
struct ListNodesResponse {
    nodes: Vec<Node>,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

/// GET /nodes
async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.manager().list_nodes().await;
    Json(ListNodesResponse { nodes })
}

/// GET /nodes/{id}
///
/// Returns the node plus its desired container set and refreshes the node's
/// `last_seen` (agents poll this endpoint every tick).
async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.manager().node_view(&id).await?;
    Ok(Json(view))
}

/// POST /nodes
///
/// Idempotent registration: repeated registrations of the same id refresh
/// the existing record.
async fn register_node(
    State(state): State<AppState>,
    payload: Result<Json<RegisterNodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload
        .map_err(|rejection| ApiError::bad_request("invalid_body", rejection.body_text()))?;
    state.manager().register_node(req).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /nodes/{id}/containers/{container_id}/status
///
/// Agent-facing status report for one container.
async fn report_status(
    State(state): State<AppState>,
    Path((id, container_id)): Path<(String, String)>,
    Json(report): Json<StatusReport>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager()
        .report_status(&id, &container_id, report.status)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}
