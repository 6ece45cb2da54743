//! Liveness endpoint.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}
