//! Container API endpoints.
//!
//! Handlers translate HTTP into state manager operations and nothing else;
//! every error reaches the wire as a typed problem+json status.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use corral_models::{Container, ContainerPatch, CreateContainerRequest, DesiredStatus};
use futures_util::stream::unfold;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::hub::{StatusEvent, StatusSubscription};
use crate::state::AppState;
use crate::store::ContainerView;

/// Create container routes, mounted at `/containers`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_containers).post(create_container))
        .route(
            "/{id}",
            get(get_container)
                .patch(patch_container)
                .delete(delete_container),
        )
        .route("/{id}/start", post(start_container))
        .route("/{id}/stop", post(stop_container))
        .route("/{id}/status", get(stream_status))
}

/// A container as returned to API clients, with derived scheduling state.
#[derive(Debug, Serialize)]
pub struct ContainerResponse {
    #[serde(flatten)]
    pub container: Container,

    /// True when no fresh node owns this container.
    pub unscheduled: bool,
}

impl From<ContainerView> for ContainerResponse {
    fn from(view: ContainerView) -> Self {
        Self {
            container: view.container,
            unscheduled: view.unscheduled,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListContainersResponse {
    containers: Vec<ContainerResponse>,
}

#[derive(Debug, Serialize)]
struct CreatedContainerResponse {
    container: Container,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

/// GET /containers
async fn list_containers(State(state): State<AppState>) -> impl IntoResponse {
    let containers = state
        .manager()
        .list_containers()
        .await
        .into_iter()
        .map(ContainerResponse::from)
        .collect();

    Json(ListContainersResponse { containers })
}

/// POST /containers
async fn create_container(
    State(state): State<AppState>,
    payload: Result<Json<CreateContainerRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(bad_body)?;
    let container = state.manager().add_container(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedContainerResponse { container }),
    ))
}

/// GET /containers/{id}
async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.manager().get_container(&id).await?;
    Ok(Json(ContainerResponse::from(view)))
}

/// PATCH /containers/{id}
///
/// Only mutable fields are accepted; a body naming `id` or `node_id` is a
/// validation failure.
async fn patch_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ContainerPatch>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(patch) = payload.map_err(bad_body)?;
    state.manager().patch_container(&id, patch).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Malformed or out-of-contract bodies are validation failures, never 5xx.
fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request("invalid_body", rejection.body_text())
}

/// DELETE /containers/{id}
async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager().remove_container(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /containers/{id}/start
async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_desired_status(&state, &id, DesiredStatus::Running).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /containers/{id}/stop
async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_desired_status(&state, &id, DesiredStatus::Stopped).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn set_desired_status(
    state: &AppState,
    id: &str,
    desired: DesiredStatus,
) -> Result<(), ApiError> {
    let patch = ContainerPatch {
        desired_status: Some(desired),
        ..Default::default()
    };
    state.manager().patch_container(id, patch).await?;
    Ok(())
}

/// GET /containers/{id}/status
///
/// Streams status changes as server-sent events named `status`. Idle
/// connections get a comment-only heartbeat every 30 seconds; deleting the
/// container emits a final `gone` event and ends the stream.
async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state.manager().subscribe_status(&id).await?;

    let stream = unfold(
        (subscription, false),
        |(mut subscription, finished): (StatusSubscription, bool)| async move {
            if finished {
                return None;
            }
            let event = subscription.recv().await?;
            let (data, finished) = match event {
                StatusEvent::Status(status) => (status.to_string(), false),
                StatusEvent::Lagged => ("lagged".to_string(), false),
                StatusEvent::Gone => ("gone".to_string(), true),
            };
            let sse_event = Event::default().event("status").data(data);
            Some((Ok::<Event, Infallible>(sse_event), (subscription, finished)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30))))
}
