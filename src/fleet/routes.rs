//! REST endpoints for fleet administration.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use super::manager::FleetManager;
use crate::error::FleetError;

/// Shared state for fleet routes.
#[derive(Clone)]
pub struct FleetRouteState {
    pub fleet: Arc<FleetManager>,
}

#[derive(Debug, Deserialize)]
struct CreateWorkerRequest {
    gpu: String,
    endpoint: String,
}

/// GET /api/sakura/workers
async fn list_workers(State(state): State<FleetRouteState>) -> impl IntoResponse {
    Json(state.fleet.list_workers().await)
}

/// POST /api/sakura/workers
///
/// Registers a server and returns the new worker id. The worker is created
/// stopped.
async fn create_worker(
    State(state): State<FleetRouteState>,
    Json(body): Json<CreateWorkerRequest>,
) -> Response {
    match state.fleet.create_worker(&body.gpu, &body.endpoint).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({"id": id}))).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/sakura/workers/{id}/start
async fn start_worker(
    State(state): State<FleetRouteState>,
    Path(id): Path<String>,
) -> StatusCode {
    state.fleet.start_worker(&id).await;
    StatusCode::NO_CONTENT
}

/// POST /api/sakura/workers/{id}/stop
///
/// Returns once the worker has reached a safe stopping point.
async fn stop_worker(State(state): State<FleetRouteState>, Path(id): Path<String>) -> StatusCode {
    state.fleet.stop_worker(&id).await;
    StatusCode::NO_CONTENT
}

/// DELETE /api/sakura/workers/{id}
async fn delete_worker(
    State(state): State<FleetRouteState>,
    Path(id): Path<String>,
) -> Response {
    match state.fleet.delete_worker(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: FleetError) -> Response {
    let status = match &err {
        FleetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        FleetError::Registry(_) => {
            error!(error = %err, "Fleet registry operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

/// Build the fleet administration routes.
pub fn fleet_routes(state: FleetRouteState) -> Router {
    Router::new()
        .route("/api/sakura/workers", get(list_workers).post(create_worker))
        .route("/api/sakura/workers/{id}/start", post(start_worker))
        .route("/api/sakura/workers/{id}/stop", post(stop_worker))
        .route("/api/sakura/workers/{id}", delete(delete_worker))
        .with_state(state)
}
