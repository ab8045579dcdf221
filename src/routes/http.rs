// HTTP handlers: version, snapshots, update checks, container/stack actions

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

use super::AppState;
use crate::error::RemoteError;
use crate::models::{EndpointId, StackId, StackUpdateResponse};
use crate::orchestrator::MAX_STACK_UPDATE_TIMEOUT;
use crate::service::ServiceError;
use crate::version::{NAME, VERSION};

/// Service failure mapped onto an HTTP status with a JSON `{"error": ..}` body.
pub(super) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = match &e {
            ServiceError::UnknownEndpoint(_) | ServiceError::UnknownContainer { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::UpdateChecksDisabled => StatusCode::CONFLICT,
            ServiceError::Remote(RemoteError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Remote(RemoteError::RateLimited(_)) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Remote(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// GET /version: service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// GET /api/endpoints
pub(super) async fn endpoints_handler(State(state): State<AppState>) -> impl IntoResponse {
    let endpoints: Vec<_> = state.pilot.endpoints().cloned().collect();
    Json(endpoints)
}

/// GET /api/endpoints/{endpoint_id}/snapshot: latest retained state; check `degraded`.
pub(super) async fn snapshot_handler(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
) -> ApiResult {
    let snapshot = state.pilot.get_snapshot(endpoint_id)?;
    Ok(Json(snapshot.as_ref()).into_response())
}

/// POST /api/endpoints/{endpoint_id}/refresh: waits for the in-flight or a new refresh.
pub(super) async fn refresh_handler(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
) -> ApiResult {
    let snapshot = state.pilot.force_refresh(endpoint_id).await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn update_check_handler(
    State(state): State<AppState>,
    Path((endpoint_id, container_id)): Path<(EndpointId, String)>,
) -> ApiResult {
    let check = state
        .pilot
        .request_update_check(endpoint_id, &container_id)
        .await?;
    Ok(Json(check).into_response())
}

pub(super) async fn start_container_handler(
    State(state): State<AppState>,
    Path((endpoint_id, container_id)): Path<(EndpointId, String)>,
) -> ApiResult {
    let snapshot = state
        .pilot
        .start_container(endpoint_id, &container_id)
        .await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn restart_container_handler(
    State(state): State<AppState>,
    Path((endpoint_id, container_id)): Path<(EndpointId, String)>,
) -> ApiResult {
    let snapshot = state
        .pilot
        .restart_container(endpoint_id, &container_id)
        .await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn pull_image_handler(
    State(state): State<AppState>,
    Path((endpoint_id, container_id)): Path<(EndpointId, String)>,
) -> ApiResult {
    let snapshot = state.pilot.pull_image(endpoint_id, &container_id).await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn stop_container_handler(
    State(state): State<AppState>,
    Path((endpoint_id, container_id)): Path<(EndpointId, String)>,
) -> ApiResult {
    let snapshot = state
        .pilot
        .stop_container(endpoint_id, &container_id)
        .await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackUpdateRequest {
    timeout_secs: Option<u64>,
}

/// POST /api/endpoints/{endpoint_id}/stacks/{stack_id}/update: body `{"timeoutSecs": n}` is
/// optional. 200 with the result, or 409 with the active operation when the stack is busy.
pub(super) async fn stack_update_handler(
    State(state): State<AppState>,
    Path((endpoint_id, stack_id)): Path<(EndpointId, StackId)>,
    body: Bytes,
) -> ApiResult {
    let request: StackUpdateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StackUpdateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };
    if let Some(secs) = request.timeout_secs
        && !(1..=MAX_STACK_UPDATE_TIMEOUT.as_secs()).contains(&secs)
    {
        return Err(ApiError::bad_request(format!(
            "timeoutSecs must be between 1 and {}",
            MAX_STACK_UPDATE_TIMEOUT.as_secs()
        )));
    }
    let response = state
        .pilot
        .request_stack_update(
            endpoint_id,
            stack_id,
            request.timeout_secs.map(Duration::from_secs),
        )
        .await?;
    Ok(match response {
        StackUpdateResponse::Finished(result) => Json(result).into_response(),
        StackUpdateResponse::Busy(op) => (StatusCode::CONFLICT, Json(op)).into_response(),
    })
}

pub(super) async fn stop_stack_handler(
    State(state): State<AppState>,
    Path((endpoint_id, stack_id)): Path<(EndpointId, StackId)>,
) -> ApiResult {
    let snapshot = state.pilot.stop_stack(endpoint_id, stack_id).await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn start_stack_handler(
    State(state): State<AppState>,
    Path((endpoint_id, stack_id)): Path<(EndpointId, StackId)>,
) -> ApiResult {
    let snapshot = state.pilot.start_stack(endpoint_id, stack_id).await?;
    Ok(Json(snapshot.as_ref()).into_response())
}

pub(super) async fn active_operation_handler(
    State(state): State<AppState>,
    Path((endpoint_id, stack_id)): Path<(EndpointId, StackId)>,
) -> ApiResult {
    match state.pilot.active_operation(endpoint_id, stack_id)? {
        Some(op) => Ok(Json(op).into_response()),
        None => Err(ApiError::not_found(format!(
            "no active operation for stack {stack_id}"
        ))),
    }
}

pub(super) async fn last_update_handler(
    State(state): State<AppState>,
    Path((endpoint_id, stack_id)): Path<(EndpointId, StackId)>,
) -> ApiResult {
    match state.pilot.last_stack_update(endpoint_id, stack_id)? {
        Some(result) => Ok(Json(result).into_response()),
        None => Err(ApiError::not_found(format!(
            "no finished update for stack {stack_id}"
        ))),
    }
}
