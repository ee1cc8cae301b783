//! HTTP handlers
//!
//! Thin translation between the wire and the session manager; no session
//! policy lives here.

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::session::SessionState;
use crate::services::session_manager::AttachRequest;
use crate::services::metrics_aggregator::{Alert, StatsSnapshot};
use crate::web::AppState;
use crate::web::responses::ApiResponse;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AttachBody {
    pub provider_id: String,
    pub upstream_url: String,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AttachResponse {
    pub stream_handle: Uuid,
    pub session_key: String,
    pub viewer_count: u32,
    /// Whether this attach spawned the shared upstream
    pub created: bool,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DetachResponse {
    pub session_key: String,
    pub remaining_viewers: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub alerts: Vec<Alert>,
}

/// Attach a viewer to a shared stream session
#[utoipa::path(
    post,
    path = "/attach",
    request_body = AttachBody,
    responses(
        (status = 200, description = "Viewer admitted", body = ApiResponse<AttachResponse>),
        (status = 429, description = "Provider at capacity"),
        (status = 502, description = "Session permanently failed"),
    )
)]
pub async fn attach(
    State(state): State<AppState>,
    Json(body): Json<AttachBody>,
) -> AppResult<impl IntoResponse> {
    if body.upstream_url.is_empty() {
        return Err(AppError::validation("upstream_url must not be empty"));
    }
    let grant = state
        .manager
        .attach_viewer(AttachRequest {
            provider_id: body.provider_id,
            upstream_url: body.upstream_url,
            profile_name: body.profile,
        })
        .await?;

    Ok(ApiResponse::success(AttachResponse {
        stream_handle: grant.stream_handle,
        session_key: grant.session_key,
        viewer_count: grant.viewer_count,
        created: grant.created,
        state: grant.state,
    }))
}

/// Detach one viewer; the session auto-stops after the idle grace window
/// once no viewers remain
#[utoipa::path(
    delete,
    path = "/session/{session_key}",
    params(("session_key" = String, Path, description = "Session to detach from")),
    responses(
        (status = 200, description = "Viewer detached", body = ApiResponse<DetachResponse>),
        (status = 404, description = "Unknown session"),
    )
)]
pub async fn detach(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> AppResult<impl IntoResponse> {
    let remaining = state.manager.detach_viewer(&session_key).await?;
    Ok(ApiResponse::success(DetachResponse {
        session_key,
        remaining_viewers: remaining,
    }))
}

/// Force-stop a session, disconnecting any attached viewers. This is how an
/// operator frees a permanently failed key.
#[utoipa::path(
    post,
    path = "/session/{session_key}/stop",
    params(("session_key" = String, Path, description = "Session to stop")),
    responses(
        (status = 200, description = "Session stopped"),
        (status = 404, description = "Unknown session"),
    )
)]
pub async fn stop(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.manager.stop_session(&session_key).await?;
    Ok(ApiResponse::success(serde_json::json!({
        "session_key": session_key,
        "stopped": true,
    })))
}

/// Current session counters plus active alerts
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Stats snapshot", body = ApiResponse<StatsResponse>))
)]
pub async fn stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let snapshot = state.metrics.snapshot().await.map_err(AppError::from)?;
    let alerts = state.metrics.alerts().await.map_err(AppError::from)?;
    Ok(ApiResponse::success(StatsResponse { snapshot, alerts }))
}

/// Process liveness
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy"))
)]
pub async fn health() -> impl IntoResponse {
    ApiResponse::success(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
