//! Queued-task endpoints: enqueue, poll, revoke.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::stage::{StageKind, TaskStatus};

use super::AppState;

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub session_id: String,
    pub stage: StageKind,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub task_id: String,
    pub state: &'static str,
}

pub async fn enqueue_task_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> ServiceResult<Json<EnqueueResponse>> {
    if request.session_id.trim().is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "session_id must not be empty".to_string(),
        });
    }
    state.service.sessions.ensure_session(&request.session_id)?;
    let task_id = state
        .service
        .queue
        .enqueue(&request.session_id, request.stage)?;
    Ok(Json(EnqueueResponse {
        task_id,
        state: "PENDING",
    }))
}

pub async fn task_status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ServiceResult<Json<TaskStatus>> {
    state
        .service
        .queue
        .status(&task_id)?
        .map(Json)
        .ok_or(ServiceError::TaskNotFound { task_id })
}

#[derive(Deserialize, Default)]
pub struct RevokeRequest {
    /// Also stop the session's tracked subprocesses.
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

/// Revoke a task. A pending task never runs; a running task is cancelled
/// through its token, and `terminate` additionally signals the session's
/// tracked processes.
pub async fn revoke_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    request: Option<Json<RevokeRequest>>,
) -> ServiceResult<Json<RevokeResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();

    let revoked = state.service.queue.revoke(&task_id)?;
    if !revoked {
        return Ok(Json(RevokeResponse { revoked: false }));
    }

    if let Some(running) = state.service.revocations.get(&task_id) {
        info!(task = %task_id, "Cancelling running task");
        running.token.cancel();
        if request.terminate {
            let session_id = running.session_id.clone();
            drop(running);
            state.service.stop_session(&session_id).await;
        }
    }
    Ok(Json(RevokeResponse { revoked: true }))
}
