//! Stage execution and process-control endpoints.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Serialize;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::process_registry::StopSummary;
use crate::stage::StageKind;
use crate::stage::session_store::SessionRecord;
use crate::stage::subprocess::run_stage_subprocess;

use super::AppState;

fn parse_stage(stage: &str) -> ServiceResult<StageKind> {
    StageKind::from_str(stage).map_err(|_| ServiceError::InvalidRequest {
        message: format!("Unknown stage: {stage}"),
    })
}

/// Run a stage as a tracked subprocess, streaming progress over SSE.
///
/// The stream carries one JSON event per line of recognized subprocess
/// output and always ends with a terminal `complete` or `error` event.
pub async fn run_stage_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, stage)): Path<(String, String)>,
) -> ServiceResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let stage = parse_stage(&stage)?;

    let session_dir = state.service.config.session_dir(&session_id);
    if !session_dir.is_dir() {
        return Err(ServiceError::SessionNotFound { session_id });
    }
    state.service.sessions.ensure_session(&session_id)?;

    info!(session = %session_id, stage = stage.as_str(), "Starting tracked stage run");
    let events = run_stage_subprocess(
        stage,
        &session_id,
        &session_dir,
        state.service.registry.clone(),
        state.service.config.extraction.stage_timeout(),
    )?;

    let stream = events.map(|event| {
        let event = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Stop every tracked process for a session.
pub async fn stop_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<StopSummary> {
    Json(state.service.stop_session(&session_id).await)
}

pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ServiceResult<Json<SessionRecord>> {
    state
        .service
        .sessions
        .get(&session_id)?
        .map(Json)
        .ok_or(ServiceError::SessionNotFound { session_id })
}

#[derive(Serialize)]
pub struct ProcessListEntry {
    pub session: String,
    pub pids: Vec<u32>,
}

/// Tracked processes across all sessions, for monitoring.
pub async fn list_processes_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ProcessListEntry>> {
    let entries = state
        .service
        .registry
        .all_sessions()
        .into_iter()
        .map(|(session, pids)| ProcessListEntry { session, pids })
        .collect();
    Json(entries)
}
