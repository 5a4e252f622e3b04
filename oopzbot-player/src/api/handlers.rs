//! HTTP request handlers

use crate::api::server::AppContext;
use crate::cache::metadata::{DailyStatistics, PlayRecord};
use crate::controller::ControllerSnapshot;
use crate::error::Error;
use crate::store::{KEY_CURRENT, KEY_PLAY_STATE, KEY_QUEUE};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use oopzbot_common::{Track, TrackId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Longest a `/state/wait` request may block
const MAX_WAIT_MS: u64 = 30_000;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    phase: String,
    actuator: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// The three published documents, as stored
#[derive(Debug, Serialize)]
pub struct StateResponse {
    current: Option<Value>,
    queue: Value,
    play_state: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    after: u64,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WaitResponse {
    changed: bool,
    revision: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    status: String,
    command: String,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    track_id: String,
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    album: String,
    #[serde(default)]
    duration_ms: u64,
    cover: Option<String>,
    #[serde(default = "default_requester")]
    requester: String,
}

fn default_requester() -> String {
    "web".to_string()
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    status: String,
    position: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Remove,
    Top,
}

#[derive(Debug, Deserialize)]
pub struct QueueActionRequest {
    action: QueueAction,
    /// 0-based queue index
    index: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    date: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    statistics: DailyStatistics,
    recent_plays: Vec<PlayRecord>,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn error_response(err: Error) -> ApiError {
    let code = match &err {
        Error::MalformedCommand(_) | Error::QueueIndexInvalid { .. } => StatusCode::BAD_REQUEST,
        Error::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
        Error::StoreWriteFailed(_) | Error::Database(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        warn!(error = %err, "Request failed");
    }
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", err),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    let phase = match ctx.controller.snapshot().await {
        Ok(snapshot) => serde_json::to_value(snapshot.phase)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => "stopped".to_string(),
    };
    let actuator = match ctx.bridge.status().await {
        Ok(status) if status.degraded => "degraded".to_string(),
        Ok(status) => status.backend.unwrap_or_else(|| "idle".to_string()),
        Err(_) => "stopped".to_string(),
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "oopzbot-player".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        phase,
        actuator,
    })
}

// ============================================================================
// State
// ============================================================================

/// GET /state - the published documents
pub async fn get_state(State(ctx): State<AppContext>) -> Result<Json<StateResponse>, ApiError> {
    let current = ctx.store.get(KEY_CURRENT).await.map_err(error_response)?;
    let queue = ctx
        .store
        .get(KEY_QUEUE)
        .await
        .map_err(error_response)?
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let play_state = ctx.store.get(KEY_PLAY_STATE).await.map_err(error_response)?;

    Ok(Json(StateResponse {
        current,
        queue,
        play_state,
    }))
}

/// GET /state/wait?after=<rev>&timeout_ms=<ms> - block until the published
/// revision passes `after`
pub async fn wait_state(
    State(ctx): State<AppContext>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<WaitResponse>, ApiError> {
    let wait = Duration::from_millis(query.timeout_ms.unwrap_or(MAX_WAIT_MS).min(MAX_WAIT_MS));
    let revision = ctx
        .store
        .wait_revision(query.after, wait)
        .await
        .map_err(error_response)?;

    Ok(Json(WaitResponse {
        changed: revision.is_some(),
        revision,
    }))
}

/// GET /controller - live controller view (phase, elapsed, generation)
pub async fn get_controller(
    State(ctx): State<AppContext>,
) -> Result<Json<ControllerSnapshot>, ApiError> {
    ctx.controller.snapshot().await.map(Json).map_err(error_response)
}

// ============================================================================
// Commands and queue
// ============================================================================

/// POST /commands - body is a command string (`seek:30`) or command JSON
pub async fn push_command(
    State(ctx): State<AppContext>,
    body: String,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let command = ctx.relay.push_raw(&body).await.map_err(error_response)?;
    info!(command = %command, "Command accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            status: "accepted".to_string(),
            command: command.to_string(),
        }),
    ))
}

/// POST /queue - enqueue a track
pub async fn enqueue(
    State(ctx): State<AppContext>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let id = TrackId::parse(&req.track_id)
        .ok_or_else(|| bad_request(format!("invalid track id '{}'", req.track_id)))?;
    if req.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }

    let mut track = Track::new(id, req.title, req.artist, req.duration_ms);
    track.album = req.album;
    track.cover = req.cover;

    info!(track = %track.id, requester = %req.requester, "Enqueue requested");
    let position = ctx
        .controller
        .enqueue(track, req.requester)
        .await
        .map_err(error_response)?;

    Ok(Json(EnqueueResponse {
        status: "queued".to_string(),
        position,
    }))
}

/// POST /queue/action - `remove` or `top` the entry at `index`
pub async fn queue_action(
    State(ctx): State<AppContext>,
    Json(req): Json<QueueActionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    match req.action {
        QueueAction::Remove => {
            let removed = ctx
                .controller
                .remove(req.index)
                .await
                .map_err(error_response)?;
            info!(index = req.index, track = %removed.track.id, "Removed from queue");
        }
        QueueAction::Top => {
            ctx.controller
                .promote(req.index)
                .await
                .map_err(error_response)?;
            info!(index = req.index, "Moved to queue head");
        }
    }

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

// ============================================================================
// Statistics
// ============================================================================

/// GET /stats?date=YYYY-MM-DD&limit=N
pub async fn get_stats(
    State(ctx): State<AppContext>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let date = query.date.unwrap_or_else(oopzbot_common::time::today);
    let statistics = ctx
        .metadata
        .statistics(&date)
        .await
        .map_err(error_response)?
        .unwrap_or_else(|| DailyStatistics {
            date: date.clone(),
            ..Default::default()
        });
    let recent_plays = ctx
        .metadata
        .recent_plays(query.limit.unwrap_or(20).min(200))
        .await
        .map_err(error_response)?;

    Ok(Json(StatsResponse {
        statistics,
        recent_plays,
    }))
}
