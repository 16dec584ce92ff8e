//! HTTP route handlers.
//!
//! All handlers are thin - they resolve the target nest and delegate to
//! the engines. `/playing/` and `/queue/` are public; everything mutating
//! requires a bearer identity.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::api::sse::{self, NestQuery};
use crate::api::{ws, AppState, Identity};
use crate::error::SongnestError;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/playing/", get(now_playing))
        .route("/queue/", get(queue_view))
        .route("/queue/{id}", get(queue_entry))
        .route("/last/", get(last_played))
        .route("/history/{n}", get(history_plays))
        .route("/api/events", get(sse::sse_events))
        .route("/api/add_song", post(add_song))
        .route("/api/queue/remove", post(queue_remove))
        .route("/api/queue/skip", post(queue_skip))
        .route("/api/queue/vote", post(queue_vote))
        .route("/api/queue/pause", post(queue_pause))
        .route("/api/queue/resume", post(queue_resume))
        .route("/api/queue/clear", post(queue_clear))
        .route("/api/nests", get(list_nests).post(create_nest))
        .route(
            "/api/nests/{code}",
            get(get_nest).patch(rename_nest).delete(delete_nest),
        )
        .route("/socket", get(ws::music_ws_handler))
        .route("/socket/{nest_id}", get(ws::music_ws_nest_handler))
        .route("/volume", get(ws::volume_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Request payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AddSongRequest {
    track_uri: String,
    #[serde(default)]
    nest: Option<String>,
}

#[derive(Deserialize)]
struct EntryRequest {
    id: u64,
    #[serde(default)]
    nest: Option<String>,
}

#[derive(Deserialize)]
struct VoteRequest {
    id: u64,
    up: bool,
    #[serde(default)]
    nest: Option<String>,
}

#[derive(Deserialize, Default)]
struct NestBody {
    #[serde(default)]
    nest: Option<String>,
}

#[derive(Deserialize)]
struct CreateNestRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    seed_track: Option<String>,
}

#[derive(Deserialize)]
struct RenameNestRequest {
    name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.ws_manager.connection_count(),
    }))
}

/// Current track plus start/end timestamps and the server clock.
async fn now_playing(
    State(state): State<AppState>,
    Query(query): Query<NestQuery>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(query.nest.as_deref()).await?;
    let playing = nest.playhead.now_playing().await?;
    let mut body = serde_json::to_value(&playing)
        .map_err(|e| SongnestError::Internal(e.to_string()))?;
    body["now"] = json!(Utc::now().to_rfc3339());
    Ok(Json(body))
}

/// The queue array, preview card included.
async fn queue_view(
    State(state): State<AppState>,
    Query(query): Query<NestQuery>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(query.nest.as_deref()).await?;
    let cards = nest.queue.cards().await?;
    Ok(Json(json!({ "queue": cards })))
}

/// One queued entry by id.
async fn queue_entry(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<NestQuery>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(query.nest.as_deref()).await?;
    let entry = nest
        .queue
        .get(id)
        .await?
        .ok_or_else(|| SongnestError::NotFound(format!("queue entry {id}")))?;
    Ok(Json(entry))
}

/// The most recently finished play.
async fn last_played(
    State(state): State<AppState>,
    Query(query): Query<NestQuery>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(query.nest.as_deref()).await?;
    let mut body = match nest.playhead.last_played().await? {
        Some(record) => serde_json::to_value(&record)
            .map_err(|e| SongnestError::Internal(e.to_string()))?,
        None => json!({}),
    };
    body["now"] = json!(Utc::now().to_rfc3339());
    Ok(Json(body))
}

/// The last `n` recorded plays.
async fn history_plays(
    State(state): State<AppState>,
    Path(n): Path<u64>,
) -> Result<impl IntoResponse, SongnestError> {
    let plays = state.services.history.recent_plays(n).await?;
    let retrieved = plays.len();
    Ok(Json(json!({
        "plays": plays,
        "n_requested": n,
        "n_retrieved": retrieved,
    })))
}

/// Adds a catalog track to the queue.
async fn add_song(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<AddSongRequest>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(request.nest.as_deref()).await?;
    let id = nest
        .queue
        .add_track(&identity.0, &request.track_uri, Default::default())
        .await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

/// Removes a queue entry.
async fn queue_remove(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<EntryRequest>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(request.nest.as_deref()).await?;
    log::info!("[API] {} removed #{}", identity.0, request.id);
    nest.queue.kill(request.id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Skips the currently playing entry.
async fn queue_skip(
    State(state): State<AppState>,
    identity: Identity,
    body: Option<Json<NestBody>>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest_ref = body.and_then(|Json(b)| b.nest);
    let nest = state.resolve_nest(nest_ref.as_deref()).await?;
    log::info!("[API] {} skipped now playing", identity.0);
    nest.playhead.skip().await?;
    Ok(Json(json!({ "success": true })))
}

/// Votes an entry up or down.
async fn queue_vote(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<VoteRequest>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest = state.resolve_nest(request.nest.as_deref()).await?;
    nest.queue.vote(&identity.0, request.id, request.up).await?;
    Ok(Json(json!({ "success": true })))
}

async fn queue_pause(
    State(state): State<AppState>,
    _identity: Identity,
    body: Option<Json<NestBody>>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest_ref = body.and_then(|Json(b)| b.nest);
    let nest = state.resolve_nest(nest_ref.as_deref()).await?;
    nest.playhead.pause().await?;
    Ok(Json(json!({ "success": true })))
}

async fn queue_resume(
    State(state): State<AppState>,
    _identity: Identity,
    body: Option<Json<NestBody>>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest_ref = body.and_then(|Json(b)| b.nest);
    let nest = state.resolve_nest(nest_ref.as_deref()).await?;
    nest.playhead.unpause().await?;
    Ok(Json(json!({ "success": true })))
}

async fn queue_clear(
    State(state): State<AppState>,
    identity: Identity,
    body: Option<Json<NestBody>>,
) -> Result<impl IntoResponse, SongnestError> {
    let nest_ref = body.and_then(|Json(b)| b.nest);
    let nest = state.resolve_nest(nest_ref.as_deref()).await?;
    log::info!("[API] {} cleared the queue", identity.0);
    nest.queue.clear().await?;
    Ok(Json(json!({ "success": true })))
}

/// Lists every registered nest.
async fn list_nests(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<impl IntoResponse, SongnestError> {
    let nests = state.services.registry.list_nests().await?;
    Ok(Json(json!({ "nests": nests })))
}

/// Creates a nest; the creator is the authenticated identity.
async fn create_nest(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<CreateNestRequest>,
) -> Result<impl IntoResponse, SongnestError> {
    let meta = state
        .services
        .registry
        .create_nest(&identity.0, request.name, request.seed_track)
        .await?;
    Ok(Json(meta))
}

/// Fetches one nest by id, code, or slug.
async fn get_nest(
    State(state): State<AppState>,
    _identity: Identity,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, SongnestError> {
    let meta = state
        .services
        .registry
        .get_nest(&code)
        .await?
        .ok_or_else(|| SongnestError::NotFound(format!("nest {code}")))?;
    Ok(Json(meta))
}

/// Renames a nest.
async fn rename_nest(
    State(state): State<AppState>,
    identity: Identity,
    Path(code): Path<String>,
    Json(request): Json<RenameNestRequest>,
) -> Result<impl IntoResponse, SongnestError> {
    let meta = state
        .services
        .registry
        .get_nest(&code)
        .await?
        .ok_or_else(|| SongnestError::NotFound(format!("nest {code}")))?;
    log::info!("[API] {} renamed nest {}", identity.0, meta.nest_id);
    let updated = state
        .services
        .registry
        .rename(&meta.nest_id, &request.name)
        .await?;
    Ok(Json(updated))
}

/// Deletes a nest (never the main nest).
async fn delete_nest(
    State(state): State<AppState>,
    identity: Identity,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, SongnestError> {
    let meta = state
        .services
        .registry
        .get_nest(&code)
        .await?
        .ok_or_else(|| SongnestError::NotFound(format!("nest {code}")))?;
    log::info!("[API] {} deleted nest {}", identity.0, meta.nest_id);
    state.services.registry.delete_nest(&meta.nest_id).await?;
    Ok(Json(json!({ "success": true })))
}
