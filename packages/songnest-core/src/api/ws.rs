//! WebSocket sessions (C10).
//!
//! Wire format: each text frame is a leading `'1'` followed by a JSON array
//! `[event, ...args]` for data, a bare `'0'` for heartbeats; any other
//! leading byte closes the connection. Client intents arrive as events
//! (hyphens normalized to underscores) and map onto core operations;
//! server-to-client events mirror the bus grammar in typed form.
//!
//! One session type serves both endpoints: the full music session joins
//! membership and dispatches every intent, while the volume-only side
//! channel exposes just the volume subset.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;

use crate::api::{AppState, Identity};
use crate::context::{NestHandle, MAIN_NEST};
use crate::error::SongnestError;
use crate::events::BusMessage;

/// Which intents a session may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCaps {
    /// Full duplex client session.
    Full,
    /// Volume-only side channel.
    VolumeOnly,
}

/// Upgrade handler for `/socket` (main nest).
pub async fn music_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Identity,
) -> impl IntoResponse {
    music_upgrade(ws, state, identity, MAIN_NEST.to_string()).await
}

/// Upgrade handler for `/socket/{nest_id}`.
pub async fn music_ws_nest_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Identity,
    Path(nest_id): Path<String>,
) -> impl IntoResponse {
    music_upgrade(ws, state, identity, nest_id).await
}

async fn music_upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    identity: Identity,
    nest_ref: String,
) -> axum::response::Response {
    let nest = match state.resolve_nest(Some(&nest_ref)).await {
        Ok(nest) => nest,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        Session::new(state, nest, identity.0, SessionCaps::Full)
            .serve(socket)
            .await;
    })
}

/// Upgrade handler for the unauthenticated volume side channel.
pub async fn volume_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let nest = match state.resolve_nest(None).await {
        Ok(nest) => nest,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        Session::new(state, nest, "volume-listener".into(), SessionCaps::VolumeOnly)
            .serve(socket)
            .await;
    })
}

type WsSender = SplitSink<WebSocket, Message>;

struct Session {
    state: AppState,
    nest: NestHandle,
    identity: String,
    caps: SessionCaps,
}

impl Session {
    fn new(state: AppState, nest: NestHandle, identity: String, caps: SessionCaps) -> Self {
        Self {
            state,
            nest,
            identity,
            caps,
        }
    }

    async fn serve(self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        let guard = self
            .state
            .ws_manager
            .register(&self.nest.ctx.nest_id, &self.identity);
        let cancel = guard.cancel_token().clone();

        if self.caps == SessionCaps::Full {
            if let Err(e) = self
                .state
                .services
                .membership
                .join(&self.nest.ctx.nest_id, &self.identity)
                .await
            {
                log::warn!("[WS] Join failed for {}: {}", self.identity, e);
            }
        }

        let mut subscription = match self.nest.ctx.store.subscribe(&self.nest.ctx.channel()).await
        {
            Ok(sub) => sub,
            Err(e) => {
                log::error!("[WS] Could not subscribe to nest channel: {}", e);
                return;
            }
        };

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.nest.ctx.config.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let receive_timeout = Duration::from_secs(self.nest.ctx.config.ws_receive_timeout_secs);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[WS] Session {} force-closed", guard.id());
                    break;
                }
                _ = heartbeat.tick() => {
                    if self.caps == SessionCaps::Full {
                        if let Err(e) = self
                            .state
                            .services
                            .membership
                            .refresh(&self.nest.ctx.nest_id, &self.identity)
                            .await
                        {
                            log::warn!("[WS] Member TTL refresh failed: {}", e);
                        }
                    }
                }
                maybe = subscription.recv() => {
                    match maybe {
                        Some(raw) => {
                            if let Some(msg) = BusMessage::parse(&raw) {
                                if self.forward(&mut sender, msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => {
                            log::warn!("[WS] Bus subscription ended");
                            break;
                        }
                    }
                }
                received = tokio::time::timeout(receive_timeout, receiver.next()) => {
                    match received {
                        // Timeout: no traffic, keep the connection open.
                        Err(_) => continue,
                        Ok(None) | Ok(Some(Err(_))) => break,
                        Ok(Some(Ok(Message::Close(_)))) => break,
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if !self.handle_frame(&mut sender, text.as_str()).await {
                                break;
                            }
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }

        if self.caps == SessionCaps::Full {
            if let Err(e) = self
                .state
                .services
                .membership
                .leave(&self.nest.ctx.nest_id, &self.identity)
                .await
            {
                log::warn!("[WS] Leave failed for {}: {}", self.identity, e);
            }
        }
        // Subscription and ConnectionGuard drops handle the rest.
    }

    /// Parses one wire frame. Returns `false` to close the connection.
    async fn handle_frame(&self, sender: &mut WsSender, frame: &str) -> bool {
        let mut chars = frame.chars();
        match chars.next() {
            Some('1') => {
                let payload = chars.as_str();
                let Ok(data) = serde_json::from_str::<Vec<Value>>(payload) else {
                    log::debug!("[WS] Undecodable data frame, ignoring");
                    return true;
                };
                let Some(event) = data.first().and_then(|v| v.as_str()) else {
                    return true;
                };
                let event = event.replace('-', "_");
                let args = &data[1..];
                if let Err(e) = self.dispatch(sender, &event, args).await {
                    log::info!("[WS] {} failed for {}: {}", event, self.identity, e);
                    let _ = emit(
                        sender,
                        "error",
                        vec![json!({ "code": e.code(), "message": e.to_string() })],
                    )
                    .await;
                }
                true
            }
            Some('0') | None => true,
            other => {
                log::info!("[WS] Invalid frame type {:?}, closing", other);
                false
            }
        }
    }

    /// Maps a client intent onto a core operation.
    async fn dispatch(
        &self,
        sender: &mut WsSender,
        event: &str,
        args: &[Value],
    ) -> Result<(), SongnestError> {
        // The volume subset is available to every session.
        match event {
            "request_volume" => {
                let vol = self.nest.playhead.volume().await?;
                let _ = emit(sender, "volume", vec![json!(vol.to_string())]).await;
                return Ok(());
            }
            "change_volume" => {
                let requested = args.first().and_then(arg_i64).ok_or_else(bad_args)?;
                let vol = self.nest.playhead.set_volume(requested).await?;
                let _ = emit(sender, "volume", vec![json!(vol.to_string())]).await;
                return Ok(());
            }
            _ => {}
        }
        if self.caps == SessionCaps::VolumeOnly {
            return Ok(());
        }

        match event {
            "add_song" => {
                let uri = args.first().and_then(|v| v.as_str()).ok_or_else(bad_args)?;
                let src = args.get(1).and_then(|v| v.as_str()).unwrap_or("spotify");
                if src != "spotify" {
                    return Err(SongnestError::InvalidRequest(format!(
                        "unsupported source {src}"
                    )));
                }
                self.nest
                    .queue
                    .add_track(&self.identity, uri, Default::default())
                    .await?;
            }
            "fetch_playlist" => {
                let cards = self.nest.queue.cards().await?;
                let _ = emit(sender, "playlist_update", vec![json!(cards)]).await;
            }
            "fetch_now_playing" => {
                let playing = self.nest.playhead.now_playing().await?;
                let _ = emit(sender, "now_playing_update", vec![json!(playing)]).await;
            }
            "vote" => {
                let id = args.first().and_then(arg_u64).ok_or_else(bad_args)?;
                let up = args.get(1).and_then(|v| v.as_bool()).unwrap_or(false);
                self.nest.queue.vote(&self.identity, id, up).await?;
            }
            "kill" => {
                let id = args.first().and_then(arg_u64).ok_or_else(bad_args)?;
                self.nest.queue.kill(id).await?;
            }
            "kill_playing" => {
                self.nest.playhead.skip().await?;
            }
            "nuke_queue" => {
                self.nest.queue.clear().await?;
            }
            "jam" => {
                let id = args.first().and_then(arg_u64).ok_or_else(bad_args)?;
                self.nest.queue.jam(&self.identity, id).await?;
            }
            "benderQueue" => {
                let uri = args.first().and_then(|v| v.as_str()).ok_or_else(bad_args)?;
                self.nest.queue.queue_preview(&self.identity, uri).await?;
            }
            "benderFilter" => {
                let uri = args.first().and_then(|v| v.as_str()).ok_or_else(bad_args)?;
                self.nest.queue.filter_preview(&self.identity, uri).await?;
            }
            "pause" => {
                self.nest.playhead.pause().await?;
            }
            "unpause" => {
                self.nest.playhead.unpause().await?;
            }
            "add_comment" => {
                // args: (song_id, _claimed_user, text); the session identity
                // is authoritative.
                let id = args.first().and_then(arg_u64).ok_or_else(bad_args)?;
                let text = args.get(2).or(args.get(1)).and_then(|v| v.as_str());
                let text = text.ok_or_else(bad_args)?;
                self.nest.queue.comment(&self.identity, id, text).await?;
            }
            "get_comments_for_song" => {
                let id = args.first().and_then(arg_u64).ok_or_else(bad_args)?;
                let comments = self.nest.queue.comments(id).await?;
                let _ = emit(sender, "comments_for_song", vec![json!(id), json!(comments)]).await;
            }
            "airhorn" => {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                self.nest.horns.fire(&self.identity, name).await?;
            }
            "free_airhorn" => {
                self.nest.horns.fire_free(&self.identity).await?;
            }
            "get_free_horns" => {
                let count = self.nest.horns.free_count(&self.identity).await?;
                let _ = emit(sender, "free_horns", vec![json!(count)]).await;
            }
            "fetch_airhorns" => {
                let horns = self.nest.horns.list().await?;
                let _ = emit(sender, "airhorns", vec![json!(horns)]).await;
            }
            other => {
                log::debug!("[WS] Unknown event {} from {}", other, self.identity);
            }
        }
        Ok(())
    }

    /// Translates a bus message into client events.
    async fn forward(&self, sender: &mut WsSender, msg: BusMessage) -> Result<(), ()> {
        if self.caps == SessionCaps::VolumeOnly {
            if let BusMessage::Volume(vol) = msg {
                emit(sender, "volume", vec![json!(vol.to_string())]).await?;
            }
            return Ok(());
        }
        match msg {
            BusMessage::PlaylistUpdate => {
                if let Ok(cards) = self.nest.queue.cards().await {
                    emit(sender, "playlist_update", vec![json!(cards)]).await?;
                }
            }
            BusMessage::NowPlayingUpdate => {
                if let Ok(playing) = self.nest.playhead.now_playing().await {
                    emit(sender, "now_playing_update", vec![json!(playing)]).await?;
                }
                if let Ok(cards) = self.nest.queue.cards().await {
                    emit(sender, "playlist_update", vec![json!(cards)]).await?;
                }
            }
            BusMessage::Position {
                src,
                trackid,
                elapsed,
            } => {
                emit(
                    sender,
                    "player_position",
                    vec![json!(src), json!(trackid), json!(elapsed)],
                )
                .await?;
            }
            BusMessage::Volume(vol) => {
                emit(sender, "volume", vec![json!(vol.to_string())]).await?;
            }
            BusMessage::Airhorn { volume, name } => {
                emit(sender, "do_airhorn", vec![json!(volume), json!(name)]).await?;
            }
            BusMessage::FreeHornUpdate => {
                if let Ok(count) = self.nest.horns.free_count(&self.identity).await {
                    emit(sender, "free_horns", vec![json!(count)]).await?;
                }
            }
            BusMessage::MemberUpdate(count) => {
                emit(sender, "member_update", vec![json!(count)]).await?;
            }
        }
        Ok(())
    }
}

/// Sends a `'1'`-framed event to the client.
async fn emit(sender: &mut WsSender, event: &str, args: Vec<Value>) -> Result<(), ()> {
    let mut array = vec![json!(event)];
    array.extend(args);
    let frame = format!("1{}", Value::Array(array));
    sender
        .send(Message::Text(frame.into()))
        .await
        .map_err(|_| ())
}

fn bad_args() -> SongnestError {
    SongnestError::InvalidRequest("missing or malformed arguments".into())
}

/// Entry ids arrive as JSON numbers or strings depending on the client.
fn arg_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn arg_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_from_numbers_and_strings() {
        assert_eq!(arg_u64(&json!(42)), Some(42));
        assert_eq!(arg_u64(&json!("42")), Some(42));
        assert_eq!(arg_u64(&json!("nope")), None);
        assert_eq!(arg_i64(&json!(-3)), Some(-3));
        assert_eq!(arg_i64(&json!("95")), Some(95));
    }
}
