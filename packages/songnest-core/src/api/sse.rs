//! Server-sent-events adapter for headless sync agents.
//!
//! Streams the nest's bus grammar as typed SSE events. Unlike the
//! WebSocket session, SSE clients cannot ask follow-up questions, so
//! `playlist_update` / `now_playing_update` events carry the freshly
//! fetched JSON inline and an initial snapshot is emitted on connect.

use std::convert::Infallible;

use async_stream::stream;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::api::{AppState, Identity};
use crate::error::SongnestError;
use crate::events::BusMessage;

/// Optional nest selector shared by the public read endpoints.
#[derive(Debug, Deserialize)]
pub struct NestQuery {
    pub nest: Option<String>,
}

/// GET `/api/events` - bus stream for one nest (default: main).
pub async fn sse_events(
    State(state): State<AppState>,
    _identity: Identity,
    Query(query): Query<NestQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SongnestError> {
    let nest = state.resolve_nest(query.nest.as_deref()).await?;
    let mut subscription = nest.ctx.store.subscribe(&nest.ctx.channel()).await?;
    log::info!("[SSE] Client subscribed to nest {}", nest.ctx.nest_id);

    let stream = stream! {
        // Initial snapshot so clients need no bootstrap round-trips.
        if let Ok(playing) = nest.playhead.now_playing().await {
            yield Ok(Event::default().event("now_playing_update").data(json!(playing).to_string()));
        }
        if let Ok(cards) = nest.queue.cards().await {
            yield Ok(Event::default().event("playlist_update").data(json!(cards).to_string()));
        }

        while let Some(raw) = subscription.recv().await {
            let Some(msg) = BusMessage::parse(&raw) else { continue };
            match msg {
                BusMessage::PlaylistUpdate => {
                    if let Ok(cards) = nest.queue.cards().await {
                        yield Ok(Event::default()
                            .event("playlist_update")
                            .data(json!(cards).to_string()));
                    }
                }
                BusMessage::NowPlayingUpdate => {
                    if let Ok(playing) = nest.playhead.now_playing().await {
                        yield Ok(Event::default()
                            .event("now_playing_update")
                            .data(json!(playing).to_string()));
                    }
                    if let Ok(cards) = nest.queue.cards().await {
                        yield Ok(Event::default()
                            .event("playlist_update")
                            .data(json!(cards).to_string()));
                    }
                }
                BusMessage::Position { src, trackid, elapsed } => {
                    yield Ok(Event::default().event("pp").data(
                        json!({ "src": src, "trackid": trackid, "elapsed": elapsed }).to_string(),
                    ));
                }
                BusMessage::Volume(vol) => {
                    yield Ok(Event::default().event("volume").data(vol.to_string()));
                }
                BusMessage::Airhorn { volume, name } => {
                    yield Ok(Event::default()
                        .event("do_airhorn")
                        .data(json!({ "volume": volume, "name": name }).to_string()));
                }
                BusMessage::FreeHornUpdate => {
                    yield Ok(Event::default().event("update_freehorn").data("{}"));
                }
                BusMessage::MemberUpdate(count) => {
                    yield Ok(Event::default().event("member_update").data(count.to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
