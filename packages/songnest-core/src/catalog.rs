//! Music catalog client.
//!
//! The core only needs six lookups from the catalog (track, artist, album
//! tracks, artist top tracks, search, episode), expressed as the
//! [`CatalogClient`] trait so engines stay testable without network access.
//! [`SpotifyCatalog`] is the production implementation: it manages a
//! client-credentials access token with a 60 s pre-expiry refresh and
//! surfaces rate-limit responses as a typed error the recommendation engine
//! can react to.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

const ACCOUNTS_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Safety margin subtracted from the token lifetime before refreshing.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Errors raised by catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog asked us to back off (HTTP 429).
    #[error("catalog rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Transport-level failure (timeout, DNS, connection reset).
    #[error("catalog request failed: {0}")]
    Http(String),

    /// Unexpected HTTP status.
    #[error("catalog returned HTTP {status}")]
    Status { status: u16 },

    /// The id did not resolve to anything.
    #[error("catalog id not found: {0}")]
    NotFound(String),

    /// Response body did not have the shape we expect.
    #[error("malformed catalog response: {0}")]
    Malformed(String),

    /// No client credentials configured.
    #[error("catalog client credentials not configured")]
    Unconfigured,
}

/// Convenient Result alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// A catalog artist reference (id + display name).
#[derive(Debug, Clone, PartialEq)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
}

/// Track metadata as the core consumes it.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub uri: String,
    pub title: String,
    pub artists: Vec<ArtistRef>,
    pub album_id: String,
    pub duration_secs: u32,
    pub big_img: String,
    pub img: String,
}

impl TrackInfo {
    /// Primary (first-listed) artist, if any.
    pub fn primary_artist(&self) -> Option<&ArtistRef> {
        self.artists.first()
    }

    /// Comma-joined artist display line.
    pub fn artist_line(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Artist metadata, including the genre list used for seeding.
#[derive(Debug, Clone)]
pub struct ArtistInfo {
    pub id: String,
    pub name: String,
    pub genres: Vec<String>,
}

/// Podcast episode metadata.
#[derive(Debug, Clone)]
pub struct EpisodeInfo {
    pub uri: String,
    pub title: String,
    pub show_name: String,
    pub duration_secs: u32,
    pub big_img: String,
    pub img: String,
}

/// Capabilities the core uses from the music catalog.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Resolves a track id or URI to its metadata.
    async fn track(&self, id: &str) -> CatalogResult<TrackInfo>;

    /// Resolves an artist id to metadata including genres.
    async fn artist(&self, id: &str) -> CatalogResult<ArtistInfo>;

    /// Track URIs belonging to an album.
    async fn album_tracks(&self, album_id: &str) -> CatalogResult<Vec<String>>;

    /// The artist's top tracks in a market.
    async fn artist_top_tracks(&self, artist_id: &str, market: &str) -> CatalogResult<Vec<String>>;

    /// Free-text track search; returns up to `limit` URIs.
    async fn search_tracks(&self, query: &str, limit: u32, market: &str)
        -> CatalogResult<Vec<String>>;

    /// Resolves a podcast episode id or URI to its metadata.
    async fn episode(&self, id: &str) -> CatalogResult<EpisodeInfo>;
}

/// Strips a `spotify:track:`/`spotify:episode:` URI to the bare id.
pub fn uri_id(id_or_uri: &str) -> &str {
    id_or_uri.rsplit(':').next().unwrap_or(id_or_uri)
}

/// Picks (big, small) image URLs from a size-ordered image list.
///
/// The catalog orders images largest-first; the last entry is the smallest.
fn pick_images(urls: &[String]) -> (String, String) {
    let big = urls.first().cloned().unwrap_or_default();
    let small = urls.last().cloned().unwrap_or_else(|| big.clone());
    (big, small)
}

// ─────────────────────────────────────────────────────────────────────────────
// Spotify implementation
// ─────────────────────────────────────────────────────────────────────────────

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Catalog client backed by the Spotify Web API.
pub struct SpotifyCatalog {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ApiImage {
    url: String,
}

#[derive(Deserialize)]
struct ApiArtist {
    id: String,
    name: String,
    #[serde(default)]
    genres: Vec<String>,
}

#[derive(Deserialize)]
struct ApiAlbum {
    #[serde(default)]
    id: String,
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ApiTrack {
    uri: String,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    album: Option<ApiAlbum>,
}

#[derive(Deserialize)]
struct ApiTrackPage {
    #[serde(default)]
    items: Vec<ApiTrack>,
}

#[derive(Deserialize)]
struct ApiSearchResponse {
    tracks: Option<ApiTrackPage>,
}

#[derive(Deserialize)]
struct ApiTopTracks {
    #[serde(default)]
    tracks: Vec<ApiTrack>,
}

#[derive(Deserialize)]
struct ApiAlbumTrackRef {
    uri: String,
}

#[derive(Deserialize)]
struct ApiAlbumTracksPage {
    #[serde(default)]
    items: Vec<ApiAlbumTrackRef>,
}

#[derive(Deserialize)]
struct ApiShow {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ApiEpisode {
    uri: String,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    images: Vec<ApiImage>,
    show: Option<ApiShow>,
}

impl SpotifyCatalog {
    /// Creates a catalog client sharing the given pooled HTTP client.
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            token: Mutex::new(None),
        }
    }

    /// Returns a valid access token, refreshing when within the safety margin.
    async fn access_token(&self) -> CatalogResult<String> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CatalogError::Unconfigured);
        }
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let response = self
            .http
            .post(ACCOUNTS_TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        let response = check_status(response, "token")?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Malformed(e.to_string()))?;
        let lifetime = Duration::from_secs(body.expires_in);
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        log::debug!("[Catalog] Refreshed access token (lifetime {}s)", body.expires_in);
        Ok(body.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> CatalogResult<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{API_BASE}{path}"))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        let response = check_status(response, what)?;
        response
            .json()
            .await
            .map_err(|e| CatalogError::Malformed(e.to_string()))
    }
}

/// Maps an HTTP response to the typed error space, reading `Retry-After`
/// on 429 so callers can honor the catalog's backoff request.
fn check_status(response: reqwest::Response, what: &str) -> CatalogResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        return Err(CatalogError::RateLimited { retry_after_secs });
    }
    if status.as_u16() == 404 {
        return Err(CatalogError::NotFound(what.to_string()));
    }
    Err(CatalogError::Status {
        status: status.as_u16(),
    })
}

fn track_from_api(track: ApiTrack) -> TrackInfo {
    let album = track.album.unwrap_or(ApiAlbum {
        id: String::new(),
        images: Vec::new(),
    });
    let urls: Vec<String> = album.images.into_iter().map(|i| i.url).collect();
    let (big_img, img) = pick_images(&urls);
    TrackInfo {
        uri: track.uri,
        title: track.name,
        artists: track
            .artists
            .into_iter()
            .map(|a| ArtistRef {
                id: a.id,
                name: a.name,
            })
            .collect(),
        album_id: album.id,
        duration_secs: (track.duration_ms / 1000) as u32,
        big_img,
        img,
    }
}

#[async_trait]
impl CatalogClient for SpotifyCatalog {
    async fn track(&self, id: &str) -> CatalogResult<TrackInfo> {
        let bare = uri_id(id);
        let track: ApiTrack = self
            .get_json(&format!("/tracks/{bare}"), &[], id)
            .await?;
        Ok(track_from_api(track))
    }

    async fn artist(&self, id: &str) -> CatalogResult<ArtistInfo> {
        let bare = uri_id(id);
        let artist: ApiArtist = self
            .get_json(&format!("/artists/{bare}"), &[], id)
            .await?;
        Ok(ArtistInfo {
            id: artist.id,
            name: artist.name,
            genres: artist.genres,
        })
    }

    async fn album_tracks(&self, album_id: &str) -> CatalogResult<Vec<String>> {
        let bare = uri_id(album_id);
        let page: ApiAlbumTracksPage = self
            .get_json(&format!("/albums/{bare}/tracks"), &[], album_id)
            .await?;
        Ok(page.items.into_iter().map(|t| t.uri).collect())
    }

    async fn artist_top_tracks(&self, artist_id: &str, market: &str) -> CatalogResult<Vec<String>> {
        let bare = uri_id(artist_id);
        let top: ApiTopTracks = self
            .get_json(
                &format!("/artists/{bare}/top-tracks"),
                &[("market", market)],
                artist_id,
            )
            .await?;
        Ok(top.tracks.into_iter().map(|t| t.uri).collect())
    }

    async fn search_tracks(
        &self,
        query: &str,
        limit: u32,
        market: &str,
    ) -> CatalogResult<Vec<String>> {
        let limit = limit.to_string();
        let response: ApiSearchResponse = self
            .get_json(
                "/search",
                &[
                    ("q", query),
                    ("type", "track"),
                    ("limit", limit.as_str()),
                    ("market", market),
                ],
                query,
            )
            .await?;
        Ok(response
            .tracks
            .map(|page| page.items.into_iter().map(|t| t.uri).collect())
            .unwrap_or_default())
    }

    async fn episode(&self, id: &str) -> CatalogResult<EpisodeInfo> {
        let bare = uri_id(id);
        let episode: ApiEpisode = self
            .get_json(&format!("/episodes/{bare}"), &[], id)
            .await?;
        let urls: Vec<String> = episode.images.into_iter().map(|i| i.url).collect();
        let (big_img, img) = pick_images(&urls);
        Ok(EpisodeInfo {
            uri: episode.uri,
            title: episode.name,
            show_name: episode.show.map(|s| s.name).unwrap_or_default(),
            duration_secs: (episode.duration_ms / 1000) as u32,
            big_img,
            img,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_id_strips_track_prefix() {
        assert_eq!(uri_id("spotify:track:abc123"), "abc123");
        assert_eq!(uri_id("spotify:episode:ep9"), "ep9");
        assert_eq!(uri_id("bare-id"), "bare-id");
    }

    #[test]
    fn pick_images_prefers_first_big_last_small() {
        let urls = vec!["big".to_string(), "mid".to_string(), "small".to_string()];
        assert_eq!(pick_images(&urls), ("big".into(), "small".into()));
    }

    #[test]
    fn pick_images_single_entry_serves_both() {
        let urls = vec!["only".to_string()];
        assert_eq!(pick_images(&urls), ("only".into(), "only".into()));
    }

    #[test]
    fn pick_images_empty_is_empty() {
        assert_eq!(pick_images(&[]), (String::new(), String::new()));
    }

    #[test]
    fn track_conversion_joins_artists() {
        let track = ApiTrack {
            uri: "spotify:track:x".into(),
            name: "Song".into(),
            duration_ms: 184_500,
            artists: vec![
                ApiArtist {
                    id: "a1".into(),
                    name: "First".into(),
                    genres: vec![],
                },
                ApiArtist {
                    id: "a2".into(),
                    name: "Second".into(),
                    genres: vec![],
                },
            ],
            album: Some(ApiAlbum {
                id: "alb".into(),
                images: vec![],
            }),
        };
        let info = track_from_api(track);
        assert_eq!(info.artist_line(), "First, Second");
        assert_eq!(info.primary_artist().unwrap().id, "a1");
        assert_eq!(info.duration_secs, 184);
        assert_eq!(info.album_id, "alb");
    }
}
