//! Core application configuration.
//!
//! Everything tunable in the core lives here; the server binary builds a
//! `Config` from its YAML file / CLI / environment and threads it through
//! bootstrap. Fields mirror the knobs the runtime actually consults - no
//! dead configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Weights for the five recommendation strategies.
///
/// A weight of zero removes the strategy from the rotation entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    pub genre: u32,
    pub throwback: u32,
    pub artist_search: u32,
    pub top_tracks: u32,
    pub album: u32,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            genre: 35,
            throwback: 30,
            artist_search: 25,
            top_tracks: 5,
            album: 5,
        }
    }
}

/// Core configuration shared by every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store connection URL (`redis://host:port`).
    pub store_url: String,

    /// Directory for per-day play-log files.
    pub log_dir: PathBuf,

    /// Catalog API client credentials.
    pub catalog_client_id: String,
    pub catalog_client_secret: String,

    /// Whether the recommendation engine backfills empty queues at all.
    pub use_autofill: bool,

    /// Queue depth the playhead tops up to on the main nest.
    /// Side nests always keep a single-track buffer to limit catalog load.
    pub min_queue_depth: u64,

    /// Maximum human-contributed queue length for non-main nests.
    pub max_queue_depth: u64,

    /// Longest continuous run of auto-fill before the playhead idles.
    pub max_autofill_minutes: i64,

    /// How long a filtered URI stays blocked from re-suggestion.
    pub filter_ttl_secs: u64,

    /// Relative draw weights for the recommendation strategies.
    pub strategy_weights: StrategyWeights,

    /// Catalog markets, first entry is used for searches.
    pub regions: Vec<String>,

    /// Seed of last resort when a nest has no better candidate.
    pub default_seed_uri: String,

    /// Identity attributed to auto-fill contributions.
    pub autofill_user: String,

    /// Display name shown on the auto-fill preview card.
    pub autofill_display_name: String,

    /// Identities allowed to vote repeatedly on the same entry.
    pub privileged_users: Vec<String>,

    /// Jam count at which the now-playing contributor earns a free airhorn.
    pub free_airhorn_jams: u64,

    /// Maximum simultaneous non-free airhorns.
    pub airhorn_max: u64,

    /// Age in seconds past which logged airhorns are trimmed.
    pub airhorn_expire_secs: i64,

    /// Airhorn log entries retained regardless of age.
    pub airhorn_min_len: usize,

    /// Maximum airhorns trimmed per pass.
    pub airhorn_expire_count: usize,

    /// Idle minutes before a fresh nest becomes reapable.
    pub nest_ttl_minutes: i64,

    /// TTL on per-member heartbeat keys.
    pub member_ttl_secs: u64,

    /// WebSocket heartbeat / member refresh interval.
    pub heartbeat_secs: u64,

    /// WebSocket receive timeout before the closed-flag check.
    pub ws_receive_timeout_secs: u64,

    /// Vote operations between full-queue score renumberings.
    pub vote_rescore_interval: i64,

    /// Bearer token -> identity table standing in for the upstream auth
    /// surface. Empty means every bearer request is rejected.
    pub api_tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".into(),
            log_dir: PathBuf::from("./play_logs"),
            catalog_client_id: String::new(),
            catalog_client_secret: String::new(),
            use_autofill: true,
            min_queue_depth: 3,
            max_queue_depth: 25,
            max_autofill_minutes: 180,
            filter_ttl_secs: 7 * 24 * 60 * 60,
            strategy_weights: StrategyWeights::default(),
            regions: vec!["US".into()],
            default_seed_uri: "spotify:track:3utq2FgD1pkmIoaWfjXWAU".into(),
            autofill_user: "fillbot@songnest.local".into(),
            autofill_display_name: "Fillbot".into(),
            privileged_users: Vec::new(),
            free_airhorn_jams: 5,
            airhorn_max: 3,
            airhorn_expire_secs: 600,
            airhorn_min_len: 5,
            airhorn_expire_count: 5,
            nest_ttl_minutes: 5,
            member_ttl_secs: 90,
            heartbeat_secs: 30,
            ws_receive_timeout_secs: 30,
            vote_rescore_interval: 200,
            api_tokens: HashMap::new(),
        }
    }
}

impl Config {
    /// Market passed to catalog searches.
    pub fn market(&self) -> &str {
        self.regions.first().map(String::as_str).unwrap_or("US")
    }

    /// Whether an identity may bypass the double-vote guard.
    pub fn is_privileged(&self, identity: &str) -> bool {
        let identity = identity.to_lowercase();
        self.privileged_users.iter().any(|p| p.eq_ignore_ascii_case(&identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_match_documented_split() {
        let w = StrategyWeights::default();
        assert_eq!(
            (w.genre, w.throwback, w.artist_search, w.top_tracks, w.album),
            (35, 30, 25, 5, 5)
        );
    }

    #[test]
    fn market_falls_back_to_us_when_regions_empty() {
        let mut config = Config::default();
        config.regions.clear();
        assert_eq!(config.market(), "US");
    }

    #[test]
    fn privileged_check_is_case_insensitive() {
        let mut config = Config::default();
        config.privileged_users.push("Admin@Example.com".into());
        assert!(config.is_privileged("admin@example.com"));
        assert!(!config.is_privileged("someone@example.com"));
    }
}
