//! Recommendation engine ("auto-fill", C6).
//!
//! Keeps the queue populated with plausibly-related tracks when humans stop
//! contributing. Five weighted strategies each own a small FIFO cache in
//! the store; one strategy is drawn per consumed song, its cache refilled
//! from the catalog on demand. A single preview slot exposes the next
//! candidate to the UI so "queue this" and "skip this" have stable
//! referents.
//!
//! Store keys keep their historical names (`BENDER|...`) - they are wire
//! format shared with operational tooling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::{CatalogClient, CatalogError};
use crate::context::NestContext;
use crate::error::{SongnestError, SongnestResult};
use crate::history::PlayHistory;
use crate::model::PreviewCard;
use crate::registry::NestRegistry;
use crate::state::StrategyWeights;

/// Process-wide rate-limit flag (deliberately not nest-scoped).
const RATE_LIMIT_KEY: &str = "MISC|spotify-rate-limited";

const SEED_INFO_KEY: &str = "BENDER|seed-info";
const PREVIEW_KEY: &str = "BENDER|next-preview";
const THROWBACK_USERS_KEY: &str = "BENDER|throwback-users";
const STREAK_KEY: &str = "MISC|bender_streak_start";
const LAST_QUEUED_KEY: &str = "MISC|last-queued";
const LAST_FILL_KEY: &str = "MISC|last-bender-track";

/// Strategy caches and the seed hash all share a 20-minute lifetime.
const CACHE_TTL: Duration = Duration::from_secs(20 * 60);

/// The five candidate-generation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Genre,
    Throwback,
    ArtistSearch,
    TopTracks,
    Album,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Genre,
        Strategy::Throwback,
        Strategy::ArtistSearch,
        Strategy::TopTracks,
        Strategy::Album,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Genre => "genre",
            Self::Throwback => "throwback",
            Self::ArtistSearch => "artist_search",
            Self::TopTracks => "top_tracks",
            Self::Album => "album",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == raw)
    }

    /// Key suffix of this strategy's FIFO cache.
    fn cache_suffix(&self) -> &'static str {
        match self {
            Self::Genre => "BENDER|cache:genre",
            Self::Throwback => "BENDER|cache:throwback",
            Self::ArtistSearch => "BENDER|cache:artist-search",
            Self::TopTracks => "BENDER|cache:top-tracks",
            Self::Album => "BENDER|cache:album",
        }
    }
}

/// A fill candidate drawn from a strategy cache.
#[derive(Debug, Clone, PartialEq)]
pub struct FillPick {
    pub uri: String,
    pub user: String,
    pub strategy: Strategy,
}

/// Cached seed metadata backing the catalog strategies.
#[derive(Debug, Clone)]
struct SeedInfo {
    artist_id: String,
    artist_name: String,
    album_id: String,
    genres: Vec<String>,
    seed_uri: String,
}

/// Display metadata for the preview card, cached per URI.
struct FillInfo {
    title: String,
    artist: String,
    img: String,
    big_img: String,
}

/// Weighted random pick from the remaining strategies.
///
/// `roll` must be uniform in `0..total_weight`; exposed for testing.
fn pick_weighted(candidates: &[(Strategy, u32)], roll: u32) -> Option<Strategy> {
    let mut cursor = 0u32;
    for (strategy, weight) in candidates {
        cursor += weight;
        if roll < cursor {
            return Some(*strategy);
        }
    }
    candidates.last().map(|(s, _)| *s)
}

/// Whether a URI can seed recommendations (episodes cannot).
fn seed_valid(uri: &str) -> bool {
    !uri.is_empty() && !uri.contains(":episode:")
}

/// Per-nest recommendation engine.
pub struct Recommender {
    ctx: NestContext,
    catalog: Arc<dyn CatalogClient>,
    history: Arc<PlayHistory>,
    registry: Arc<NestRegistry>,
}

impl Recommender {
    pub fn new(
        ctx: NestContext,
        catalog: Arc<dyn CatalogClient>,
        history: Arc<PlayHistory>,
        registry: Arc<NestRegistry>,
    ) -> Self {
        Self {
            ctx,
            catalog,
            history,
            registry,
        }
    }

    fn cache_key(&self, strategy: Strategy) -> String {
        self.ctx.key(strategy.cache_suffix())
    }

    fn filter_key(&self, uri: &str) -> String {
        self.ctx.key(&format!("FILTER|{uri}"))
    }

    /// Number of candidates fetched per cache refill. The main nest keeps a
    /// deeper buffer; side nests stay small to limit catalog pressure.
    fn fetch_limit(&self) -> u32 {
        if self.ctx.is_main() {
            20
        } else {
            5
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rate limiting
    // ─────────────────────────────────────────────────────────────────────

    /// Whether the catalog has asked us to back off.
    pub async fn is_rate_limited(&self) -> SongnestResult<bool> {
        Ok(self.ctx.store.ttl(RATE_LIMIT_KEY).await? > 0)
    }

    async fn note_rate_limited(&self, retry_after_secs: u64) {
        log::warn!(
            "[Autofill] Catalog rate limited for {}s",
            retry_after_secs
        );
        let ttl = Duration::from_secs(retry_after_secs.max(1));
        if let Err(e) = self.ctx.store.set_ex(RATE_LIMIT_KEY, "1", ttl).await {
            log::warn!("[Autofill] Could not persist rate-limit flag: {}", e);
        }
    }

    /// Collapses a catalog error into an empty result, persisting the
    /// backoff window when it was a rate limit.
    async fn absorb(&self, what: &str, err: CatalogError) -> Vec<String> {
        match err {
            CatalogError::RateLimited { retry_after_secs } => {
                self.note_rate_limited(retry_after_secs).await;
            }
            other => log::warn!("[Autofill] {} fetch failed: {}", what, other),
        }
        Vec::new()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Filter list
    // ─────────────────────────────────────────────────────────────────────

    /// Blocks a URI from being re-suggested until the filter TTL expires.
    pub async fn filter_uri(&self, uri: &str) -> SongnestResult<()> {
        let ttl = Duration::from_secs(self.ctx.config.filter_ttl_secs);
        self.ctx.store.set_ex(&self.filter_key(uri), "1", ttl).await?;
        Ok(())
    }

    async fn is_filtered(&self, uri: &str) -> SongnestResult<bool> {
        Ok(self.ctx.store.exists(&self.filter_key(uri)).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Seed resolution
    // ─────────────────────────────────────────────────────────────────────

    /// Best seed URI, in priority order: last human-queued track, last fill
    /// track, currently playing track, the nest's configured seed, the
    /// global default.
    async fn resolve_seed_uri(&self) -> SongnestResult<String> {
        if let Some(uri) = self.ctx.store.get(&self.ctx.key(LAST_QUEUED_KEY)).await? {
            if seed_valid(&uri) {
                return Ok(uri);
            }
        }
        if let Some(uri) = self.ctx.store.get(&self.ctx.key(LAST_FILL_KEY)).await? {
            if seed_valid(&uri) {
                return Ok(uri);
            }
        }
        if let Some(entry) = crate::queue::now_playing_entry(&self.ctx).await? {
            if seed_valid(&entry.trackid) {
                return Ok(entry.trackid);
            }
        }
        if let Ok(Some(meta)) = self.registry.get_nest(&self.ctx.nest_id).await {
            if let Some(uri) = meta.seed_uri {
                if seed_valid(&uri) {
                    return Ok(uri);
                }
            }
        }
        log::debug!("[Autofill] No valid seed found, using default");
        Ok(self.ctx.config.default_seed_uri.clone())
    }

    /// Fetches and caches seed artist metadata (20-minute lifetime, keyed
    /// by the resolved seed URI so a new seed invalidates the cache).
    async fn seed_info(&self) -> SongnestResult<Option<SeedInfo>> {
        let seed_uri = self.resolve_seed_uri().await?;
        let key = self.ctx.key(SEED_INFO_KEY);
        let cached = self.ctx.store.hgetall(&key).await?;
        if !cached.is_empty() {
            if cached.get("seed_uri") == Some(&seed_uri) {
                return Ok(Some(SeedInfo {
                    artist_id: cached.get("artist_id").cloned().unwrap_or_default(),
                    artist_name: cached.get("artist_name").cloned().unwrap_or_default(),
                    album_id: cached.get("album_id").cloned().unwrap_or_default(),
                    genres: cached
                        .get("genres")
                        .and_then(|g| serde_json::from_str(g).ok())
                        .unwrap_or_default(),
                    seed_uri,
                }));
            }
            self.ctx.store.del(&key).await?;
        }
        if self.is_rate_limited().await? {
            return Ok(None);
        }

        let track = match self.catalog.track(&seed_uri).await {
            Ok(t) => t,
            Err(e) => {
                self.absorb("seed track", e).await;
                return Ok(None);
            }
        };
        let Some(primary) = track.primary_artist().cloned() else {
            return Ok(None);
        };
        let genres = match self.catalog.artist(&primary.id).await {
            Ok(artist) => artist.genres,
            Err(e) => {
                self.absorb("seed artist", e).await;
                return Ok(None);
            }
        };

        let info = SeedInfo {
            artist_id: primary.id,
            artist_name: primary.name,
            album_id: track.album_id,
            genres,
            seed_uri,
        };
        let fields = vec![
            ("artist_id".to_string(), info.artist_id.clone()),
            ("artist_name".to_string(), info.artist_name.clone()),
            ("album_id".to_string(), info.album_id.clone()),
            (
                "genres".to_string(),
                serde_json::to_string(&info.genres).unwrap_or_else(|_| "[]".into()),
            ),
            ("seed_uri".to_string(), info.seed_uri.clone()),
        ];
        self.ctx.store.hset_all(&key, &fields).await?;
        self.ctx.store.expire(&key, CACHE_TTL).await?;
        Ok(Some(info))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Strategy selection and cache filling
    // ─────────────────────────────────────────────────────────────────────

    fn weights(&self) -> Vec<(Strategy, u32)> {
        let StrategyWeights {
            genre,
            throwback,
            artist_search,
            top_tracks,
            album,
        } = self.ctx.config.strategy_weights;
        vec![
            (Strategy::Genre, genre),
            (Strategy::Throwback, throwback),
            (Strategy::ArtistSearch, artist_search),
            (Strategy::TopTracks, top_tracks),
            (Strategy::Album, album),
        ]
    }

    /// Weighted random draw from the strategies not yet tried this round.
    fn select_strategy(&self, exclude: &HashSet<Strategy>) -> Option<Strategy> {
        let candidates: Vec<(Strategy, u32)> = self
            .weights()
            .into_iter()
            .filter(|(s, w)| *w > 0 && !exclude.contains(s))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let total: u32 = candidates.iter().map(|(_, w)| w).sum();
        let roll = rand::thread_rng().gen_range(0..total);
        pick_weighted(&candidates, roll)
    }

    async fn fetch_candidates(&self, strategy: Strategy, seed: &SeedInfo) -> Vec<String> {
        let market = self.ctx.config.market().to_string();
        let limit = self.fetch_limit();
        match strategy {
            Strategy::Genre => {
                let genre = {
                    let mut rng = rand::thread_rng();
                    seed.genres.choose(&mut rng).cloned()
                };
                let genre = match genre {
                    Some(g) => g,
                    None => match self.nest_genre_hint().await {
                        Some(hint) => hint,
                        None => return Vec::new(),
                    },
                };
                match self
                    .catalog
                    .search_tracks(&format!("genre:\"{genre}\""), limit, &market)
                    .await
                {
                    Ok(uris) => uris,
                    Err(e) => self.absorb("genre", e).await,
                }
            }
            Strategy::ArtistSearch => {
                if seed.artist_name.is_empty() {
                    return Vec::new();
                }
                match self
                    .catalog
                    .search_tracks(&seed.artist_name, limit, &market)
                    .await
                {
                    Ok(uris) => uris,
                    Err(e) => self.absorb("artist search", e).await,
                }
            }
            Strategy::TopTracks => {
                if seed.artist_id.is_empty() {
                    return Vec::new();
                }
                match self
                    .catalog
                    .artist_top_tracks(&seed.artist_id, &market)
                    .await
                {
                    Ok(uris) => uris,
                    Err(e) => self.absorb("top tracks", e).await,
                }
            }
            Strategy::Album => {
                if seed.album_id.is_empty() {
                    return Vec::new();
                }
                match self.catalog.album_tracks(&seed.album_id).await {
                    Ok(uris) => uris,
                    Err(e) => self.absorb("album", e).await,
                }
            }
            Strategy::Throwback => Vec::new(),
        }
    }

    async fn nest_genre_hint(&self) -> Option<String> {
        self.registry
            .get_nest(&self.ctx.nest_id)
            .await
            .ok()
            .flatten()
            .and_then(|meta| meta.genre_hint)
    }

    /// Refills one strategy's cache. Returns how many candidates landed.
    async fn fill_cache(&self, strategy: Strategy, seed: Option<&SeedInfo>) -> SongnestResult<usize> {
        if strategy == Strategy::Throwback {
            return self.fill_throwback_cache().await;
        }
        if self.is_rate_limited().await? {
            return Ok(0);
        }
        let Some(seed) = seed else {
            return Ok(0);
        };
        let uris = self.fetch_candidates(strategy, seed).await;

        let mut filtered = Vec::new();
        let mut seen = HashSet::new();
        for uri in uris {
            if uri == seed.seed_uri || !seen.insert(uri.clone()) {
                continue;
            }
            if self.is_filtered(&uri).await? {
                continue;
            }
            filtered.push(uri);
        }
        {
            let mut rng = rand::thread_rng();
            filtered.shuffle(&mut rng);
        }
        if filtered.is_empty() {
            return Ok(0);
        }
        let key = self.cache_key(strategy);
        self.ctx.store.rpush(&key, &filtered).await?;
        self.ctx.store.expire(&key, CACHE_TTL).await?;
        log::debug!(
            "[Autofill] Cached {} candidates for {}",
            filtered.len(),
            strategy.as_str()
        );
        Ok(filtered.len())
    }

    /// Refills the throwback cache from the play history, preserving each
    /// play's original contributor for attribution.
    async fn fill_throwback_cache(&self) -> SongnestResult<usize> {
        let weekday = Local::now().weekday();
        let plays = match self.history.throwback_candidates(weekday, 20) {
            Ok(plays) => plays,
            Err(e) => {
                log::warn!("[Autofill] Throwback query failed: {}", e);
                return Ok(0);
            }
        };
        if plays.is_empty() {
            return Ok(0);
        }
        let cache_key = self.cache_key(Strategy::Throwback);
        let users_key = self.ctx.key(THROWBACK_USERS_KEY);
        let mut pipe = redis::pipe();
        let mut count = 0;
        for play in plays {
            if self.is_filtered(&play.trackid).await? {
                continue;
            }
            let user = if play.user.is_empty() {
                self.ctx.config.autofill_user.clone()
            } else {
                play.user
            };
            pipe.rpush(&cache_key, &play.trackid);
            pipe.hset(&users_key, &play.trackid, &user);
            count += 1;
        }
        if count > 0 {
            self.ctx.store.exec(&pipe).await?;
            self.ctx.store.expire(&cache_key, CACHE_TTL).await?;
            self.ctx.store.expire(&users_key, CACHE_TTL).await?;
        }
        log::debug!("[Autofill] Cached {} throwback candidates", count);
        Ok(count)
    }

    /// Drops every cache, the seed hash, and the preview slot. Called when
    /// a human track takes over as the seed.
    pub async fn clear_caches(&self) -> SongnestResult<()> {
        let mut keys: Vec<String> = Strategy::ALL.iter().map(|s| self.cache_key(*s)).collect();
        keys.push(self.ctx.key(SEED_INFO_KEY));
        keys.push(self.ctx.key(THROWBACK_USERS_KEY));
        keys.push(self.ctx.key(PREVIEW_KEY));
        self.ctx.store.del_many(&keys).await?;
        Ok(())
    }

    /// Pre-warms one cache if every cache is empty.
    pub async fn ensure_warm(&self) -> SongnestResult<()> {
        for strategy in Strategy::ALL {
            if self.ctx.store.llen(&self.cache_key(strategy)).await? > 0 {
                return Ok(());
            }
        }
        let seed = self.seed_info().await?;
        let mut by_weight = self.weights();
        by_weight.sort_by(|a, b| b.1.cmp(&a.1));
        for (strategy, weight) in by_weight {
            if weight == 0 {
                continue;
            }
            if self.fill_cache(strategy, seed.as_ref()).await? > 0 {
                return Ok(());
            }
        }
        log::warn!("[Autofill] Every strategy came up empty");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Preview / consume
    // ─────────────────────────────────────────────────────────────────────

    async fn read_preview(&self) -> SongnestResult<Option<FillPick>> {
        let preview = self.ctx.store.hgetall(&self.ctx.key(PREVIEW_KEY)).await?;
        let Some(uri) = preview.get("trackid").filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let strategy = preview
            .get("strategy")
            .and_then(|s| Strategy::from_str(s))
            .unwrap_or(Strategy::Genre);
        let user = preview
            .get("user")
            .cloned()
            .unwrap_or_else(|| self.ctx.config.autofill_user.clone());
        Ok(Some(FillPick {
            uri: uri.clone(),
            user,
            strategy,
        }))
    }

    async fn write_preview(&self, pick: &FillPick) -> SongnestResult<()> {
        let key = self.ctx.key(PREVIEW_KEY);
        let fields = vec![
            ("trackid".to_string(), pick.uri.clone()),
            ("user".to_string(), pick.user.clone()),
            ("strategy".to_string(), pick.strategy.as_str().to_string()),
        ];
        self.ctx.store.hset_all(&key, &fields).await?;
        Ok(())
    }

    async fn drop_preview(&self) -> SongnestResult<()> {
        self.ctx.store.del(&self.ctx.key(PREVIEW_KEY)).await
            .map_err(Into::into)
    }

    /// Pops the head of a strategy cache. Attribution for throwback URIs
    /// must be read before [`Self::clear_attribution`] is called.
    async fn pop_cache(&self, strategy: Strategy) -> SongnestResult<Option<String>> {
        Ok(self.ctx.store.lpop(&self.cache_key(strategy)).await?)
    }

    /// Drops the stored throwback attribution for a consumed URI.
    async fn clear_attribution(&self, strategy: Strategy, uri: &str) -> SongnestResult<()> {
        if strategy == Strategy::Throwback {
            self.ctx
                .store
                .hdel(&self.ctx.key(THROWBACK_USERS_KEY), uri)
                .await?;
        }
        Ok(())
    }

    async fn attribution(&self, strategy: Strategy, uri: &str) -> SongnestResult<String> {
        if strategy == Strategy::Throwback {
            if let Some(user) = self
                .ctx
                .store
                .hget(&self.ctx.key(THROWBACK_USERS_KEY), uri)
                .await?
            {
                return Ok(user);
            }
        }
        Ok(self.ctx.config.autofill_user.clone())
    }

    /// Non-consuming peek at the next fill candidate, pinning it into the
    /// preview slot. A preview invalidated by the filter list is replaced.
    pub async fn peek_next(&self) -> SongnestResult<Option<FillPick>> {
        if let Some(pick) = self.read_preview().await? {
            if !self.is_filtered(&pick.uri).await? {
                return Ok(Some(pick));
            }
            self.drop_preview().await?;
        }

        let mut seed: Option<Option<SeedInfo>> = None;
        let mut tried = HashSet::new();
        loop {
            let Some(strategy) = self.select_strategy(&tried) else {
                return Ok(None);
            };
            let cache = self.cache_key(strategy);
            let mut head = self.ctx.store.lindex(&cache, 0).await?;
            if head.is_none() {
                if seed.is_none() {
                    seed = Some(self.seed_info().await?);
                }
                let seed_ref = seed.as_ref().and_then(|s| s.as_ref());
                if self.fill_cache(strategy, seed_ref).await? > 0 {
                    head = self.ctx.store.lindex(&cache, 0).await?;
                }
            }
            let Some(mut uri) = head else {
                tried.insert(strategy);
                continue;
            };

            // Drain filtered candidates off the front.
            while self.is_filtered(&uri).await? {
                self.clear_attribution(strategy, &uri).await?;
                self.pop_cache(strategy).await?;
                match self.ctx.store.lindex(&cache, 0).await? {
                    Some(next) => uri = next,
                    None => break,
                }
            }
            if self.is_filtered(&uri).await? {
                tried.insert(strategy);
                continue;
            }

            let user = self.attribution(strategy, &uri).await?;
            let pick = FillPick {
                uri,
                user,
                strategy,
            };
            self.write_preview(&pick).await?;
            return Ok(Some(pick));
        }
    }

    /// Consumes the next fill song via per-song weighted strategy rotation.
    ///
    /// The previewed candidate is consumed first so the UI's "up next" card
    /// and the actual queue stay in sync. While rate-limited, only the
    /// throwback strategy (which needs no catalog calls) is tried.
    /// Returns `None` when every strategy is exhausted.
    pub async fn consume_fill(&self) -> SongnestResult<Option<FillPick>> {
        if let Some(pick) = self.read_preview().await? {
            self.pop_cache(pick.strategy).await?;
            self.clear_attribution(pick.strategy, &pick.uri).await?;
            self.drop_preview().await?;
            if !self.is_filtered(&pick.uri).await? {
                self.note_fill(&pick).await?;
                return Ok(Some(pick));
            }
            // Filtered since the preview was written; fall through.
        }

        if self.is_rate_limited().await? {
            return self.consume_throwback_only().await;
        }

        let seed = self.seed_info().await?;
        let mut tried = HashSet::new();
        loop {
            let Some(strategy) = self.select_strategy(&tried) else {
                log::error!("[Autofill] Exhausted every recommendation strategy");
                return Ok(None);
            };
            let mut uri = self.pop_cache(strategy).await?;
            if uri.is_none() {
                self.fill_cache(strategy, seed.as_ref()).await?;
                uri = self.pop_cache(strategy).await?;
            }
            let Some(mut uri) = uri else {
                tried.insert(strategy);
                continue;
            };
            // Drain filtered candidates.
            loop {
                if !self.is_filtered(&uri).await? {
                    break;
                }
                self.clear_attribution(strategy, &uri).await?;
                match self.pop_cache(strategy).await? {
                    Some(next) => uri = next,
                    None => {
                        uri = String::new();
                        break;
                    }
                }
            }
            if uri.is_empty() {
                tried.insert(strategy);
                continue;
            }

            let user = self.attribution(strategy, &uri).await?;
            self.clear_attribution(strategy, &uri).await?;
            let pick = FillPick {
                uri,
                user,
                strategy,
            };
            self.note_fill(&pick).await?;
            return Ok(Some(pick));
        }
    }

    /// Rate-limited fallback path: throwback needs no catalog calls.
    async fn consume_throwback_only(&self) -> SongnestResult<Option<FillPick>> {
        for attempt in 0..2 {
            if let Some(uri) = self
                .ctx
                .store
                .lindex(&self.cache_key(Strategy::Throwback), 0)
                .await?
            {
                let user = self.attribution(Strategy::Throwback, &uri).await?;
                self.pop_cache(Strategy::Throwback).await?;
                self.clear_attribution(Strategy::Throwback, &uri).await?;
                let pick = FillPick {
                    uri,
                    user,
                    strategy: Strategy::Throwback,
                };
                self.note_fill(&pick).await?;
                return Ok(Some(pick));
            }
            if attempt == 0 && self.fill_throwback_cache().await? == 0 {
                break;
            }
        }
        Ok(None)
    }

    async fn note_fill(&self, pick: &FillPick) -> SongnestResult<()> {
        self.ctx
            .store
            .set(&self.ctx.key(LAST_FILL_KEY), &pick.uri)
            .await?;
        log::info!(
            "[Autofill] strategy={} track={} user={}",
            pick.strategy.as_str(),
            pick.uri,
            pick.user
        );
        Ok(())
    }

    /// Consumes the preview only when it references `trackid`; used by the
    /// queue/skip handlers so a stale click cannot eat a fresh preview.
    pub async fn consume_preview_matching(
        &self,
        trackid: &str,
    ) -> SongnestResult<Option<FillPick>> {
        let Some(pick) = self.read_preview().await? else {
            return Ok(None);
        };
        if pick.uri != trackid {
            return Ok(None);
        }
        self.pop_cache(pick.strategy).await?;
        self.clear_attribution(pick.strategy, &pick.uri).await?;
        self.drop_preview().await?;
        Ok(Some(pick))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streak limit
    // ─────────────────────────────────────────────────────────────────────

    /// Seconds of continuous auto-fill, measured on the virtual clock.
    pub async fn streak_seconds(&self) -> SongnestResult<i64> {
        let Some(raw) = self.ctx.store.get(&self.ctx.key(STREAK_KEY)).await? else {
            return Ok(0);
        };
        let Ok(start) = DateTime::parse_from_rfc3339(&raw) else {
            log::debug!("[Autofill] Unparsable streak start, assuming no streak");
            return Ok(0);
        };
        let now = crate::playhead::player_now(&self.ctx).await?;
        Ok((now - start.with_timezone(&Utc)).num_seconds())
    }

    /// Marks the start of an auto-fill run if one is not already marked.
    pub async fn mark_streak_start(&self) -> SongnestResult<()> {
        let now = crate::playhead::player_now(&self.ctx).await?;
        self.ctx
            .store
            .set_nx(&self.ctx.key(STREAK_KEY), &now.to_rfc3339())
            .await?;
        Ok(())
    }

    /// Clears the streak; called whenever a human contributes.
    pub async fn clear_streak(&self) -> SongnestResult<()> {
        self.ctx.store.del(&self.ctx.key(STREAK_KEY)).await?;
        Ok(())
    }

    /// Records the last human-queued track as the fresh seed and resets
    /// every cache around it.
    pub async fn reseed_from(&self, trackid: &str) -> SongnestResult<()> {
        self.ctx
            .store
            .set(&self.ctx.key(LAST_QUEUED_KEY), trackid)
            .await?;
        self.clear_caches().await?;
        if let Err(e) = self.ensure_warm().await {
            log::warn!("[Autofill] Pre-fetch after reseed failed: {}", e);
        }
        self.clear_streak().await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Preview card
    // ─────────────────────────────────────────────────────────────────────

    /// Display metadata for a fill URI, cached for 20 minutes.
    async fn fill_info(&self, uri: &str) -> SongnestResult<FillInfo> {
        let key = self.ctx.key(&format!("FILL-INFO|{uri}"));
        let cached = self.ctx.store.hgetall(&key).await?;
        if !cached.is_empty() {
            let grab = |field: &str| cached.get(field).cloned().unwrap_or_default();
            return Ok(FillInfo {
                title: grab("title"),
                artist: grab("artist"),
                img: grab("img"),
                big_img: grab("big_img"),
            });
        }
        if self.is_rate_limited().await? {
            return Err(SongnestError::CatalogUnavailable("rate limited".into()));
        }
        let track = self.catalog.track(uri).await?;
        let info = FillInfo {
            title: track.title.clone(),
            artist: track.artist_line(),
            img: track.img.clone(),
            big_img: track.big_img.clone(),
        };
        let fields = vec![
            ("title".to_string(), info.title.clone()),
            ("artist".to_string(), info.artist.clone()),
            ("img".to_string(), info.img.clone()),
            ("big_img".to_string(), info.big_img.clone()),
        ];
        self.ctx.store.hset_all(&key, &fields).await?;
        self.ctx.store.expire(&key, CACHE_TTL).await?;
        Ok(info)
    }

    /// The "up next" card appended to the queue view. Never fails: broken
    /// candidates are dropped and retried a few times, then a placeholder
    /// card is returned.
    pub async fn preview_card(&self) -> PreviewCard {
        for _ in 0..5 {
            if let Err(e) = self.ensure_warm().await {
                log::warn!("[Autofill] Could not warm caches: {}", e);
                break;
            }
            let pick = match self.peek_next().await {
                Ok(Some(pick)) => pick,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[Autofill] Preview peek failed: {}", e);
                    break;
                }
            };
            match self.fill_info(&pick.uri).await {
                Ok(info) => {
                    return preview_card_for(
                        &pick,
                        &info,
                        &self.ctx.config.autofill_display_name,
                        &self.ctx.config.autofill_user,
                    );
                }
                Err(e) => {
                    log::warn!("[Autofill] Candidate {} unavailable: {}", pick.uri, e);
                    if let Err(e) = self.pop_cache(pick.strategy).await {
                        log::warn!("[Autofill] Could not drop bad candidate: {}", e);
                    }
                    let _ = self.clear_attribution(pick.strategy, &pick.uri).await;
                    let _ = self.drop_preview().await;
                }
            }
        }
        PreviewCard::unavailable(
            &self.ctx.config.autofill_display_name,
            &self.ctx.config.autofill_user,
        )
    }
}

/// Builds the preview card with throwback attribution.
fn preview_card_for(
    pick: &FillPick,
    info: &FillInfo,
    bot_display: &str,
    bot_user: &str,
) -> PreviewCard {
    let (name, user) = if pick.strategy == Strategy::Throwback {
        let short = pick.user.split('@').next().unwrap_or(&pick.user);
        (format!("{short} (throwback)"), pick.user.clone())
    } else {
        (bot_display.to_string(), bot_user.to_string())
    };
    PreviewCard {
        playlist_src: true,
        name,
        user,
        title: format!("{} : {}", info.artist, info.title),
        trackid: pick.uri.clone(),
        img: info.img.clone(),
        big_img: info.big_img.clone(),
        jam: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_str(strategy.as_str()), Some(strategy));
        }
        assert_eq!(Strategy::from_str("vibes"), None);
    }

    #[test]
    fn cache_suffixes_are_distinct() {
        let suffixes: HashSet<&str> = Strategy::ALL.iter().map(|s| s.cache_suffix()).collect();
        assert_eq!(suffixes.len(), Strategy::ALL.len());
    }

    #[test]
    fn weighted_pick_respects_boundaries() {
        let candidates = vec![(Strategy::Genre, 35), (Strategy::Throwback, 30)];
        assert_eq!(pick_weighted(&candidates, 0), Some(Strategy::Genre));
        assert_eq!(pick_weighted(&candidates, 34), Some(Strategy::Genre));
        assert_eq!(pick_weighted(&candidates, 35), Some(Strategy::Throwback));
        assert_eq!(pick_weighted(&candidates, 64), Some(Strategy::Throwback));
    }

    #[test]
    fn weighted_pick_empty_is_none() {
        assert_eq!(pick_weighted(&[], 0), None);
    }

    #[test]
    fn episodes_are_not_valid_seeds() {
        assert!(seed_valid("spotify:track:abc"));
        assert!(!seed_valid("spotify:episode:abc"));
        assert!(!seed_valid(""));
    }

    #[test]
    fn throwback_card_credits_the_original_contributor() {
        let pick = FillPick {
            uri: "spotify:track:t1".into(),
            user: "bob@example.com".into(),
            strategy: Strategy::Throwback,
        };
        let info = FillInfo {
            title: "Song".into(),
            artist: "Artist".into(),
            img: String::new(),
            big_img: String::new(),
        };
        let card = preview_card_for(&pick, &info, "Fillbot", "fillbot@songnest.local");
        assert_eq!(card.name, "bob (throwback)");
        assert_eq!(card.user, "bob@example.com");
        assert_eq!(card.title, "Artist : Song");
        assert!(card.playlist_src);
    }

    #[test]
    fn catalog_strategy_card_credits_the_bot() {
        let pick = FillPick {
            uri: "spotify:track:t2".into(),
            user: "fillbot@songnest.local".into(),
            strategy: Strategy::Genre,
        };
        let info = FillInfo {
            title: "Other".into(),
            artist: "Someone".into(),
            img: String::new(),
            big_img: String::new(),
        };
        let card = preview_card_for(&pick, &info, "Fillbot", "fillbot@songnest.local");
        assert_eq!(card.name, "Fillbot");
        assert_eq!(card.user, "fillbot@songnest.local");
    }
}
