//! Nest registry and lifecycle (C2).
//!
//! Nests are registered in a global hash (`NESTS|registry`) mapping nest id
//! to metadata JSON, with string lookups for join codes and URL slugs.
//! Deletion is race-safe: a 30 s `DELETING` sentinel blocks mutations while
//! the nest's whole key namespace is scanned and unlinked, and expires on
//! its own if the deleting worker crashes mid-way.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogClient;
use crate::context::{DELETING_KEY, MAIN_NEST};
use crate::error::{SongnestError, SongnestResult};
use crate::state::Config;
use crate::store::Store;

/// Global registry hash: nest_id -> metadata JSON.
const REGISTRY_KEY: &str = "NESTS|registry";

/// Join codes are drawn from this unambiguous alphabet (no `0 O 1 I L`).
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Join codes are exactly this long.
pub const CODE_LENGTH: usize = 5;

/// Sentinel TTL covering the worst-case namespace sweep.
const DELETING_TTL_SECS: u64 = 30;

/// Curated pool of sonic-themed nest names.
const NEST_NAMES: &[&str] = &[
    "WaveyNest", "BassNest", "VibesNest", "FunkNest", "GrooveNest", "TrebleNest", "ReverbNest",
    "TempoNest", "RiffNest", "SynthNest", "LoopNest", "BeatNest", "ChordNest", "FaderNest",
    "SubNest", "DropNest", "PulseNest", "ToneNest", "MixNest", "TrackNest", "SampleNest",
    "BreakNest", "HookNest", "BridgeNest", "VerseNest", "ChorusNest", "MelodyNest", "RhythmNest",
    "HarmonyNest", "CadenceNest", "OctaveNest", "PitchNest", "GainNest", "ClipNest", "FlangerNest",
    "PhaserNest", "DistortNest", "WahNest", "CrunchNest", "FuzzNest", "BoostNest", "SlapNest",
    "SnapNest", "PopNest", "ClickNest", "BoomNest", "HissNest", "BuzzNest", "TwangNest",
    "StompNest",
];

/// Themed seed track + genre keyword per pool name, so auto-named nests
/// start their recommendations in character.
const NEST_SEEDS: &[(&str, &str, &str)] = &[
    ("WaveyNest", "spotify:track:5GUYJTQap5F3RDQiCOJhrS", "new wave"),
    ("BassNest", "spotify:track:3MODES4TNtygekLl146Dxd", "bass music"),
    ("VibesNest", "spotify:track:5le4sn0iMcnKU56bdmNzso", "chill"),
    ("FunkNest", "spotify:track:4XRkQloZFcRrCONN7ZQ49Y", "funk"),
    ("GrooveNest", "spotify:track:1TfqLAPs4K3s2rJMoCokcS", "groove"),
    ("TrebleNest", "spotify:track:1vrd6UOGamcKNGnSHJQlSt", "classical"),
    ("ReverbNest", "spotify:track:2pQ4A6w5HSurB5WiaLFhcF", "shoegaze"),
    ("TempoNest", "spotify:track:3yfqSUWxFvZELEM4PmlwIR", "drum and bass"),
    ("RiffNest", "spotify:track:57bgtoPSgt236HzfBOd8kj", "hard rock"),
    ("SynthNest", "spotify:track:3MrRksHupTVEQ7YbA0FsZK", "synthpop"),
    ("LoopNest", "spotify:track:6nek1Nin9q48AVZcWs9e9D", "trip hop"),
    ("BeatNest", "spotify:track:7GhIk7Il098yCjg4BQjzvb", "hip hop"),
    ("ChordNest", "spotify:track:4gphxUgq0JSFv2BCLhNDiE", "jazz"),
    ("FaderNest", "spotify:track:2PpruBYCo4H7WOBJ7Q2EwM", "deep house"),
    ("SubNest", "spotify:track:4rwpZEcnalkuhPyGkEdhu0", "dubstep"),
    ("DropNest", "spotify:track:5HQVUIKwCEXpe7JIHyY734", "edm"),
    ("PulseNest", "spotify:track:7xQYVjs4wZNdCwO0EeAWMC", "techno"),
    ("ToneNest", "spotify:track:4u7EnebtmKWzUH433cf5Qv", "soul"),
    ("MixNest", "spotify:track:4uLU6hMCjMI75M1A2tKUQC", "dance"),
    ("TrackNest", "spotify:track:0pqnGHJpmpxLKifKRmU6WP", "electronic"),
    ("SampleNest", "spotify:track:5Z01UMMf7V1o0MzF86s6WJ", "boom bap"),
    ("BreakNest", "spotify:track:40riOy7x9W7GXjyGp4pjAv", "breakbeat"),
    ("HookNest", "spotify:track:7lPN2DXiMsVn7XUKtOW1CS", "pop"),
    ("BridgeNest", "spotify:track:6dGnYIeXmHdcikdzNNDMm2", "progressive rock"),
    ("VerseNest", "spotify:track:3n3Ppam7vgaVa1iaRUc9Lp", "singer-songwriter"),
    ("ChorusNest", "spotify:track:3qiyyUfYe7CRYLucrPmulD", "anthem"),
    ("MelodyNest", "spotify:track:3BQHpFgAp4l80e1XslIjNI", "indie pop"),
    ("RhythmNest", "spotify:track:2r0KlAVemiB1TyTqgCh5ve", "afrobeat"),
    ("HarmonyNest", "spotify:track:5jgFfDIR6FR0gvlA56Nakr", "a cappella"),
    ("CadenceNest", "spotify:track:2tUBqZG2AbRi7Q0BIrVrEj", "neo soul"),
    ("OctaveNest", "spotify:track:1B75hgRqe7A4fwee3g3Wmu", "opera"),
    ("PitchNest", "spotify:track:17QTsL4K9B9v4rI8CAIdfC", "barbershop"),
    ("GainNest", "spotify:track:7iN1s7xHE4ifF5povM6A48", "metal"),
    ("ClipNest", "spotify:track:7dt6x5M1jzdTEt8oCbisTK", "lo-fi"),
    ("FlangerNest", "spotify:track:37Tmv4NnfQeb0ZgUC4fOJj", "psychedelic rock"),
    ("PhaserNest", "spotify:track:6habFhsOp2NvshLv26DqMb", "space rock"),
    ("DistortNest", "spotify:track:5ghIJDpPoe3CfHMGu71E6T", "grunge"),
    ("WahNest", "spotify:track:0wJoRiX5K5BxlqZTolB2LD", "blues rock"),
    ("CrunchNest", "spotify:track:124Y9LPRCAz3q2OP0iCvcJ", "punk rock"),
    ("FuzzNest", "spotify:track:5CQ30WqJwcep0pYcV4AMNc", "stoner rock"),
    ("BoostNest", "spotify:track:0VjIjW4GlUZAMYd2vXMi3b", "power pop"),
    ("SlapNest", "spotify:track:3ZOEytgrvLwQaqXreDs2Jx", "slap house"),
    ("SnapNest", "spotify:track:0VgkVdmE4gld66l8iyGjgx", "trap"),
    ("PopNest", "spotify:track:2Fxmhks0bxGSBdJ92vM42m", "pop"),
    ("ClickNest", "spotify:track:553HOkDZQktOEBKvxTBPS1", "minimal techno"),
    ("BoomNest", "spotify:track:5YoITs1m0q8UOQ4AW7N5ga", "reggaeton"),
    ("HissNest", "spotify:track:4LRPiXqCikLlN15c3yImP7", "ambient"),
    ("BuzzNest", "spotify:track:2EoOZnxNgtmZaD8uUmz2nD", "industrial"),
    ("TwangNest", "spotify:track:5rDkA2TFOImbiVenmnE9r4", "country"),
    ("StompNest", "spotify:track:3dPQuX8Gs42Y7b454ybpMR", "garage rock"),
];

fn code_key(code: &str) -> String {
    format!("NESTS|code:{code}")
}

fn slug_key(slug: &str) -> String {
    format!("NESTS|slug:{slug}")
}

fn nest_prefix(nest_id: &str) -> String {
    format!("NEST:{nest_id}|")
}

fn deleting_key(nest_id: &str) -> String {
    format!("NEST:{nest_id}|{DELETING_KEY}")
}

/// Registered metadata for one nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestMeta {
    pub nest_id: String,
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub creator: String,
    #[serde(default)]
    pub is_main: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Idle minutes before the reaper may delete the nest; 0 = never.
    #[serde(default)]
    pub ttl_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre_hint: Option<String>,
    /// Filled on listing; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u64>,
}

/// Lowercases a name into a URL slug; returns `None` for names with no
/// slug-safe characters.
pub fn slugify(name: &str) -> Option<String> {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_hyphen = true;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    (!slug.is_empty()).then_some(slug)
}

/// Themed (seed URI, genre keyword) for a pool name, tolerating the numeric
/// suffix appended when the pool overflows ("BassNest2" -> "BassNest").
pub fn theme_seed(name: &str) -> Option<(&'static str, &'static str)> {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    NEST_SEEDS
        .iter()
        .find(|(n, _, _)| *n == name || *n == base)
        .map(|(_, uri, genre)| (*uri, *genre))
}

/// Reaper predicate: whether an idle nest should be deleted.
///
/// Main is never reaped; live members or queued tracks always keep a nest
/// alive; otherwise the nest goes once `ttl_minutes` of inactivity have
/// elapsed (0 disables reaping entirely).
pub fn should_delete_nest(
    meta: &NestMeta,
    active_members: u64,
    queue_size: u64,
    now: DateTime<Utc>,
) -> bool {
    if meta.is_main {
        return false;
    }
    if active_members > 0 || queue_size > 0 {
        return false;
    }
    if meta.ttl_minutes <= 0 {
        return false;
    }
    let idle_secs = (now - meta.last_activity).num_seconds();
    idle_secs >= meta.ttl_minutes * 60
}

/// Create / look up / list / delete nests.
pub struct NestRegistry {
    store: Store,
    catalog: Arc<dyn CatalogClient>,
    config: Arc<Config>,
}

impl NestRegistry {
    pub fn new(store: Store, catalog: Arc<dyn CatalogClient>, config: Arc<Config>) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Registers the singleton main nest if it is not already present.
    pub async fn ensure_main_nest(&self) -> SongnestResult<()> {
        if self.store.hget(REGISTRY_KEY, MAIN_NEST).await?.is_some() {
            return Ok(());
        }
        let now = Utc::now();
        let meta = NestMeta {
            nest_id: MAIN_NEST.into(),
            code: MAIN_NEST.into(),
            name: "Home Nest".into(),
            slug: None,
            creator: "system".into(),
            is_main: true,
            created_at: now,
            last_activity: now,
            ttl_minutes: 0,
            seed_uri: None,
            genre_hint: None,
            member_count: None,
        };
        self.write_meta(&meta).await?;
        log::info!("[Registry] Registered main nest");
        Ok(())
    }

    /// Generates an unused join code, retrying on collision.
    pub async fn generate_code(&self) -> SongnestResult<String> {
        let mut attempts = 0;
        loop {
            let code: String = {
                let mut rng = rand::thread_rng();
                (0..CODE_LENGTH)
                    .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                    .collect()
            };
            if !self.store.exists(&code_key(&code)).await? {
                return Ok(code);
            }
            attempts += 1;
            if attempts >= 100 {
                return Err(SongnestError::Internal(
                    "could not generate a unique nest code".into(),
                ));
            }
        }
    }

    /// Picks an unused name from the pool, appending a numeric suffix when
    /// every base name is taken.
    async fn pick_name(&self) -> SongnestResult<String> {
        let all = self.store.hgetall(REGISTRY_KEY).await?;
        let used: std::collections::HashSet<String> = all
            .values()
            .filter_map(|raw| serde_json::from_str::<NestMeta>(raw).ok())
            .map(|meta| meta.name)
            .collect();
        let available: Vec<&str> = NEST_NAMES
            .iter()
            .copied()
            .filter(|n| !used.contains(*n))
            .collect();
        if !available.is_empty() {
            let mut rng = rand::thread_rng();
            return Ok(available[rng.gen_range(0..available.len())].to_string());
        }
        let base = {
            let mut rng = rand::thread_rng();
            NEST_NAMES[rng.gen_range(0..NEST_NAMES.len())]
        };
        let mut suffix = 2;
        while used.contains(&format!("{base}{suffix}")) {
            suffix += 1;
        }
        Ok(format!("{base}{suffix}"))
    }

    /// Creates a new nest and returns its metadata.
    ///
    /// A caller-supplied `seed_track` must be a `spotify:track:` URI; its
    /// primary artist's first genre becomes the nest's genre hint. Auto-named
    /// nests get their themed seed from the name pool instead.
    pub async fn create_nest(
        &self,
        creator: &str,
        name: Option<String>,
        seed_track: Option<String>,
    ) -> SongnestResult<NestMeta> {
        if let Some(seed) = seed_track.as_deref() {
            if !seed.starts_with("spotify:track:") {
                return Err(SongnestError::InvalidRequest(
                    "seed_track must be a spotify:track: URI".into(),
                ));
            }
        }

        let code = self.generate_code().await?;
        let nest_id = code.clone();
        let name = match name {
            Some(custom) if !custom.trim().is_empty() => custom.trim().to_string(),
            _ => self.pick_name().await?,
        };

        let now = Utc::now();
        let mut meta = NestMeta {
            nest_id: nest_id.clone(),
            code: code.clone(),
            name: name.clone(),
            slug: slugify(&name),
            creator: creator.to_string(),
            is_main: false,
            created_at: now,
            last_activity: now,
            ttl_minutes: self.config.nest_ttl_minutes,
            seed_uri: None,
            genre_hint: None,
            member_count: None,
        };

        if let Some(seed) = seed_track {
            let (seed_uri, genre_hint) = self.resolve_track_seed(&seed).await;
            meta.seed_uri = Some(seed_uri);
            meta.genre_hint = genre_hint;
        } else if let Some((uri, genre)) = theme_seed(&name) {
            meta.seed_uri = Some(uri.to_string());
            meta.genre_hint = Some(genre.to_string());
        }

        self.write_meta(&meta).await?;
        self.store.set(&code_key(&code), &nest_id).await?;
        if let Some(slug) = &meta.slug {
            self.store.set(&slug_key(slug), &nest_id).await?;
        }
        log::info!(
            "[Registry] Created nest {} ({}) for {}",
            nest_id,
            meta.name,
            creator
        );
        Ok(meta)
    }

    /// Resolves a seed track to `(uri, genre_hint)`, degrading to the bare
    /// URI when the catalog cannot help.
    async fn resolve_track_seed(&self, seed: &str) -> (String, Option<String>) {
        let genre = async {
            let track = self.catalog.track(seed).await.ok()?;
            let artist_id = track.primary_artist()?.id.clone();
            let artist = self.catalog.artist(&artist_id).await.ok()?;
            artist.genres.into_iter().next()
        }
        .await;
        if genre.is_none() {
            log::warn!("[Registry] Could not resolve genre for seed {}, storing URI only", seed);
        }
        (seed.to_string(), genre)
    }

    /// Looks up a nest by id, code, or slug, in that order.
    pub async fn get_nest(&self, key: &str) -> SongnestResult<Option<NestMeta>> {
        if let Some(meta) = self.read_meta(key).await? {
            return Ok(Some(meta));
        }
        if let Some(id) = self.store.get(&code_key(key)).await? {
            if let Some(meta) = self.read_meta(&id).await? {
                return Ok(Some(meta));
            }
        }
        if let Some(id) = self.store.get(&slug_key(key)).await? {
            if let Some(meta) = self.read_meta(&id).await? {
                return Ok(Some(meta));
            }
        }
        Ok(None)
    }

    /// All registered nests with their raw member counts attached.
    pub async fn list_nests(&self) -> SongnestResult<Vec<NestMeta>> {
        let all = self.store.hgetall(REGISTRY_KEY).await?;
        let mut nests = Vec::with_capacity(all.len());
        for (nest_id, raw) in all {
            let Ok(mut meta) = serde_json::from_str::<NestMeta>(&raw) else {
                log::warn!("[Registry] Invalid metadata for nest {}", nest_id);
                continue;
            };
            let members_key = crate::membership::members_key(&nest_id);
            meta.member_count = Some(self.store.scard(&members_key).await?);
            nests.push(meta);
        }
        nests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(nests)
    }

    /// Deletes a nest and its entire key namespace.
    ///
    /// Safe to call twice; the second call finds nothing left to remove.
    pub async fn delete_nest(&self, nest_id: &str) -> SongnestResult<()> {
        if nest_id == MAIN_NEST {
            log::warn!("[Registry] Refusing to delete the main nest");
            return Err(SongnestError::InvalidRequest(
                "the main nest cannot be deleted".into(),
            ));
        }

        self.store
            .set_ex(
                &deleting_key(nest_id),
                "1",
                std::time::Duration::from_secs(DELETING_TTL_SECS),
            )
            .await?;

        if let Some(meta) = self.read_meta(nest_id).await? {
            self.store.del(&code_key(&meta.code)).await?;
            if let Some(slug) = &meta.slug {
                self.store.del(&slug_key(slug)).await?;
            }
        }
        self.store.hdel(REGISTRY_KEY, nest_id).await?;

        let keys = self.store.scan_prefix(&nest_prefix(nest_id)).await?;
        if !keys.is_empty() {
            self.store.unlink(&keys).await?;
        }

        self.store.del(&deleting_key(nest_id)).await?;
        log::info!("[Registry] Deleted nest {} ({} keys)", nest_id, keys.len());
        Ok(())
    }

    /// Bumps a nest's `last_activity` to now.
    pub async fn touch(&self, nest_id: &str) -> SongnestResult<()> {
        if let Some(mut meta) = self.read_meta(nest_id).await? {
            meta.last_activity = Utc::now();
            self.write_meta(&meta).await?;
        }
        Ok(())
    }

    /// Renames a nest, re-pointing its slug lookup.
    pub async fn rename(&self, nest_id: &str, new_name: &str) -> SongnestResult<NestMeta> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(SongnestError::InvalidRequest("name cannot be empty".into()));
        }
        let Some(mut meta) = self.read_meta(nest_id).await? else {
            return Err(SongnestError::NotFound(format!("nest {nest_id}")));
        };
        if let Some(old_slug) = &meta.slug {
            self.store.del(&slug_key(old_slug)).await?;
        }
        meta.name = new_name.to_string();
        meta.slug = slugify(new_name);
        meta.last_activity = Utc::now();
        if let Some(slug) = &meta.slug {
            self.store.set(&slug_key(slug), nest_id).await?;
        }
        self.write_meta(&meta).await?;
        Ok(meta)
    }

    async fn read_meta(&self, nest_id: &str) -> SongnestResult<Option<NestMeta>> {
        let raw = self.store.hget(REGISTRY_KEY, nest_id).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    async fn write_meta(&self, meta: &NestMeta) -> SongnestResult<()> {
        let json = serde_json::to_string(meta)
            .map_err(|e| SongnestError::Internal(format!("cannot serialize nest meta: {e}")))?;
        self.store.hset(REGISTRY_KEY, &meta.nest_id, &json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(is_main: bool, ttl_minutes: i64, last_activity: DateTime<Utc>) -> NestMeta {
        NestMeta {
            nest_id: "XK42P".into(),
            code: "XK42P".into(),
            name: "FunkNest".into(),
            slug: Some("funknest".into()),
            creator: "alice@x".into(),
            is_main,
            created_at: last_activity,
            last_activity,
            ttl_minutes,
            seed_uri: None,
            genre_hint: None,
            member_count: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn code_alphabet_excludes_ambiguous_glyphs() {
        assert_eq!(CODE_ALPHABET.len(), 31);
        for bad in [b'0', b'O', b'1', b'I', b'L'] {
            assert!(!CODE_ALPHABET.contains(&bad), "{} present", bad as char);
        }
    }

    #[test]
    fn slugify_handles_spaces_and_specials() {
        assert_eq!(slugify("Friday Vibes"), Some("friday-vibes".into()));
        assert_eq!(slugify("  mixed UP -- name!  "), Some("mixed-up-name".into()));
        assert_eq!(slugify("FunkNest"), Some("funknest".into()));
    }

    #[test]
    fn slugify_rejects_symbol_only_names() {
        assert_eq!(slugify("!!!"), None);
        assert_eq!(slugify(""), None);
    }

    #[test]
    fn theme_seed_matches_pool_and_overflow_names() {
        let (uri, genre) = theme_seed("BassNest").unwrap();
        assert!(uri.starts_with("spotify:track:"));
        assert_eq!(genre, "bass music");
        assert_eq!(theme_seed("BassNest2"), theme_seed("BassNest"));
        assert_eq!(theme_seed("Friday Vibes"), None);
    }

    #[test]
    fn main_nest_is_never_reaped() {
        let m = meta(true, 1, at(0));
        assert!(!should_delete_nest(&m, 0, 0, at(10_000)));
    }

    #[test]
    fn active_members_block_reaping() {
        let m = meta(false, 1, at(0));
        assert!(!should_delete_nest(&m, 1, 0, at(10_000)));
    }

    #[test]
    fn queued_tracks_block_reaping() {
        let m = meta(false, 1, at(0));
        assert!(!should_delete_nest(&m, 0, 3, at(10_000)));
    }

    #[test]
    fn zero_ttl_disables_reaping() {
        let m = meta(false, 0, at(0));
        assert!(!should_delete_nest(&m, 0, 0, at(10_000)));
    }

    #[test]
    fn idle_nest_is_reaped_after_ttl() {
        let m = meta(false, 1, at(0));
        assert!(!should_delete_nest(&m, 0, 0, at(59)));
        assert!(should_delete_nest(&m, 0, 0, at(61)));
    }

    #[test]
    fn meta_json_round_trips() {
        let m = meta(false, 5, at(1_700_000_000));
        let json = serde_json::to_string(&m).unwrap();
        let restored: NestMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.nest_id, m.nest_id);
        assert_eq!(restored.last_activity, m.last_activity);
        assert_eq!(restored.ttl_minutes, 5);
        assert!(!restored.is_main);
    }

    #[test]
    fn meta_tolerates_missing_optional_fields() {
        let json = r#"{
            "nest_id": "main", "code": "main", "name": "Home Nest",
            "creator": "system", "is_main": true,
            "created_at": "2026-08-01T00:00:00Z",
            "last_activity": "2026-08-01T00:00:00Z"
        }"#;
        let restored: NestMeta = serde_json::from_str(json).unwrap();
        assert!(restored.is_main);
        assert_eq!(restored.ttl_minutes, 0);
        assert!(restored.seed_uri.is_none());
    }
}
