//! Priority queue engine with fair scheduling (C4).
//!
//! The queue is a sorted set of entry ids ordered by a float score; rank is
//! strictly score order with ties broken by insertion order (ids are minted
//! from a monotonic counter). Detail hashes outlive queue membership so
//! late readers can still resolve recently played tracks.
//!
//! Scoring implements the fair-share interleave: each contributor's k-th
//! track lands no later than any other contributor's (k+1)-th. Auto-fill
//! entries always append at the tail so human additions feel like they jump
//! ahead of the bot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::catalog::CatalogClient;
use crate::context::NestContext;
use crate::error::{SongnestError, SongnestResult};
use crate::events::BusMessage;
use crate::model::{
    Comment, Jam, QueueCard, QueueEntry, QueuedEntry, DEFAULT_BACKGROUND, DEFAULT_FOREGROUND,
    SRC_SPOTIFY,
};
use crate::recommend::Recommender;

/// Sorted set holding the queue order (entry id -> score).
pub const PRIORITY_QUEUE: &str = "MISC|priority-queue";

/// Monotonic per-nest entry id counter.
const PLAY_COUNTER: &str = "MISC|playlist-plays";

/// Counter driving periodic full-queue renumbering.
const VOTE_OPS: &str = "MISC|vote-ops";

/// Detail hashes, vote sets, jams, and comments all expire after a day.
const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Score distance used when a vote pushes an entry past either end.
const END_JUMP: f64 = 120.0;

pub(crate) fn entry_key(id: u64) -> String {
    format!("QUEUE|{id}")
}

pub(crate) fn vote_key(id: u64) -> String {
    format!("QUEUE|VOTE|{id}")
}

pub(crate) fn jam_key(id: u64) -> String {
    format!("QUEUEJAM|{id}")
}

fn comments_key(id: u64) -> String {
    format!("COMMENTS|{id}")
}

pub(crate) fn freehorn_key(identity: &str) -> String {
    format!("FREEHORN_{identity}")
}

/// Loads an entry's detail hash; `None` when expired or never written.
pub(crate) async fn load_entry(ctx: &NestContext, id: u64) -> SongnestResult<Option<QueueEntry>> {
    let fields = ctx.store.hgetall(&ctx.key(&entry_key(id))).await?;
    Ok(QueueEntry::from_fields(&fields))
}

/// The id currently pointed at by `MISC|now-playing`, if any.
pub(crate) async fn now_playing_id(ctx: &NestContext) -> SongnestResult<Option<u64>> {
    Ok(ctx
        .store
        .get(&ctx.key("MISC|now-playing"))
        .await?
        .and_then(|v| v.parse().ok()))
}

/// The entry currently playing, if its detail hash is still alive.
pub(crate) async fn now_playing_entry(ctx: &NestContext) -> SongnestResult<Option<QueueEntry>> {
    match now_playing_id(ctx).await? {
        Some(id) => load_entry(ctx, id).await,
        None => Ok(None),
    }
}

/// Options controlling how a track enters the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Added to the computed score (lower sorts earlier).
    pub penalty: f64,
    /// Pins the entry to the head with score 0.
    pub force_first: bool,
    /// Marks the entry as synthesized by the recommendation engine.
    pub auto: bool,
}

impl AddOptions {
    /// Options for an auto-fill contribution.
    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }
}

/// Per-nest queue operations.
pub struct QueueEngine {
    ctx: NestContext,
    catalog: Arc<dyn CatalogClient>,
    recommend: Arc<Recommender>,
}

impl QueueEngine {
    pub fn new(
        ctx: NestContext,
        catalog: Arc<dyn CatalogClient>,
        recommend: Arc<Recommender>,
    ) -> Self {
        Self {
            ctx,
            catalog,
            recommend,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Adding
    // ─────────────────────────────────────────────────────────────────────

    /// Resolves a catalog URI (track or episode) and queues it.
    ///
    /// Human track contributions also write the URI into the filter list so
    /// the recommendation engine won't re-suggest something just played,
    /// and reset the auto-fill streak.
    pub async fn add_track(
        &self,
        user: &str,
        uri: &str,
        opts: AddOptions,
    ) -> SongnestResult<u64> {
        log::debug!("[Queue] Adding {} for {} (nest {})", uri, user, self.ctx.nest_id);
        let is_episode = uri.split(':').nth(1) == Some("episode");
        let entry = if is_episode {
            let episode = self.catalog.episode(uri).await?;
            QueueEntry {
                id: 0,
                trackid: episode.uri,
                src: SRC_SPOTIFY.into(),
                title: episode.title,
                artist: episode.show_name,
                duration: episode.duration_secs,
                img: episode.img,
                big_img: episode.big_img,
                user: String::new(),
                vote: 0,
                auto: opts.auto,
                background_color: DEFAULT_BACKGROUND.into(),
                foreground_color: DEFAULT_FOREGROUND.into(),
            }
        } else {
            let track = self.catalog.track(uri).await?;
            QueueEntry {
                id: 0,
                trackid: track.uri.clone(),
                src: SRC_SPOTIFY.into(),
                title: track.title.clone(),
                artist: track.artist_line(),
                duration: track.duration_secs,
                img: track.img.clone(),
                big_img: track.big_img.clone(),
                user: String::new(),
                vote: 0,
                auto: opts.auto,
                background_color: DEFAULT_BACKGROUND.into(),
                foreground_color: DEFAULT_FOREGROUND.into(),
            }
        };

        let filter_target = entry.trackid.clone();
        let id = self.add_entry(user, entry, opts).await?;

        if !opts.auto && !is_episode {
            self.recommend.filter_uri(&filter_target).await?;
            self.recommend.clear_streak().await?;
        }
        Ok(id)
    }

    /// Core add path shared by every adder.
    async fn add_entry(
        &self,
        user: &str,
        mut entry: QueueEntry,
        opts: AddOptions,
    ) -> SongnestResult<u64> {
        self.ctx.check_active().await?;

        let queued = self.entries().await?;
        if !opts.auto && !self.ctx.is_main() {
            let cap = self.ctx.config.max_queue_depth;
            let human_len = queued.iter().filter(|q| !q.entry.auto).count() as u64;
            if human_len >= cap {
                return Err(SongnestError::QueueFull { cap });
            }
        }

        let id = self.ctx.store.incr(&self.ctx.key(PLAY_COUNTER)).await? as u64;
        entry.id = id;
        entry.user = user.to_lowercase();

        let key = self.ctx.key(&entry_key(id));
        self.ctx.store.hset_all(&key, &entry.to_fields()).await?;
        self.ctx.store.expire(&key, ENTRY_TTL).await?;

        let vkey = self.ctx.key(&vote_key(id));
        self.ctx.store.sadd(&vkey, &entry.user).await?;
        self.ctx.store.expire(&vkey, ENTRY_TTL).await?;

        let ranked: Vec<(String, f64)> = queued
            .iter()
            .map(|q| (q.entry.user.clone(), q.score))
            .collect();
        let score =
            interleave_score(&ranked, &entry.user, opts.auto, opts.force_first) + opts.penalty;
        self.ctx
            .store
            .zadd(&self.ctx.key(PRIORITY_QUEUE), &id.to_string(), score)
            .await?;
        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        log::info!(
            "[Queue] Queued #{} {} ({}) at score {:.3}",
            id,
            entry.title,
            entry.user,
            score
        );
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────

    /// Hydrated queue entries in rank order (no preview card).
    pub async fn entries(&self) -> SongnestResult<Vec<QueuedEntry>> {
        let ranked = self
            .ctx
            .store
            .zrange_withscores(&self.ctx.key(PRIORITY_QUEUE), 0, -1)
            .await?;
        let mut out = Vec::with_capacity(ranked.len());
        for (raw_id, score) in ranked {
            let Ok(id) = raw_id.parse::<u64>() else {
                continue;
            };
            if let Some(entry) = load_entry(&self.ctx, id).await? {
                out.push(QueuedEntry {
                    entry,
                    score,
                    jam: self.jams(id).await?,
                    comments: self.comments(id).await?,
                });
            }
        }
        Ok(out)
    }

    /// The queue as clients see it: entries plus the recommendation
    /// engine's preview card as a synthetic tail.
    pub async fn cards(&self) -> SongnestResult<Vec<QueueCard>> {
        let mut cards: Vec<QueueCard> = self
            .entries()
            .await?
            .into_iter()
            .map(QueueCard::Entry)
            .collect();
        cards.push(QueueCard::Preview(self.recommend.preview_card().await));
        Ok(cards)
    }

    /// One hydrated entry by id, if it is currently in the queue.
    pub async fn get(&self, id: u64) -> SongnestResult<Option<QueuedEntry>> {
        let score = self
            .ctx
            .store
            .zscore(&self.ctx.key(PRIORITY_QUEUE), &id.to_string())
            .await?;
        let Some(score) = score else {
            return Ok(None);
        };
        let Some(entry) = load_entry(&self.ctx, id).await? else {
            return Ok(None);
        };
        Ok(Some(QueuedEntry {
            entry,
            score,
            jam: self.jams(id).await?,
            comments: self.comments(id).await?,
        }))
    }

    /// Queue length (including auto-fill entries).
    pub async fn len(&self) -> SongnestResult<u64> {
        Ok(self.ctx.store.zcard(&self.ctx.key(PRIORITY_QUEUE)).await?)
    }

    pub async fn is_empty(&self) -> SongnestResult<bool> {
        Ok(self.len().await? == 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Voting
    // ─────────────────────────────────────────────────────────────────────

    /// Votes an entry up or down, re-ranking it past one neighbor.
    ///
    /// Double votes are rejected unless the voter is downvoting their own
    /// contribution or is on the privileged list. Every vote updates the
    /// entry's reactive colors; a self-downvote reorders without changing
    /// the count.
    pub async fn vote(&self, user: &str, id: u64, up: bool) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        let user = user.to_lowercase();
        let Some(entry) = load_entry(&self.ctx, id).await? else {
            return Err(SongnestError::NotFound(format!("queue entry {id}")));
        };
        let self_down = entry.user == user && !up;
        let vkey = self.ctx.key(&vote_key(id));
        if !self_down
            && self.ctx.store.sismember(&vkey, &user).await?
            && !self.ctx.config.is_privileged(&user)
        {
            log::info!("[Queue] Rejecting duplicate vote by {} on #{}", user, id);
            return Ok(());
        }
        self.ctx.store.sadd(&vkey, &user).await?;

        let pq = self.ctx.key(PRIORITY_QUEUE);
        let member = id.to_string();
        let Some(rank) = self.ctx.store.zrank(&pq, &member).await? else {
            return Ok(());
        };
        let len = self.ctx.store.zcard(&pq).await? as i64;
        let current = self
            .ctx
            .store
            .zscore(&pq, &member)
            .await?
            .unwrap_or_default();

        if let Some(slot) = neighbor_slot(rank, len, up) {
            let neighbors = self
                .ctx
                .store
                .zrange_withscores(&pq, slot.start, slot.stop)
                .await?;
            let scores: Vec<f64> = neighbors.iter().map(|(_, s)| *s).collect();
            if let Some(new_score) = midpoint_score(&scores, slot.before_first) {
                self.ctx.store.zincr(&pq, &member, new_score - current).await?;
            }
        }

        let ekey = self.ctx.key(&entry_key(id));
        let votes = if up {
            self.ctx.store.hincr(&ekey, "vote", 1).await?
        } else if !self_down {
            self.ctx.store.hincr(&ekey, "vote", -1).await?
        } else {
            entry.vote
        };
        let (bg, fg) = vote_colors(votes);
        self.ctx.store.hset(&ekey, "background_color", &bg).await?;
        self.ctx.store.hset(&ekey, "foreground_color", &fg).await?;

        // Midpoint halving converges on collisions over long runs, so the
        // whole queue is renumbered every N vote operations.
        let ops = self.ctx.store.incr(&self.ctx.key(VOTE_OPS)).await?;
        let interval = self.ctx.config.vote_rescore_interval;
        if interval > 0 && ops % interval == 0 {
            self.renumber().await?;
        }

        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        Ok(())
    }

    /// Rewrites every score as 1.0, 2.0, 3.0, ... preserving rank order.
    async fn renumber(&self) -> SongnestResult<()> {
        let pq = self.ctx.key(PRIORITY_QUEUE);
        let ranked = self.ctx.store.zrange(&pq, 0, -1).await?;
        for (index, member) in ranked.iter().enumerate() {
            self.ctx.store.zadd(&pq, member, (index + 1) as f64).await?;
        }
        log::debug!("[Queue] Renumbered {} entries", ranked.len());
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────

    /// Removes an entry from the queue. The detail hash is left to expire
    /// so late readers still see it.
    pub async fn kill(&self, id: u64) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.ctx
            .store
            .zrem(&self.ctx.key(PRIORITY_QUEUE), &id.to_string())
            .await?;
        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        Ok(())
    }

    /// Empties the queue, leaving detail hashes in place.
    pub async fn clear(&self) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.ctx
            .store
            .zremrangebyrank(&self.ctx.key(PRIORITY_QUEUE), 0, -1)
            .await?;
        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Jams and comments
    // ─────────────────────────────────────────────────────────────────────

    /// Toggles the caller's jam on an entry.
    ///
    /// Crossing the free-airhorn threshold grants the now-playing
    /// contributor a free horn.
    pub async fn jam(&self, user: &str, id: u64) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        let user = user.to_lowercase();
        let jkey = self.ctx.key(&jam_key(id));
        if self.ctx.store.zscore(&jkey, &user).await?.is_some() {
            self.ctx.store.zrem(&jkey, &user).await?;
            log::info!("[Queue] Jam removed by {} on #{}", user, id);
        } else {
            self.ctx
                .store
                .zadd(&jkey, &user, Utc::now().timestamp() as f64)
                .await?;
            log::info!("[Queue] Jammed by {} on #{}", user, id);
        }
        self.ctx.store.expire(&jkey, ENTRY_TTL).await?;

        let in_queue = self
            .ctx
            .store
            .zrank(&self.ctx.key(PRIORITY_QUEUE), &id.to_string())
            .await?
            .is_some();
        if in_queue {
            self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        } else {
            self.ctx.publish(&BusMessage::NowPlayingUpdate).await?;
        }

        let jam_count = self.ctx.store.zcard(&jkey).await?;
        if jam_count >= self.ctx.config.free_airhorn_jams {
            if let Some(playing) = now_playing_entry(&self.ctx).await? {
                self.ctx
                    .store
                    .sadd(&self.ctx.key(&freehorn_key(&playing.user)), &id.to_string())
                    .await?;
                self.ctx.publish(&BusMessage::FreeHornUpdate).await?;
            }
        }
        Ok(())
    }

    /// Jams on an entry, oldest first.
    pub async fn jams(&self, id: u64) -> SongnestResult<Vec<Jam>> {
        let raw = self
            .ctx
            .store
            .zrange_withscores(&self.ctx.key(&jam_key(id)), 0, -1)
            .await?;
        Ok(raw
            .into_iter()
            .map(|(user, ts)| Jam {
                user,
                time: timestamp_iso(ts as i64),
            })
            .collect())
    }

    /// Appends a comment to an entry.
    pub async fn comment(&self, user: &str, id: u64, text: &str) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        let ckey = self.ctx.key(&comments_key(id));
        let member = format!("{}||{}", user.to_lowercase(), text);
        self.ctx
            .store
            .zadd(&ckey, &member, Utc::now().timestamp() as f64)
            .await?;
        self.ctx.store.expire(&ckey, ENTRY_TTL).await?;
        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        Ok(())
    }

    /// Comments on an entry, oldest first.
    pub async fn comments(&self, id: u64) -> SongnestResult<Vec<Comment>> {
        let raw = self
            .ctx
            .store
            .zrange_withscores(&self.ctx.key(&comments_key(id)), 0, -1)
            .await?;
        Ok(raw
            .into_iter()
            .map(|(member, ts)| {
                let (user, body) = member.split_once("||").unwrap_or((member.as_str(), ""));
                Comment {
                    user: user.to_string(),
                    body: body.to_string(),
                    time: ts.max(0.0) as u64,
                }
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Preview handlers and backfill
    // ─────────────────────────────────────────────────────────────────────

    /// Queues the previewed fill track as a normal entry ("queue this").
    ///
    /// The original contributor (for throwbacks) jams the fresh entry so
    /// the attribution survives.
    pub async fn queue_preview(&self, user: &str, trackid: &str) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        let Some(pick) = self.recommend.consume_preview_matching(trackid).await? else {
            log::warn!("[Queue] Preview mismatch for {}, ignoring", trackid);
            return Ok(());
        };
        let id = self.add_track(user, trackid, AddOptions::default()).await?;
        self.jam(&pick.user, id).await?;
        Ok(())
    }

    /// Filters the previewed fill track and rotates to the next ("skip
    /// this"). The URI stays blocked until the filter TTL expires.
    pub async fn filter_preview(&self, user: &str, trackid: &str) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.recommend.consume_preview_matching(trackid).await?;
        self.recommend.filter_uri(trackid).await?;
        self.ctx.publish(&BusMessage::PlaylistUpdate).await?;
        log::info!("[Queue] {} filtered preview {}", user, trackid);
        Ok(())
    }

    /// Tops the queue up with auto-fill tracks so there is always something
    /// on deck. Respects the streak limit; side nests keep a single-track
    /// buffer to limit catalog pressure.
    pub async fn ensure_depth(&self) -> SongnestResult<()> {
        if !self.ctx.config.use_autofill {
            return Ok(());
        }
        let min_depth = if self.ctx.is_main() {
            self.ctx.config.min_queue_depth
        } else {
            1
        };
        let size = self.len().await?;
        if size >= min_depth {
            return Ok(());
        }
        let needed = min_depth - size;
        log::info!(
            "[Queue] Depth {} < {}, backfilling {} (nest {})",
            size,
            min_depth,
            needed,
            self.ctx.nest_id
        );
        let limit_secs = self.ctx.config.max_autofill_minutes * 60;
        for _ in 0..needed {
            if self.recommend.streak_seconds().await? > limit_secs {
                log::info!("[Queue] Auto-fill streak limit reached, stopping backfill");
                break;
            }
            let Some(pick) = self.recommend.consume_fill().await? else {
                break;
            };
            if let Err(e) = self
                .add_track(&pick.user, &pick.uri, AddOptions::auto())
                .await
            {
                log::warn!("[Queue] Backfill add failed for {}: {}", pick.uri, e);
                break;
            }
        }
        Ok(())
    }
}

fn timestamp_iso(secs: i64) -> String {
    chrono::DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────────────────────────

/// Computes the insertion score for a new entry.
///
/// `queued` is the current queue as (contributor, score) pairs in rank
/// order. Humans interleave fairly: the new entry becomes its contributor's
/// N-th track and is placed just before the first position where any other
/// contributor already has N+1 tracks. Auto-fill entries always append at
/// the tail.
pub fn interleave_score(
    queued: &[(String, f64)],
    user: &str,
    auto: bool,
    force_first: bool,
) -> f64 {
    if force_first {
        return 0.0;
    }
    let Some(last) = queued.last() else {
        return 1.0;
    };
    if auto {
        return last.1 + 1.0;
    }

    // Including the entry being added, so start from 1.
    let own_count = 1 + queued.iter().filter(|(u, _)| u == user).count();

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (index, (queuer, score)) in queued.iter().enumerate() {
        let count = seen.entry(queuer.as_str()).or_insert(0);
        *count += 1;
        // This position holds someone's (N+1)-th track while we are adding
        // our N-th: slot in just before it. Cannot trigger at index 0.
        if *count == own_count + 1 {
            let prev = queued[index - 1].1;
            return (prev + score) / 2.0;
        }
    }
    last.1 + 1.0
}

/// The neighbor window consulted when a vote moves an entry.
struct NeighborSlot {
    start: isize,
    stop: isize,
    before_first: bool,
}

/// Determines which neighbors bound the entry's new position, or `None`
/// when the vote cannot move it any further in that direction.
fn neighbor_slot(rank: i64, len: i64, up: bool) -> Option<NeighborSlot> {
    if up {
        match rank {
            0 => None,
            1 => Some(NeighborSlot {
                start: 0,
                stop: 0,
                before_first: true,
            }),
            _ => Some(NeighborSlot {
                start: (rank - 2) as isize,
                stop: (rank - 1) as isize,
                before_first: false,
            }),
        }
    } else {
        if rank >= len - 1 {
            return None;
        }
        if rank + 1 == len - 1 {
            return Some(NeighborSlot {
                start: (len - 1) as isize,
                stop: (len - 1) as isize,
                before_first: false,
            });
        }
        Some(NeighborSlot {
            start: (rank + 1) as isize,
            stop: (rank + 2) as isize,
            before_first: false,
        })
    }
}

/// New score from the neighbor scores: the midpoint between them, or a
/// fixed jump past the end when only one neighbor exists.
fn midpoint_score(scores: &[f64], before_first: bool) -> Option<f64> {
    match scores {
        [] => None,
        [only] => Some(if before_first {
            only - END_JUMP
        } else {
            only + END_JUMP
        }),
        [low, high, ..] => Some((low + high) / 2.0),
    }
}

/// Reactive colors from the vote count.
///
/// Positive votes warm the background toward a lighter grey, negative votes
/// darken it toward black, both saturating at five. The foreground flips to
/// dark text past a luminance threshold.
pub fn vote_colors(votes: i64) -> (String, String) {
    const STEPS: i64 = 5;
    const NORM: [i64; 3] = [34, 34, 34];
    const HOT: [i64; 3] = [68, 68, 68];
    const COLD: [i64; 3] = [0, 0, 0];

    let (other, base) = if votes > 0 { (HOT, NORM) } else { (COLD, NORM) };
    let level = votes.abs().min(STEPS);

    let mut background = String::with_capacity(6);
    let mut sum = 0;
    for channel in 0..3 {
        let value = (level * other[channel] + (STEPS - level) * base[channel]) / STEPS;
        sum += value;
        background.push_str(&format!("{value:02x}"));
    }
    let foreground = if sum > 130 * 3 { "0f0f0f" } else { "f0f0ff" };
    (background, foreground.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(u, s)| (u.to_string(), *s)).collect()
    }

    #[test]
    fn first_entry_scores_one() {
        assert_eq!(interleave_score(&[], "alice@x", false, false), 1.0);
    }

    #[test]
    fn force_first_pins_to_head() {
        let queued = q(&[("alice@x", 1.0), ("bob@x", 2.0)]);
        assert_eq!(interleave_score(&queued, "carol@x", false, true), 0.0);
    }

    #[test]
    fn auto_fill_always_appends() {
        let queued = q(&[("alice@x", 1.0), ("bob@x", 5.0)]);
        assert_eq!(interleave_score(&queued, "fillbot@x", true, false), 6.0);
    }

    #[test]
    fn new_contributor_slots_before_second_tracks() {
        // alice has two queued; bob's first track goes before alice's second.
        let queued = q(&[("alice@x", 1.0), ("alice@x", 2.0)]);
        let score = interleave_score(&queued, "bob@x", false, false);
        assert!(score > 1.0 && score < 2.0, "got {score}");
    }

    #[test]
    fn fair_share_interleave_scenario() {
        // alice adds A1 A2 A3, bob B1 B2, carol C1.
        // Expected rank order: A1 B1 C1 A2 B2 A3.
        let mut queued: Vec<(String, f64)> = Vec::new();
        let mut order: Vec<(&str, &str)> = Vec::new();
        let adds = [
            ("alice@x", "A1"),
            ("alice@x", "A2"),
            ("alice@x", "A3"),
            ("bob@x", "B1"),
            ("bob@x", "B2"),
            ("carol@x", "C1"),
        ];
        for (user, label) in adds {
            let score = interleave_score(&queued, user, false, false);
            queued.push((user.to_string(), score));
            order.push((label, user));
            // keep both lists in rank order, stable on ties by arrival
            let mut indexed: Vec<usize> = (0..queued.len()).collect();
            indexed.sort_by(|&a, &b| queued[a].1.partial_cmp(&queued[b].1).unwrap());
            queued = indexed.iter().map(|&i| queued[i].clone()).collect();
            order = indexed.iter().map(|&i| order[i]).collect();
        }
        let labels: Vec<&str> = order.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec!["A1", "B1", "C1", "A2", "B2", "A3"]);
    }

    #[test]
    fn every_kth_track_precedes_others_k_plus_first() {
        // Fair-share invariant over a longer mixed sequence.
        let mut queued: Vec<(String, f64)> = Vec::new();
        let adds = [
            "a@x", "a@x", "b@x", "c@x", "a@x", "b@x", "c@x", "c@x", "b@x", "a@x",
        ];
        for user in adds {
            let score = interleave_score(&queued, user, false, false);
            queued.push((user.to_string(), score));
            queued.sort_by(|l, r| l.1.partial_cmp(&r.1).unwrap());
        }
        // Every contributor's k-th entry must rank no later than any other
        // contributor's (k+1)-th.
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut positions: HashMap<(String, usize), usize> = HashMap::new();
        for (pos, (user, _)) in queued.iter().enumerate() {
            let k = counts.entry(user.clone()).or_insert(0);
            *k += 1;
            positions.insert((user.clone(), *k), pos);
        }
        for ((user, k), &pos) in &positions {
            for ((other, k2), &pos2) in &positions {
                if user != other && *k2 == k + 1 {
                    assert!(
                        pos < pos2,
                        "{user}'s #{k} at {pos} ranks after {other}'s #{k2} at {pos2}"
                    );
                }
            }
        }
    }

    #[test]
    fn upvote_at_head_stays_put() {
        assert!(neighbor_slot(0, 5, true).is_none());
    }

    #[test]
    fn upvote_at_rank_one_jumps_before_first() {
        let slot = neighbor_slot(1, 5, true).unwrap();
        assert!(slot.before_first);
        assert_eq!(midpoint_score(&[10.0], true), Some(10.0 - END_JUMP));
    }

    #[test]
    fn upvote_midpoints_between_neighbors() {
        let slot = neighbor_slot(3, 5, true).unwrap();
        assert_eq!((slot.start, slot.stop), (1, 2));
        assert_eq!(midpoint_score(&[2.0, 3.0], false), Some(2.5));
    }

    #[test]
    fn downvote_at_tail_stays_put() {
        assert!(neighbor_slot(4, 5, false).is_none());
    }

    #[test]
    fn downvote_to_last_jumps_past_end() {
        let slot = neighbor_slot(3, 5, false).unwrap();
        assert_eq!((slot.start, slot.stop), (4, 4));
        assert_eq!(midpoint_score(&[9.0], false), Some(9.0 + END_JUMP));
    }

    #[test]
    fn neutral_vote_color_is_default_grey() {
        let (bg, fg) = vote_colors(0);
        assert_eq!(bg, "222222");
        assert_eq!(fg, "f0f0ff");
    }

    #[test]
    fn upvotes_saturate_at_five() {
        assert_eq!(vote_colors(5).0, "444444");
        assert_eq!(vote_colors(50).0, "444444");
    }

    #[test]
    fn downvotes_darken_to_black() {
        assert_eq!(vote_colors(-5).0, "000000");
        let (bg_partial, _) = vote_colors(-2);
        assert_ne!(bg_partial, "000000");
        assert_ne!(bg_partial, "222222");
    }
}
