//! Per-nest playhead engine (C5).
//!
//! Each nest has exactly one "master player" at a time, elected via a
//! short-lived lease key in the store. The winner advances a virtual clock
//! in one-second ticks, publishes position updates, pops the next entry
//! when the current one finishes, and asks the recommendation engine for
//! fill tracks when the queue runs dry.
//!
//! The lease TTL is deliberately aggressive (5 s, 10 s while paused): a
//! worker that crashes or hangs loses the nest within that window and a
//! peer takes over. Clock skew can let two workers briefly believe they
//! hold the lease; the single-writer `current-done` key bounds any double
//! advance to one tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::context::NestContext;
use crate::error::SongnestResult;
use crate::events::BusMessage;
use crate::history::PlayHistory;
use crate::horns::Airhorns;
use crate::model::{NowPlaying, PlayRecord, QueueEntry, SRC_SPOTIFY};
use crate::queue::{entry_key, load_entry, now_playing_id, vote_key, QueueEngine, PRIORITY_QUEUE};
use crate::recommend::Recommender;

const LEASE_KEY: &str = "MISC|master-player";
const CLOCK_KEY: &str = "MISC|player-now";
const CURRENT_DONE_KEY: &str = "MISC|current-done";
const STARTED_ON_KEY: &str = "MISC|started-on";
const PAUSED_KEY: &str = "MISC|paused";
const FORCE_JUMP_KEY: &str = "MISC|force-jump";
const NOW_PLAYING_KEY: &str = "MISC|now-playing";
const NOW_PLAYING_DONE_KEY: &str = "MISC|now-playing-done";
const LAST_PLAYED_KEY: &str = "MISC|last-played";
const VOLUME_KEY: &str = "MISC|volume";

const LEASE_TTL: Duration = Duration::from_secs(5);
/// While paused the loop only touches the store once a second, so the
/// lease gets a little more slack.
const PAUSED_LEASE_TTL: Duration = Duration::from_secs(10);

/// The stored clock is refreshed with a long TTL so an abandoned nest
/// eventually falls back to wall time.
const CLOCK_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Entries shorter than this are skipped outright.
const MIN_PLAYABLE_SECS: u32 = 5;

/// Detail hashes of entries that started playing outlive the queue by 3 h.
const PLAYED_ENTRY_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// The now-playing pointer itself lives at most 2 h.
const NOW_PLAYING_TTL: Duration = Duration::from_secs(2 * 60 * 60);

const DEFAULT_VOLUME: u8 = 95;

/// Reads the virtual clock, falling back to wall time when absent.
pub(crate) async fn player_now(ctx: &NestContext) -> SongnestResult<DateTime<Utc>> {
    let raw = ctx.store.get(&ctx.key(CLOCK_KEY)).await?;
    if let Some(raw) = raw {
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(t) => return Ok(t.with_timezone(&Utc)),
            Err(e) => log::error!("[Playhead] Unparsable virtual clock value: {}", e),
        }
    }
    Ok(Utc::now())
}

/// Waits, returning `true` if cancellation fired first.
async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Per-nest playhead: the master-player loop plus the player controls it
/// observes (pause, skip, volume).
pub struct Playhead {
    ctx: NestContext,
    queue: Arc<QueueEngine>,
    recommend: Arc<Recommender>,
    history: Arc<PlayHistory>,
    horns: Arc<Airhorns>,
    worker_id: String,
}

impl Playhead {
    pub fn new(
        ctx: NestContext,
        queue: Arc<QueueEngine>,
        recommend: Arc<Recommender>,
        history: Arc<PlayHistory>,
        horns: Arc<Airhorns>,
    ) -> Self {
        Self {
            ctx,
            queue,
            recommend,
            history,
            horns,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Master-player loop
    // ─────────────────────────────────────────────────────────────────────

    /// Runs the master-player loop until cancelled.
    ///
    /// Competes for the lease first; the loser retries every lease period.
    /// Any number of workers across any number of processes can call this
    /// safely for the same nest.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.acquire_lease().await {
                Ok(true) => {}
                Ok(false) => {
                    if sleep_or_cancelled(LEASE_TTL, &cancel).await {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    log::warn!("[Playhead] Lease check failed for {}: {}", self.ctx.nest_id, e);
                    if sleep_or_cancelled(LEASE_TTL, &cancel).await {
                        return;
                    }
                    continue;
                }
            }
            log::info!(
                "[Playhead] Worker {} leading nest {}",
                self.worker_id,
                self.ctx.nest_id
            );
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = self.tick(&cancel).await {
                    log::warn!("[Playhead] Tick failed for {}: {}", self.ctx.nest_id, e);
                    if sleep_or_cancelled(Duration::from_secs(1), &cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn acquire_lease(&self) -> SongnestResult<bool> {
        let key = self.ctx.key(LEASE_KEY);
        let acquired = self.ctx.store.set_nx(&key, &self.worker_id).await?;
        if acquired {
            self.ctx.store.expire(&key, LEASE_TTL).await?;
        }
        Ok(acquired)
    }

    async fn refresh_lease(&self, ttl: Duration) -> SongnestResult<()> {
        self.ctx.store.expire(&self.ctx.key(LEASE_KEY), ttl).await?;
        Ok(())
    }

    /// One pass of the outer loop: settle what is playing, then advance
    /// the virtual clock through it.
    async fn tick(&self, cancel: &CancellationToken) -> SongnestResult<()> {
        let playing = self.now_playing().await?;
        let stored_done = self.read_current_done().await?;
        let now = player_now(&self.ctx).await?;

        let (entry, target) = match (playing.entry, stored_done) {
            (Some(entry), Some(done)) if done > now => (entry, done),
            (previous, _) => {
                if let Some(finished) = previous {
                    self.log_finished(&finished).await;
                }
                match self.pop_next().await? {
                    None => {
                        // Empty queue: hand over to auto-fill, or idle once
                        // the streak limit is hit.
                        self.recommend.mark_streak_start().await?;
                        let limit_secs = self.ctx.config.max_autofill_minutes * 60;
                        if !self.ctx.config.use_autofill
                            || self.recommend.streak_seconds().await? > limit_secs
                        {
                            sleep_or_cancelled(Duration::from_millis(500), cancel).await;
                            return Ok(());
                        }
                        match self.recommend.consume_fill().await? {
                            Some(pick) => {
                                if let Err(e) = self
                                    .queue
                                    .add_track(
                                        &pick.user,
                                        &pick.uri,
                                        crate::queue::AddOptions::auto(),
                                    )
                                    .await
                                {
                                    log::warn!(
                                        "[Playhead] Could not queue fill track {}: {}",
                                        pick.uri,
                                        e
                                    );
                                }
                            }
                            None => {
                                sleep_or_cancelled(Duration::from_millis(500), cancel).await;
                            }
                        }
                        return Ok(());
                    }
                    Some(entry) => {
                        if entry.duration < MIN_PLAYABLE_SECS {
                            log::info!(
                                "[Playhead] Skipping too-short entry #{} ({}s)",
                                entry.id,
                                entry.duration
                            );
                            return Ok(());
                        }
                        let now = player_now(&self.ctx).await?;
                        let target = now
                            + chrono::Duration::seconds(entry.duration as i64)
                            + chrono::Duration::milliseconds(1000);
                        (entry, target)
                    }
                }
            }
        };

        // Keep something on deck while this entry plays.
        if let Err(e) = self.queue.ensure_depth().await {
            log::warn!("[Playhead] ensure_depth failed: {}", e);
        }

        self.write_current_done(target).await?;
        self.ctx
            .store
            .set(&self.ctx.key(STARTED_ON_KEY), &player_now(&self.ctx).await?.to_rfc3339())
            .await?;

        self.advance_through(&entry, target, cancel).await?;

        self.ctx.store.del(&self.ctx.key(CURRENT_DONE_KEY)).await?;
        self.ctx.store.del(&self.ctx.key(&vote_key(entry.id))).await?;
        self.ctx.store.del(&self.ctx.key(&entry_key(entry.id))).await?;
        Ok(())
    }

    /// Inner advance loop: moves the virtual clock one second at a time
    /// until the target, honoring pause and skip.
    async fn advance_through(
        &self,
        entry: &QueueEntry,
        target: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> SongnestResult<()> {
        let mut done = target;
        loop {
            let now = player_now(&self.ctx).await?;
            if now >= done {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            if self.is_paused().await? {
                log::info!("[Playhead] Paused at {}", now.to_rfc3339());
                while self.is_paused().await? {
                    if sleep_or_cancelled(Duration::from_secs(1), cancel).await {
                        return Ok(());
                    }
                    self.refresh_lease(PAUSED_LEASE_TTL).await?;
                }
                // The virtual clock did not advance while paused, so the
                // remaining time is still correct, but current-done must be
                // re-written: wall time passed and its TTL kept shrinking.
                let now = player_now(&self.ctx).await?;
                let remaining = (done - now).num_seconds().max(1);
                done = now
                    + chrono::Duration::seconds(remaining)
                    + chrono::Duration::milliseconds(500);
                self.write_current_done(done).await?;
                log::info!("[Playhead] Unpaused, {}s remaining", remaining);
            }

            self.refresh_lease(LEASE_TTL).await?;

            if self.ctx.store.exists(&self.ctx.key(FORCE_JUMP_KEY)).await? {
                self.ctx.store.del(&self.ctx.key(FORCE_JUMP_KEY)).await?;
                log::info!("[Playhead] Skip requested on {}", self.ctx.nest_id);
                return Ok(());
            }

            self.advance_clock(1).await?;
            if sleep_or_cancelled(Duration::from_secs(1), cancel).await {
                return Ok(());
            }

            let now = player_now(&self.ctx).await?;
            let remaining = (done - now).num_seconds();
            let elapsed = (entry.duration as i64 - remaining).clamp(0, entry.duration as i64);
            self.ctx
                .publish(&BusMessage::Position {
                    src: entry.src.clone(),
                    trackid: entry.trackid.clone(),
                    elapsed: elapsed as u32,
                })
                .await?;
        }
    }

    async fn advance_clock(&self, seconds: i64) -> SongnestResult<()> {
        let next = player_now(&self.ctx).await? + chrono::Duration::seconds(seconds);
        self.ctx
            .store
            .set_ex(&self.ctx.key(CLOCK_KEY), &next.to_rfc3339(), CLOCK_TTL)
            .await?;
        Ok(())
    }

    async fn read_current_done(&self) -> SongnestResult<Option<DateTime<Utc>>> {
        let raw = self.ctx.store.get(&self.ctx.key(CURRENT_DONE_KEY)).await?;
        Ok(raw
            .and_then(|r| DateTime::parse_from_rfc3339(&r).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn write_current_done(&self, done: DateTime<Utc>) -> SongnestResult<()> {
        let now = player_now(&self.ctx).await?;
        let ttl = (done - now).num_seconds().max(1) as u64;
        self.ctx
            .store
            .set_ex(
                &self.ctx.key(CURRENT_DONE_KEY),
                &done.to_rfc3339(),
                Duration::from_secs(ttl),
            )
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Track transitions
    // ─────────────────────────────────────────────────────────────────────

    /// Pops the head of the queue and promotes it to now-playing.
    ///
    /// A popped human catalog track becomes the fresh recommendation seed
    /// (clearing every strategy cache and the auto-fill streak). Entries
    /// whose detail hash has expired are discarded and the next head is
    /// tried.
    pub async fn pop_next(&self) -> SongnestResult<Option<QueueEntry>> {
        loop {
            let head = self
                .ctx
                .store
                .zrange(&self.ctx.key(PRIORITY_QUEUE), 0, 0)
                .await?;
            let Some(raw_id) = head.into_iter().next() else {
                self.ctx.store.del(&self.ctx.key(NOW_PLAYING_KEY)).await?;
                return Ok(None);
            };
            self.ctx
                .store
                .zrem(&self.ctx.key(PRIORITY_QUEUE), &raw_id)
                .await?;
            let Ok(id) = raw_id.parse::<u64>() else {
                continue;
            };
            let Some(entry) = load_entry(&self.ctx, id).await? else {
                continue;
            };

            if entry.src == SRC_SPOTIFY && !entry.auto && !entry.trackid.contains(":episode:") {
                self.recommend.reseed_from(&entry.trackid).await?;
            }

            self.ctx
                .store
                .expire(&self.ctx.key(&entry_key(id)), PLAYED_ENTRY_TTL)
                .await?;
            self.ctx
                .store
                .set_ex(&self.ctx.key(NOW_PLAYING_KEY), &raw_id, NOW_PLAYING_TTL)
                .await?;
            self.ctx
                .store
                .set_ex(
                    &self.ctx.key(NOW_PLAYING_DONE_KEY),
                    &raw_id,
                    Duration::from_secs(entry.duration.max(1) as u64),
                )
                .await?;
            self.ctx.publish(&BusMessage::NowPlayingUpdate).await?;
            return Ok(Some(entry));
        }
    }

    /// Appends the finished play to the history log. Best-effort: a failed
    /// write never stalls the playhead.
    async fn log_finished(&self, entry: &QueueEntry) {
        let result: SongnestResult<()> = async {
            let endtime = self.song_end_time(false).await?;
            let jam = self.queue.jams(entry.id).await?;
            let airhorn = self.horns.for_song(entry.id).await?;
            let record = PlayRecord::from_entry(entry, endtime, jam, airhorn);
            let json = serde_json::to_string(&record)
                .map_err(|e| crate::error::SongnestError::Internal(e.to_string()))?;
            self.ctx
                .store
                .set(&self.ctx.key(LAST_PLAYED_KEY), &json)
                .await?;
            self.history.record(&record).await
        }
        .await;
        if let Err(e) = result {
            log::error!("[Playhead] Failed to log finished play #{}: {}", entry.id, e);
        }
    }

    /// End time for the current entry: the stored estimate while playing,
    /// otherwise the virtual clock reading.
    async fn song_end_time(&self, use_estimate: bool) -> SongnestResult<String> {
        if use_estimate {
            if let Some(done) = self.read_current_done().await? {
                return Ok(done.to_rfc3339());
            }
        }
        Ok(player_now(&self.ctx).await?.to_rfc3339())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Player state and controls
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot of the playhead for clients.
    pub async fn now_playing(&self) -> SongnestResult<NowPlaying> {
        let mut np = NowPlaying::default();
        if let Some(id) = now_playing_id(&self.ctx).await? {
            match load_entry(&self.ctx, id).await? {
                None => {
                    // Detail hash expired under the pointer; clear it.
                    self.ctx.store.del(&self.ctx.key(NOW_PLAYING_KEY)).await?;
                }
                Some(entry) => {
                    np.starttime = self.ctx.store.get(&self.ctx.key(STARTED_ON_KEY)).await?;
                    np.endtime = Some(self.song_end_time(true).await?);
                    if let Some(done) = self.read_current_done().await? {
                        let now = player_now(&self.ctx).await?;
                        let remaining = (done - now).num_seconds();
                        np.pos = (entry.duration as i64 - remaining)
                            .clamp(0, entry.duration as i64) as u32;
                    }
                    np.jam = self.queue.jams(id).await?;
                    np.comments = self.queue.comments(id).await?;
                    np.entry = Some(entry);
                }
            }
        }
        np.paused = self.is_paused().await?;
        Ok(np)
    }

    async fn is_paused(&self) -> SongnestResult<bool> {
        Ok(self.ctx.store.exists(&self.ctx.key(PAUSED_KEY)).await?)
    }

    /// Suspends advancement. The lease keeps refreshing while paused.
    pub async fn pause(&self) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.ctx.store.set(&self.ctx.key(PAUSED_KEY), "1").await?;
        self.ctx.publish(&BusMessage::NowPlayingUpdate).await?;
        Ok(())
    }

    /// Resumes advancement.
    ///
    /// If the entry's timer expired while paused long enough for the detail
    /// hash to lapse, the stale now-playing pointer is cleared so the next
    /// tick advances immediately.
    pub async fn unpause(&self) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.ctx.store.del(&self.ctx.key(PAUSED_KEY)).await?;
        if let Some(id) = now_playing_id(&self.ctx).await? {
            let done_missing = self.read_current_done().await?.is_none();
            if done_missing && load_entry(&self.ctx, id).await?.is_none() {
                self.ctx.store.del(&self.ctx.key(NOW_PLAYING_KEY)).await?;
                log::info!("[Playhead] Cleared stale now-playing #{} on unpause", id);
            }
        }
        self.ctx.publish(&BusMessage::NowPlayingUpdate).await?;
        Ok(())
    }

    /// Requests a skip; the inner loop observes the flag within one tick.
    pub async fn skip(&self) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.ctx.store.set(&self.ctx.key(FORCE_JUMP_KEY), "1").await?;
        Ok(())
    }

    /// Current volume, initializing the default on first read.
    pub async fn volume(&self) -> SongnestResult<u8> {
        let key = self.ctx.key(VOLUME_KEY);
        if !self.ctx.store.exists(&key).await? {
            self.ctx
                .store
                .set(&key, &DEFAULT_VOLUME.to_string())
                .await?;
        }
        Ok(self
            .ctx
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_VOLUME))
    }

    /// Sets the volume (clamped to 0-100) and broadcasts it.
    pub async fn set_volume(&self, requested: i64) -> SongnestResult<u8> {
        self.ctx.check_active().await?;
        let volume = requested.clamp(0, 100) as u8;
        self.ctx
            .store
            .set(&self.ctx.key(VOLUME_KEY), &volume.to_string())
            .await?;
        self.ctx.publish(&BusMessage::Volume(volume)).await?;
        log::info!("[Playhead] Volume set to {} on {}", volume, self.ctx.nest_id);
        Ok(volume)
    }

    /// The last finished play, as logged.
    pub async fn last_played(&self) -> SongnestResult<Option<PlayRecord>> {
        let raw = self.ctx.store.get(&self.ctx.key(LAST_PLAYED_KEY)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}
