//! Airhorn log.
//!
//! Airhorns are low-cardinality broadcast sound effects: each blast is
//! appended to a per-nest list and fanned out on the event bus. Paid horns
//! are capped per song; free horns are earned when an entry collects enough
//! jams and are drawn from the contributor's `FREEHORN` set.

use chrono::{DateTime, Utc};

use crate::context::NestContext;
use crate::error::SongnestResult;
use crate::events::BusMessage;
use crate::model::{HornEvent, StoredHorn};
use crate::queue::{freehorn_key, now_playing_entry};

const AIRHORNS_KEY: &str = "AIRHORNS";

/// Broadcast volume for every horn; clients may still attenuate locally.
const HORN_VOLUME: &str = "0.4";

/// Per-nest airhorn operations.
pub struct Airhorns {
    ctx: NestContext,
}

impl Airhorns {
    pub fn new(ctx: NestContext) -> Self {
        Self { ctx }
    }

    /// All logged horns, newest first.
    pub async fn list(&self) -> SongnestResult<Vec<StoredHorn>> {
        let raw = self
            .ctx
            .store
            .lrange(&self.ctx.key(AIRHORNS_KEY), 0, -1)
            .await?;
        let mut horns: Vec<StoredHorn> = raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        horns.reverse();
        Ok(horns)
    }

    /// Horn events recorded against one entry, for the play log.
    pub async fn for_song(&self, id: u64) -> SongnestResult<Vec<HornEvent>> {
        // A list rather than a set: repeat blasts on the same song count.
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|h| h.songid == id)
            .map(|h| HornEvent {
                user: h.user,
                when: h.when,
                free: h.free,
            })
            .collect())
    }

    /// Trims aged horns off the front of the log, bounded per pass and
    /// never below the configured minimum retained length.
    pub async fn trim(&self) -> SongnestResult<()> {
        let horns = self.list().await?;
        let min_len = self.ctx.config.airhorn_min_len;
        if horns.len() < min_len {
            return Ok(());
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(self.ctx.config.airhorn_expire_secs);
        let mut popped = 0usize;
        for horn in &horns {
            let expired = DateTime::parse_from_rfc3339(&horn.when)
                .map(|when| when.with_timezone(&Utc) < cutoff)
                .unwrap_or(true);
            if !expired {
                continue;
            }
            self.ctx.store.lpop(&self.ctx.key(AIRHORNS_KEY)).await?;
            popped += 1;
            if popped >= self.ctx.config.airhorn_expire_count
                || horns.len() - popped < min_len
            {
                break;
            }
        }
        Ok(())
    }

    /// Fires a paid airhorn, respecting the simultaneous-horn cap.
    pub async fn fire(&self, user: &str, name: &str) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.trim().await?;
        let active_paid = self
            .list()
            .await?
            .iter()
            .filter(|h| !h.free)
            .count() as u64;
        if active_paid >= self.ctx.config.airhorn_max {
            log::info!("[Horns] Horn cap reached, ignoring blast from {}", user);
            return Ok(());
        }
        self.blast(user, false, Some(name)).await
    }

    /// Spends one of the caller's free airhorns, if any.
    pub async fn fire_free(&self, user: &str) -> SongnestResult<()> {
        self.ctx.check_active().await?;
        self.trim().await?;
        let spent = self
            .ctx
            .store
            .spop(&self.ctx.key(&freehorn_key(user)))
            .await?;
        if spent.is_some() {
            self.ctx.publish(&BusMessage::FreeHornUpdate).await?;
            self.blast(user, true, None).await?;
        }
        Ok(())
    }

    /// The caller's remaining free-airhorn count.
    pub async fn free_count(&self, user: &str) -> SongnestResult<u64> {
        Ok(self
            .ctx
            .store
            .scard(&self.ctx.key(&freehorn_key(user)))
            .await?)
    }

    async fn blast(&self, user: &str, free: bool, name: Option<&str>) -> SongnestResult<()> {
        let Some(playing) = now_playing_entry(&self.ctx).await? else {
            log::warn!("[Horns] Cannot airhorn, nothing playing");
            return Ok(());
        };
        let horn = StoredHorn {
            img: playing.img.clone(),
            songid: playing.id,
            when: Utc::now().to_rfc3339(),
            free,
            user: user.to_string(),
            artist: playing.artist.clone(),
            title: playing.title.clone(),
        };
        let line = serde_json::to_string(&horn)
            .map_err(|e| crate::error::SongnestError::Internal(e.to_string()))?;
        self.ctx
            .store
            .rpush_one(&self.ctx.key(AIRHORNS_KEY), &line)
            .await?;
        self.ctx
            .publish(&BusMessage::Airhorn {
                volume: HORN_VOLUME.into(),
                name: name.unwrap_or_default().to_string(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_horn_round_trips() {
        let horn = StoredHorn {
            img: "https://img.example/x.jpg".into(),
            songid: 7,
            when: "2026-08-01T12:00:00+00:00".into(),
            free: true,
            user: "alice@x".into(),
            artist: "Artist".into(),
            title: "Title".into(),
        };
        let line = serde_json::to_string(&horn).unwrap();
        let restored: StoredHorn = serde_json::from_str(&line).unwrap();
        assert_eq!(restored.songid, 7);
        assert!(restored.free);
        assert_eq!(restored.user, "alice@x");
    }
}
