//! Per-nest membership tracking (C3).
//!
//! Two collections per nest: a `MEMBERS` set of identities and one
//! `MEMBER:{identity}` key per member whose TTL is refreshed every
//! heartbeat. Crashed sessions leave stale set entries behind; those are
//! pruned lazily the next time someone asks for the active count.

use std::sync::Arc;
use std::time::Duration;

use crate::error::SongnestResult;
use crate::events::BusMessage;
use crate::registry::NestRegistry;
use crate::state::Config;
use crate::store::Store;

/// Key of a nest's member set.
pub fn members_key(nest_id: &str) -> String {
    format!("NEST:{nest_id}|MEMBERS")
}

/// Key of one member's heartbeat TTL.
pub fn member_key(nest_id: &str, identity: &str) -> String {
    format!("NEST:{nest_id}|MEMBER:{identity}")
}

/// Tracks who is currently connected to each nest.
pub struct Membership {
    store: Store,
    registry: Arc<NestRegistry>,
    config: Arc<Config>,
}

impl Membership {
    pub fn new(store: Store, registry: Arc<NestRegistry>, config: Arc<Config>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.member_ttl_secs)
    }

    /// Adds a member, touches the nest, and broadcasts the new count.
    pub async fn join(&self, nest_id: &str, identity: &str) -> SongnestResult<()> {
        self.store.sadd(&members_key(nest_id), identity).await?;
        self.refresh(nest_id, identity).await?;
        self.registry.touch(nest_id).await?;
        self.broadcast_count(nest_id).await?;
        log::info!("[Membership] {} joined nest {}", identity, nest_id);
        Ok(())
    }

    /// Removes a member and its heartbeat key, then broadcasts the count.
    pub async fn leave(&self, nest_id: &str, identity: &str) -> SongnestResult<()> {
        self.store.srem(&members_key(nest_id), identity).await?;
        self.store.del(&member_key(nest_id, identity)).await?;
        self.broadcast_count(nest_id).await?;
        log::info!("[Membership] {} left nest {}", identity, nest_id);
        Ok(())
    }

    /// Refreshes a member's heartbeat TTL. Called every heartbeat interval
    /// by a live WebSocket session.
    pub async fn refresh(&self, nest_id: &str, identity: &str) -> SongnestResult<()> {
        self.store
            .set_ex(&member_key(nest_id, identity), "1", self.ttl())
            .await?;
        Ok(())
    }

    /// Counts members whose heartbeat is live, pruning the rest from the
    /// set as a side effect.
    pub async fn count_active(&self, nest_id: &str) -> SongnestResult<u64> {
        let mkey = members_key(nest_id);
        let members = self.store.smembers(&mkey).await?;
        let mut active = 0u64;
        for identity in &members {
            // ttl <= 0 covers both a missing key (-2) and one with no
            // expiry left.
            if self.store.ttl(&member_key(nest_id, identity)).await? <= 0 {
                self.store.srem(&mkey, identity).await?;
            } else {
                active += 1;
            }
        }
        Ok(active)
    }

    /// Raw set cardinality without pruning.
    pub async fn member_count(&self, nest_id: &str) -> SongnestResult<u64> {
        Ok(self.store.scard(&members_key(nest_id)).await?)
    }

    async fn broadcast_count(&self, nest_id: &str) -> SongnestResult<()> {
        let count = self.member_count(nest_id).await?;
        self.store
            .publish(
                &crate::events::channel(nest_id),
                &BusMessage::MemberUpdate(count).encode(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_keys_are_nest_scoped() {
        assert_eq!(members_key("main"), "NEST:main|MEMBERS");
        assert_eq!(
            member_key("XK42P", "alice@x"),
            "NEST:XK42P|MEMBER:alice@x"
        );
    }
}
