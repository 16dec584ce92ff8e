//! Explicit runtime context threaded through the components.
//!
//! The legacy system reached for process-wide singletons (a shared client,
//! a global nest manager, module-level rate-limit state). Here everything a
//! component needs arrives as a field: [`CoreServices`] is the process-wide
//! bundle built once in bootstrap, and [`NestContext`] scopes a clone of it
//! to a single nest's key namespace.

use std::sync::Arc;

use crate::catalog::CatalogClient;
use crate::error::{SongnestError, SongnestResult};
use crate::events::{self, BusMessage};
use crate::history::PlayHistory;
use crate::horns::Airhorns;
use crate::membership::Membership;
use crate::playhead::Playhead;
use crate::queue::QueueEngine;
use crate::recommend::Recommender;
use crate::registry::NestRegistry;
use crate::state::Config;
use crate::store::{Store, StoreResult};

/// The singleton default nest.
pub const MAIN_NEST: &str = "main";

/// Key suffix of the deletion-in-progress sentinel.
pub const DELETING_KEY: &str = "DELETING";

/// Store and configuration scoped to one nest's key namespace.
#[derive(Clone)]
pub struct NestContext {
    pub nest_id: String,
    pub store: Store,
    pub config: Arc<Config>,
}

impl NestContext {
    pub fn new(nest_id: impl Into<String>, store: Store, config: Arc<Config>) -> Self {
        Self {
            nest_id: nest_id.into(),
            store,
            config,
        }
    }

    /// Prefixes a key with this nest's namespace.
    pub fn key(&self, suffix: &str) -> String {
        format!("NEST:{}|{}", self.nest_id, suffix)
    }

    /// This nest's pub/sub channel name.
    pub fn channel(&self) -> String {
        events::channel(&self.nest_id)
    }

    /// Publishes a bus message on this nest's channel.
    pub async fn publish(&self, msg: &BusMessage) -> StoreResult<()> {
        self.store.publish(&self.channel(), &msg.encode()).await
    }

    pub fn is_main(&self) -> bool {
        self.nest_id == MAIN_NEST
    }

    /// Fails with [`SongnestError::NestDeleting`] while the deletion
    /// sentinel is set. The main nest is never deletable, so the check is
    /// skipped there.
    pub async fn check_active(&self) -> SongnestResult<()> {
        if self.is_main() {
            return Ok(());
        }
        if self.store.exists(&self.key(DELETING_KEY)).await? {
            return Err(SongnestError::NestDeleting);
        }
        Ok(())
    }
}

/// Process-wide services built once during bootstrap.
#[derive(Clone)]
pub struct CoreServices {
    pub store: Store,
    pub catalog: Arc<dyn CatalogClient>,
    pub config: Arc<Config>,
    pub history: Arc<PlayHistory>,
    pub registry: Arc<NestRegistry>,
    pub membership: Arc<Membership>,
}

impl CoreServices {
    /// Wires up the per-nest engine stack for one nest.
    ///
    /// Handles are cheap: each engine is a thin struct over clones of the
    /// shared store/catalog, so sessions build one per request or per
    /// connection without pooling.
    pub fn nest(&self, nest_id: &str) -> NestHandle {
        let ctx = NestContext::new(nest_id, self.store.clone(), Arc::clone(&self.config));
        let recommend = Arc::new(Recommender::new(
            ctx.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.history),
            Arc::clone(&self.registry),
        ));
        let horns = Arc::new(Airhorns::new(ctx.clone()));
        let queue = Arc::new(QueueEngine::new(
            ctx.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&recommend),
        ));
        let playhead = Arc::new(Playhead::new(
            ctx.clone(),
            Arc::clone(&queue),
            Arc::clone(&recommend),
            Arc::clone(&self.history),
            Arc::clone(&horns),
        ));
        NestHandle {
            ctx,
            queue,
            recommend,
            playhead,
            horns,
        }
    }
}

/// The engine stack for one nest.
#[derive(Clone)]
pub struct NestHandle {
    pub ctx: NestContext,
    pub queue: Arc<QueueEngine>,
    pub recommend: Arc<Recommender>,
    pub playhead: Arc<Playhead>,
    pub horns: Arc<Airhorns>,
}
