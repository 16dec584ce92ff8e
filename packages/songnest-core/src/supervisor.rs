//! Nest supervisor (C8).
//!
//! Two loops per process: a 5 s discovery pass that keeps exactly one
//! playhead worker task alive per registered nest, and a 60 s reaper pass
//! that deletes idle nests. The singleton-per-nest invariant across
//! processes is enforced by the playhead lease, not by this table - any
//! number of supervisors can run concurrently and compete safely.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::CoreServices;
use crate::error::SongnestResult;
use crate::queue::PRIORITY_QUEUE;
use crate::registry::should_delete_nest;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

struct NestWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Spawns, respawns, and cancels per-nest playhead workers.
pub struct Supervisor {
    services: CoreServices,
    workers: DashMap<String, NestWorker>,
}

impl Supervisor {
    pub fn new(services: CoreServices) -> Self {
        Self {
            services,
            workers: DashMap::new(),
        }
    }

    /// Discovery loop: one playhead worker per registered nest.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(&cancel).await {
                        log::warn!("[Supervisor] Discovery pass failed: {}", e);
                    }
                }
            }
        }
        self.stop_all();
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> SongnestResult<()> {
        let nests = self.services.registry.list_nests().await?;
        let live: HashSet<String> = nests.into_iter().map(|meta| meta.nest_id).collect();

        // Finished (crashed) workers leave the table so the next pass
        // respawns them.
        self.workers.retain(|nest_id, worker| {
            if worker.handle.is_finished() {
                log::warn!("[Supervisor] Worker for nest {} exited, will respawn", nest_id);
                false
            } else {
                true
            }
        });

        // Cancel workers whose nest is gone.
        let orphaned: Vec<String> = self
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|nest_id| !live.contains(nest_id))
            .collect();
        for nest_id in orphaned {
            if let Some((_, worker)) = self.workers.remove(&nest_id) {
                log::info!("[Supervisor] Cancelling worker for deleted nest {}", nest_id);
                worker.cancel.cancel();
            }
        }

        // Spawn workers for newly discovered nests.
        for nest_id in live {
            if !self.workers.contains_key(&nest_id) {
                self.spawn_worker(&nest_id, cancel);
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, nest_id: &str, parent: &CancellationToken) {
        let cancel = parent.child_token();
        let handle = self.services.nest(nest_id);
        let worker_cancel = cancel.clone();
        let id = nest_id.to_string();
        log::info!("[Supervisor] Spawning playhead worker for nest {}", id);
        let task = tokio::spawn(async move {
            handle.playhead.run(worker_cancel).await;
        });
        self.workers.insert(
            nest_id.to_string(),
            NestWorker {
                cancel,
                handle: task,
            },
        );
    }

    fn stop_all(&self) {
        for entry in self.workers.iter() {
            entry.value().cancel.cancel();
        }
        self.workers.clear();
    }

    /// Number of live worker tasks (for diagnostics).
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reaper loop: deletes nests that have gone idle past their TTL.
    pub async fn run_reaper(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once().await {
                        log::warn!("[Supervisor] Reaper pass failed: {}", e);
                    }
                }
            }
        }
    }

    async fn reap_once(&self) -> SongnestResult<()> {
        let now = chrono::Utc::now();
        for meta in self.services.registry.list_nests().await? {
            if meta.is_main {
                continue;
            }
            let members = self
                .services
                .membership
                .count_active(&meta.nest_id)
                .await?;
            let queue_key = format!("NEST:{}|{}", meta.nest_id, PRIORITY_QUEUE);
            let queue_size = self.services.store.zcard(&queue_key).await?;
            if should_delete_nest(&meta, members, queue_size, now) {
                log::info!(
                    "[Supervisor] Reaping idle nest {} (members={}, queue={}, last_activity={})",
                    meta.nest_id,
                    members,
                    queue_size,
                    meta.last_activity
                );
                if let Err(e) = self.services.registry.delete_nest(&meta.nest_id).await {
                    log::warn!("[Supervisor] Could not reap nest {}: {}", meta.nest_id, e);
                }
            }
        }
        Ok(())
    }
}
