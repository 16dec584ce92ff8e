//! WebSocket connection tracking.
//!
//! Every live session registers here with its nest and identity, yielding
//! an RAII guard that unregisters on drop and a cancellation token for
//! force-close. Counts feed diagnostics; force-close covers shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

struct ConnectionInfo {
    nest_id: String,
    #[allow(dead_code)]
    identity: String,
}

/// Tracks all active WebSocket sessions in this process.
pub struct WsConnectionManager {
    connections: DashMap<String, ConnectionInfo>,
    next_id: AtomicU64,
    /// Replaced with a fresh token after each `close_all`.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a session; the guard unregisters it on drop.
    pub fn register(self: &Arc<Self>, nest_id: &str, identity: &str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{id}");
        let cancel_token = self.global_cancel.read().child_token();
        self.connections.insert(
            conn_id.clone(),
            ConnectionInfo {
                nest_id: nest_id.to_string(),
                identity: identity.to_string(),
            },
        );
        log::info!(
            "[WS] Session {} registered for nest {} (total: {})",
            conn_id,
            nest_id,
            self.connections.len()
        );
        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] Session {} unregistered (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Total live sessions.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live sessions attached to one nest.
    pub fn count_for_nest(&self, nest_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().nest_id == nest_id)
            .count()
    }

    /// Signals every session to close; returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} session(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a session when dropped.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelled when the manager force-closes sessions.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drop_unregisters() {
        let manager = Arc::new(WsConnectionManager::new());
        let guard = manager.register("main", "alice@x");
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.count_for_nest("main"), 1);
        drop(guard);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn per_nest_counts_are_separate() {
        let manager = Arc::new(WsConnectionManager::new());
        let _a = manager.register("main", "alice@x");
        let _b = manager.register("main", "bob@x");
        let _c = manager.register("XK42P", "carol@x");
        assert_eq!(manager.count_for_nest("main"), 2);
        assert_eq!(manager.count_for_nest("XK42P"), 1);
        assert_eq!(manager.count_for_nest("NOPE"), 0);
    }

    #[test]
    fn close_all_replaces_the_token() {
        let manager = Arc::new(WsConnectionManager::new());
        let guard = manager.register("main", "alice@x");
        let token = guard.cancel_token().clone();
        assert!(!token.is_cancelled());
        assert_eq!(manager.close_all(), 1);
        assert!(token.is_cancelled());
        // New registrations get a live token again.
        let fresh = manager.register("main", "bob@x");
        assert!(!fresh.cancel_token().is_cancelled());
    }
}
