//! Application bootstrap and dependency wiring.
//!
//! The composition root: the single place where the store connection,
//! catalog client, history, registry, and membership tracker are built and
//! wired, in dependency order. Everything downstream (per-nest engines, the
//! API layer, the supervisor) hangs off the returned container.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::api::WsConnectionManager;
use crate::catalog::{CatalogClient, SpotifyCatalog};
use crate::context::CoreServices;
use crate::error::SongnestResult;
use crate::history::PlayHistory;
use crate::membership::Membership;
use crate::registry::NestRegistry;
use crate::state::Config;
use crate::store::Store;
use crate::supervisor::Supervisor;

/// Catalog HTTP timeout.
const CATALOG_TIMEOUT_SECS: u64 = 10;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Process-wide core services (store, catalog, registry, ...).
    pub services: CoreServices,
    /// Playhead-worker supervisor and idle-nest reaper.
    pub supervisor: Arc<Supervisor>,
    /// Tracks live WebSocket sessions.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Spawns the supervisor's discovery and reaper loops.
    pub fn start_background_tasks(&self) {
        let supervisor = Arc::clone(&self.supervisor);
        let cancel = self.cancel_token.child_token();
        tokio::spawn(async move {
            supervisor.run(cancel).await;
        });
        let supervisor = Arc::clone(&self.supervisor);
        let cancel = self.cancel_token.child_token();
        tokio::spawn(async move {
            supervisor.run_reaper(cancel).await;
        });
        log::info!("[Bootstrap] Supervisor and reaper started");
    }

    /// Initiates graceful shutdown of all background work.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        let closed = self.ws_manager.close_all();
        log::info!("[Bootstrap] Closed {} WebSocket session(s)", closed);
        log::info!("[Bootstrap] Shutdown complete");
    }
}

fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(CATALOG_TIMEOUT_SECS))
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all application services with their dependencies.
///
/// Connects to the store, indexes any existing play logs, and registers the
/// main nest, so the returned container is immediately serviceable.
pub async fn bootstrap_services(config: Config) -> SongnestResult<BootstrappedServices> {
    let config = Arc::new(config);
    let http_client = create_http_client();

    let store = Store::connect(&config.store_url).await?;
    log::info!("[Bootstrap] Connected to store at {}", config.store_url);

    let catalog: Arc<dyn CatalogClient> = Arc::new(SpotifyCatalog::new(
        http_client.clone(),
        config.catalog_client_id.clone(),
        config.catalog_client_secret.clone(),
    ));

    let history = Arc::new(PlayHistory::new(store.clone(), config.log_dir.clone())?);
    if let Err(e) = history.init_from_logs().await {
        log::warn!("[Bootstrap] Play-history import failed: {}", e);
    }

    let registry = Arc::new(NestRegistry::new(
        store.clone(),
        Arc::clone(&catalog),
        Arc::clone(&config),
    ));
    registry.ensure_main_nest().await?;

    let membership = Arc::new(Membership::new(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&config),
    ));

    let services = CoreServices {
        store,
        catalog,
        config,
        history,
        registry,
        membership,
    };

    let supervisor = Arc::new(Supervisor::new(services.clone()));
    let ws_manager = Arc::new(WsConnectionManager::new());

    Ok(BootstrappedServices {
        services,
        supervisor,
        ws_manager,
        cancel_token: CancellationToken::new(),
        http_client,
    })
}
