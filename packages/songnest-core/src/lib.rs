//! Songnest Core - shared library for the Songnest jukebox.
//!
//! This crate provides the core functionality for Songnest, a multi-tenant
//! collaborative music jukebox. Each tenant (a "nest") owns an independent
//! playback session: a vote-reorderable priority queue, a virtual playhead
//! driven by exactly one leased worker, a recommendation engine that keeps
//! the queue from emptying, and a pub/sub channel fanned out to WebSocket
//! and SSE clients.
//!
//! # Architecture
//!
//! - [`store`]: Typed facade over the key/value + pub/sub store
//! - [`registry`]: Nest lifecycle (codes, slugs, creation, race-safe delete)
//! - [`membership`]: Heartbeat-based participant tracking
//! - [`queue`]: Priority queue with fair-share scheduling, votes, jams
//! - [`playhead`]: Per-nest master-player loop and virtual clock
//! - [`recommend`]: Weighted recommendation strategies ("auto-fill")
//! - [`events`]: The closed pub/sub message vocabulary
//! - [`supervisor`]: Worker spawning and idle-nest reaping
//! - [`history`]: Durable play log and throwback queries
//! - [`api`]: HTTP, WebSocket, and SSE surfaces
//!
//! The composition root is [`bootstrap::bootstrap_services`]; the server
//! binary wires a [`Config`] in, starts background tasks, and serves.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod context;
pub mod error;
pub mod events;
pub mod history;
pub mod horns;
pub mod membership;
pub mod model;
pub mod playhead;
pub mod queue;
pub mod recommend;
pub mod registry;
pub mod state;
pub mod store;
pub mod supervisor;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, Identity, ServerError, WsConnectionManager};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use catalog::{CatalogClient, CatalogError, SpotifyCatalog};
pub use context::{CoreServices, NestContext, NestHandle, MAIN_NEST};
pub use error::{ErrorCode, SongnestError, SongnestResult};
pub use events::BusMessage;
pub use history::PlayHistory;
pub use model::{NowPlaying, PlayRecord, QueueCard, QueueEntry, QueuedEntry};
pub use queue::{AddOptions, QueueEngine};
pub use recommend::{Recommender, Strategy};
pub use registry::{should_delete_nest, NestMeta, NestRegistry};
pub use state::{Config, StrategyWeights};
pub use store::{Store, StoreError, StoreResult};
pub use supervisor::Supervisor;
