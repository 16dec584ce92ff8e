//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `SONGNEST_BIND_PORT`
    pub bind_port: u16,

    /// Store connection URL.
    /// Override: `SONGNEST_STORE_URL`
    pub store_url: String,

    /// Directory for per-day play-log files.
    /// Override: `SONGNEST_LOG_DIR`
    pub log_dir: PathBuf,

    /// Catalog API credentials.
    /// Overrides: `SONGNEST_CATALOG_CLIENT_ID`, `SONGNEST_CATALOG_CLIENT_SECRET`
    pub catalog_client_id: String,
    pub catalog_client_secret: String,

    /// Whether auto-fill backfills empty queues.
    pub use_autofill: bool,

    /// Longest continuous auto-fill run, in minutes.
    pub max_autofill_minutes: i64,

    /// Maximum human queue depth on non-main nests.
    pub max_queue_depth: u64,

    /// Idle minutes before a fresh nest becomes reapable.
    pub nest_ttl_minutes: i64,

    /// Catalog markets, first entry used for searches.
    pub regions: Vec<String>,

    /// Identities allowed to re-vote.
    pub privileged_users: Vec<String>,

    /// Bearer token -> identity table.
    pub api_tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = songnest_core::Config::default();
        Self {
            bind_port: 5000,
            store_url: core.store_url,
            log_dir: core.log_dir,
            catalog_client_id: String::new(),
            catalog_client_secret: String::new(),
            use_autofill: core.use_autofill,
            max_autofill_minutes: core.max_autofill_minutes,
            max_queue_depth: core.max_queue_depth,
            nest_ttl_minutes: core.nest_ttl_minutes,
            regions: core.regions,
            privileged_users: core.privileged_users,
            api_tokens: core.api_tokens,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SONGNEST_STORE_URL") {
            self.store_url = val;
        }
        if let Ok(val) = std::env::var("SONGNEST_CATALOG_CLIENT_ID") {
            self.catalog_client_id = val;
        }
        if let Ok(val) = std::env::var("SONGNEST_CATALOG_CLIENT_SECRET") {
            self.catalog_client_secret = val;
        }
        // SONGNEST_BIND_PORT and SONGNEST_LOG_DIR are handled by clap via
        // #[arg(env = ...)] in main.rs
    }

    /// Converts to songnest-core's Config type.
    pub fn to_core_config(&self) -> songnest_core::Config {
        songnest_core::Config {
            store_url: self.store_url.clone(),
            log_dir: self.log_dir.clone(),
            catalog_client_id: self.catalog_client_id.clone(),
            catalog_client_secret: self.catalog_client_secret.clone(),
            use_autofill: self.use_autofill,
            max_autofill_minutes: self.max_autofill_minutes,
            max_queue_depth: self.max_queue_depth,
            nest_ttl_minutes: self.nest_ttl_minutes,
            regions: self.regions.clone(),
            privileged_users: self.privileged_users.clone(),
            api_tokens: self.api_tokens.clone(),
            ..Default::default()
        }
    }
}
