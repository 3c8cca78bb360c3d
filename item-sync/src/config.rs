//! Engine configuration, loaded from the environment.

use crate::error::{SyncError, SyncResult};
use crate::local_db::LocalDbConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server base URL (the item routes live under `/api/items`)
    pub server_url: String,
    /// Push channel URL
    pub ws_url: String,
    /// Authentication token
    pub auth_token: Option<String>,
    /// HTTP request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Maximum consecutive reconnect attempts of the push channel
    pub max_retries: u32,
    /// Retry backoff base (milliseconds)
    pub retry_backoff_ms: u64,
    /// How often a watching client checks that the server answers (seconds)
    pub reachability_interval_secs: u64,
    /// Local database settings
    pub local_db: LocalDbConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            ws_url: "ws://localhost:3000".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            max_retries: 5,
            retry_backoff_ms: 1000,
            reachability_interval_secs: 15,
            local_db: LocalDbConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> SyncResult<Self> {
        let defaults = Self::default();

        let server_url = std::env::var("ITEM_SYNC_SERVER_URL").unwrap_or(defaults.server_url);
        let ws_url = std::env::var("ITEM_SYNC_WS_URL").unwrap_or(defaults.ws_url);
        let auth_token = std::env::var("ITEM_SYNC_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let request_timeout_secs = parse_env("ITEM_SYNC_TIMEOUT_SECS")?
            .unwrap_or(defaults.request_timeout_secs);
        let max_retries = parse_env("ITEM_SYNC_MAX_RETRIES")?.unwrap_or(defaults.max_retries);
        let retry_backoff_ms = parse_env("ITEM_SYNC_RETRY_BACKOFF_MS")?
            .unwrap_or(defaults.retry_backoff_ms);
        let reachability_interval_secs = parse_env("ITEM_SYNC_REACHABILITY_INTERVAL_SECS")?
            .unwrap_or(defaults.reachability_interval_secs);

        let local_db = LocalDbConfig {
            db_path: std::env::var("ITEM_SYNC_DB_PATH").unwrap_or(defaults.local_db.db_path),
            max_connections: parse_env("ITEM_SYNC_DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.local_db.max_connections),
            enable_wal: parse_env("ITEM_SYNC_DB_WAL")?.unwrap_or(defaults.local_db.enable_wal),
        };

        let config = Self {
            server_url,
            ws_url,
            auth_token,
            request_timeout_secs,
            max_retries,
            retry_backoff_ms,
            reachability_interval_secs,
            local_db,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject URLs the HTTP and WebSocket clients cannot use
    pub fn validate(&self) -> SyncResult<()> {
        check_url("server_url", &self.server_url, &["http://", "https://"])?;
        check_url("ws_url", &self.ws_url, &["ws://", "wss://"])?;
        if self.reachability_interval_secs == 0 {
            return Err(SyncError::Config("reachability_interval_secs must be positive".to_string()));
        }
        if self.local_db.db_path.trim().is_empty() {
            return Err(SyncError::Config("local_db.db_path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn check_url(field: &str, url: &str, schemes: &[&str]) -> SyncResult<()> {
    if schemes.iter().any(|scheme| url.starts_with(scheme) && url.len() > scheme.len()) {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "{field} must start with one of {}: {url:?}",
            schemes.join(", ")
        )))
    }
}
