//! Application configuration loaded from environment variables.

use crate::errors::{Result, StoreError};

/// Where finished collages are uploaded to and fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetBackend {
    /// Unsigned multipart uploads to an external object-storage endpoint.
    Http,
    /// In-process store, for local runs without an upload endpoint.
    Memory,
}

impl AssetBackend {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "memory" => Ok(Self::Memory),
            other => Err(StoreError::Config(format!(
                "Invalid ASSET_BACKEND '{other}' (expected http or memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Timeout applied to every outbound HTTP request
    pub http_timeout_secs: u64,
    pub asset_backend: AssetBackend,
    /// Object-storage upload endpoint (required for the http backend)
    pub upload_url: Option<String>,
    /// Unsigned upload preset sent with every upload
    pub upload_preset: Option<String>,
    /// Base URL of the game-account lookup service; lookups are disabled when unset
    pub lookup_url: Option<String>,
    /// Hard cap on items in one collage selection
    pub collage_max_items: usize,
    /// How many saved collages an account keeps
    pub asset_list_cap: usize,
    /// Buffered change notifications per subscriber
    pub feed_capacity: usize,
    /// Idle collage sessions are dropped after this many seconds
    pub session_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let asset_backend =
            AssetBackend::parse(&env_var("ASSET_BACKEND").unwrap_or_else(|_| "http".to_string()))?;

        let upload_url = env_var("UPLOAD_URL").ok();
        let upload_preset = env_var("UPLOAD_PRESET").ok();
        if asset_backend == AssetBackend::Http && (upload_url.is_none() || upload_preset.is_none())
        {
            return Err(StoreError::Config(
                "UPLOAD_URL and UPLOAD_PRESET are required when ASSET_BACKEND=http".to_string(),
            ));
        }

        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./storefront.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid API_PORT".to_string()))?,
            http_timeout_secs: env_var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid HTTP_TIMEOUT_SECS".to_string()))?,
            asset_backend,
            upload_url,
            upload_preset,
            lookup_url: env_var("LOOKUP_URL").ok(),
            collage_max_items: env_var("COLLAGE_MAX_ITEMS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid COLLAGE_MAX_ITEMS".to_string()))?,
            asset_list_cap: env_var("ASSET_LIST_CAP")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid ASSET_LIST_CAP".to_string()))?,
            feed_capacity: env_var("FEED_CAPACITY")
                .unwrap_or_else(|_| "256".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid FEED_CAPACITY".to_string()))?,
            session_ttl_secs: env_var("SESSION_TTL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| StoreError::Config("Invalid SESSION_TTL_SECS".to_string()))?,
        };

        if config.collage_max_items == 0 || config.asset_list_cap == 0 || config.feed_capacity == 0
        {
            return Err(StoreError::Config(
                "COLLAGE_MAX_ITEMS, ASSET_LIST_CAP and FEED_CAPACITY must be positive".to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| StoreError::Config(format!("Missing env var: {key}")))
}
