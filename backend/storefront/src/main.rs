//! Top-up storefront backend: entry point.
//!
//! Serves the wallet ledger, the collage unlock flow and the order history
//! over a small Axum REST API backed by SQLite.

mod api;
mod assets;
mod collage;
mod config;
mod db;
mod errors;
mod feed;
mod history;
mod ledger;
mod lookup;
mod models;
mod pricing;
mod site;
mod unlock;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assets::{AssetStore, HttpAssetStore, MemoryAssetStore};
use config::{AssetBackend, Config};
use feed::ChangeFeed;
use ledger::Ledger;
use lookup::LookupClient;
use unlock::UnlockGate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Shared by the upload backend and the game-account lookup.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let assets: Arc<dyn AssetStore> = match config.asset_backend {
        AssetBackend::Http => {
            let (Some(url), Some(preset)) = (&config.upload_url, &config.upload_preset) else {
                anyhow::bail!("UPLOAD_URL and UPLOAD_PRESET are required for the http backend");
            };
            Arc::new(HttpAssetStore::new(client.clone(), url.as_str(), preset.as_str()))
        }
        AssetBackend::Memory => {
            warn!("Using the in-memory asset store; uploads are lost on restart");
            Arc::new(MemoryAssetStore::new())
        }
    };

    let lookup = match &config.lookup_url {
        Some(url) => Some(LookupClient::new(client.clone(), url.as_str())),
        None => {
            info!("LOOKUP_URL not set; game-account lookup disabled");
            None
        }
    };

    // ─── Domain services ──────────────────────────────────
    let feed = ChangeFeed::new(config.feed_capacity);
    let ledger = Ledger::new(pool.clone(), feed.clone());
    let gate = Arc::new(UnlockGate::new(
        pool.clone(),
        ledger.clone(),
        assets,
        feed.clone(),
        config.collage_max_items,
        config.asset_list_cap,
    )
    .with_session_ttl(Duration::from_secs(config.session_ttl_secs)));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        ledger,
        gate,
        feed,
        lookup,
    });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
