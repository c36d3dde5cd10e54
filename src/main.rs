//! Barnwatch - room state classification and adaptive offline detection for
//! livestock barn monitoring.
//!
//! # API Endpoints
//!
//! - `GET /health` - Store connectivity and offline settings
//! - `GET /farms/summary` - State counts per farm
//! - `GET /farms/:regist_no/detail` - Rooms of one farm grouped by stall
//! - `GET /farms/:regist_no/threshold` - Effective offline threshold of a farm
//! - `GET /rooms/:key12` - Mapping, state, sensors and motors of one room
//! - `GET /rooms/:key12/logs` - State log of one room, paged by cursor
//! - `GET /alerts` - Rooms in warn, danger or offline state
//! - `GET /alerts/history` - Recent warn, danger and offline events

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use barnwatch::api::{AppState, router};
use barnwatch::config::Config;
use barnwatch::data_sources::PostgrestClient;
use barnwatch::storage::{SeedData, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("barnwatch=info".parse()?))
        .init();

    let config = Config::from_env();
    info!(
        port = config.port,
        default_threshold_sec = config.estimator.default_threshold_sec,
        cache_ttl_sec = config.estimator.cache_ttl.as_secs(),
        lookback_min = config.estimator.lookback.as_secs() / 60,
        "Starting Barnwatch server"
    );

    let state = match &config.postgrest {
        Some(postgrest) => {
            let client = PostgrestClient::new(
                &postgrest.url,
                &postgrest.api_key,
                config.estimator.fetch_timeout,
            )?;
            info!(url = %postgrest.url, "Using PostgREST store");
            if config.seed_file.is_some() {
                warn!("BARNWATCH_SEED_FILE is ignored with the PostgREST store");
            }
            AppState::new(Arc::new(client), config.estimator.clone())
        }
        None => {
            let storage = Storage::new(&config.database_url).await?;
            info!(db_url = %config.database_url, "Using SQLite store");
            if let Some(path) = &config.seed_file {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading seed file {}", path.display()))?;
                let data: SeedData = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing seed file {}", path.display()))?;
                storage.seed(&data).await?;
            }
            AppState::new(Arc::new(storage), config.estimator.clone())
        }
    };

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Barnwatch is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
