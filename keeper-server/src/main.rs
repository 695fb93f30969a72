use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keeper_server::{MemoryStore, ServerConfig, ServerHandle};

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KEEPER_SERVER_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let config = ServerConfig {
        password: std::env::var("KEEPER_SERVER_PASSWORD").ok().filter(|value| !value.is_empty()),
    };

    let store = Arc::new(MemoryStore::new());
    let server = ServerHandle::start_with(&addr, Arc::clone(&store), config)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %server.addr(), "keeper-server ready");

    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = store.purge_expired(Instant::now());
            if removed > 0 {
                tracing::debug!(removed, "purged expired keys");
            }
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    sweeper.abort();
    server.stop().await;
    Ok(())
}
