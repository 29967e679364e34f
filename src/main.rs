use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxyfleet::modules::config::AppConfig;
use proxyfleet::modules::geo::MaxmindCountryLookup;
use proxyfleet::modules::store::ProxyStore;
use proxyfleet::pool::assignment::AssignmentEngine;
use proxyfleet::pool::loops::BackgroundLoops;
use proxyfleet::pool::prober::HttpProber;
use proxyfleet::pool::registry::ProxyRegistry;
use proxyfleet::pool::settings::SettingsRegistry;
use proxyfleet::server::{self, auth, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir {}", parent.display()))?;
    }

    let store = ProxyStore::open(&config.db_path)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    info!("Store ready at {}", config.db_path.display());

    auth::ensure_admin_user(&store).context("failed to bootstrap admin user")?;

    let settings = SettingsRegistry::new(store.clone());
    let loaded = settings.load().context("failed to load settings")?;
    info!("Settings loaded: {:?}", loaded);

    let prober = Arc::new(HttpProber::new());
    let geo = Arc::new(MaxmindCountryLookup::new(config.geoip_db_path.clone()));

    let registry = ProxyRegistry::new(store.clone(), prober.clone());
    let engine = AssignmentEngine::new(store.clone(), settings.clone());

    let shutdown = CancellationToken::new();
    let loops = BackgroundLoops::new(
        store.clone(),
        settings.clone(),
        prober,
        geo,
        shutdown.clone(),
    );
    let loop_handles = loops.spawn();

    // Ctrl-C cancels the loops and drains the server.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = AppState::new(store, registry, engine, settings);
    server::serve(&config.bind_addr(), state, shutdown)
        .await
        .context("server error")?;

    for handle in loop_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}
