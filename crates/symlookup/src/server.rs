use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use symlookup_service::caching::{EvictionManager, SymbolStore};
use symlookup_service::config::Config;
use symlookup_service::metric;
use symlookup_service::symbolication::SymbolicationService;

use crate::endpoints;

/// Starts the HTTP server of a lookup worker based on the loaded config.
///
/// Startup does not touch the shared cache beyond creating its directories. Other workers may be
/// using it already, stale temporary files are removed by the eviction process.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("symlookup-worker")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = SymbolicationService::new(&config).context("failed to create lookup service")?;
    let socket = config.bind.parse::<SocketAddr>()?;

    tracing::info!("Starting HTTP server on {}", socket);
    runtime.block_on(async {
        axum_server::bind(socket)
            .serve(endpoints::create_app(service).into_make_service())
            .await
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}

/// Runs the eviction process against the configured cache directory.
pub fn evict(config: Config, once: bool, dry_run: bool) -> Result<()> {
    let cache_dir = config.require_cache_dir()?;
    let store = SymbolStore::open(cache_dir, config.caches)
        .with_context(|| format!("failed to open symbol cache in {}", cache_dir.display()))?;
    let manager = EvictionManager::new(Arc::new(store), config.eviction).dry_run(dry_run);

    if once {
        let stats = manager.run_cycle()?;
        tracing::info!(?stats, dry_run, "Eviction cycle complete");
        return Ok(());
    }

    tracing::info!(
        max_cache_size = config.eviction.max_cache_size,
        interval = ?config.eviction.interval,
        "Starting eviction process"
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .thread_name("symlookup-evict")
        .enable_all()
        .build()?;
    runtime.block_on(manager.run(config.eviction.interval));

    Ok(())
}
