//! `sicil serve` command - Run the server with the background refresher

use anyhow::Result;
use sicil_core::{gate_from_config, server, Config, RefreshReport, Refresher};
use std::sync::Arc;
use tracing::{info, warn};

use super::{open_cache, open_ledger};

pub async fn run(config: Config) -> Result<()> {
    info!("Starting Sicil...");

    let ledger = open_ledger(&config).await?;
    let cache = open_cache(&config)?;
    let gate = gate_from_config(&config.membership)?;

    if config.dataset.url.is_empty() {
        eprintln!("⚠️  Warning: no dataset URL configured");
        eprintln!("   Set dataset.url in the config file or SICIL_DATASET_URL.");
    }

    let refresher = if config.dataset.refresh_interval_secs > 0 {
        Some(Refresher::start(
            Arc::clone(&cache),
            config.dataset.refresh_interval(),
        ))
    } else {
        // Lazy mode: load once now, afterwards only on demand
        if let Err(e) = cache.ensure_fresh().await {
            warn!("Initial dataset load failed: {}", e);
        }
        None
    };

    let state = Arc::new(server::AppState::new(
        config.clone(),
        ledger,
        cache,
        gate,
    ));

    println!("🚀 Sicil server starting on {}", config.server_url());
    println!("   Lookup endpoint: {}/v1/search", config.server_url());
    println!("   Health:          {}/health", config.server_url());
    println!("   Press Ctrl+C to stop");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    let served = server::start_server(state, shutdown).await;

    if let Some(refresher) = refresher {
        match refresher.stop().await {
            Some(RefreshReport {
                at,
                outcome: Ok(()),
                records,
            }) => info!("Last dataset refresh at {}: {} records", at, records),
            Some(RefreshReport {
                at,
                outcome: Err(e),
                ..
            }) => warn!("Last dataset refresh at {} failed: {}", at, e),
            None => info!("Dataset refresher stopped before its first run"),
        }
    }

    served?;
    info!("Sicil stopped");
    Ok(())
}
