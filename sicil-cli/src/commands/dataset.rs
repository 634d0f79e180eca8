//! `sicil dataset` commands - Check the dataset source, refresh the server

use anyhow::Result;
use sicil_core::Config;

use super::open_cache;

/// Fetch and parse the dataset in-process
pub async fn check(config: Config) -> Result<()> {
    let cache = open_cache(&config)?;

    println!("Fetching {} ...", config.dataset.url);

    match cache.ensure_fresh().await {
        Ok(()) => {
            let status = cache.status().await;
            println!("\n✅ Dataset loaded");
            println!("   Pages:        {}", status.pages);
            println!("   Records:      {}", status.records);
            println!("   Identifiers:  {}", status.identifiers);
        }
        Err(e) => {
            println!("\n❌ Dataset could not be loaded: {}", e);
        }
    }

    Ok(())
}

/// Ask the running server to refetch now
pub async fn refresh(config: Config) -> Result<()> {
    let url = format!("{}/v1/dataset/refresh", config.server_url());

    let response = match reqwest::Client::new().post(&url).send().await {
        Ok(response) => response,
        Err(_) => {
            println!("❌ Sicil server is not running");
            println!("   Start it with: sicil serve");
            return Ok(());
        }
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if status.is_success() {
        println!(
            "✅ Dataset refreshed: {} records",
            body.get("records").and_then(|v| v.as_u64()).unwrap_or(0)
        );
    } else {
        println!(
            "⚠️  Refresh failed ({}): {}",
            status,
            body.pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
        );
    }

    Ok(())
}
