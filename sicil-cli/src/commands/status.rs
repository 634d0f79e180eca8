//! `sicil status` command - Check server status

use anyhow::Result;
use sicil_core::Config;

pub async fn run(config: Config) -> Result<()> {
    let url = format!("{}/health", config.server_url());

    println!("Checking Sicil server status...");
    println!("URL: {}", url);

    match reqwest::get(&url).await {
        Ok(response) => {
            if response.status().is_success() {
                let health: serde_json::Value = response.json().await?;

                println!("\n✅ Sicil server is running");
                println!(
                    "   Status:          {}",
                    health
                        .get("status")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                );
                println!(
                    "   Version:         {}",
                    health
                        .get("version")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                );

                if let Some(dataset) = health.get("dataset") {
                    println!("\n📚 Dataset:");
                    println!(
                        "   Loaded:   {}",
                        if dataset
                            .get("loaded")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false)
                        {
                            "yes ✓"
                        } else {
                            "no ⚠"
                        }
                    );
                    println!(
                        "   Records:  {}",
                        dataset.get("records").and_then(|v| v.as_u64()).unwrap_or(0)
                    );
                    if let Some(age) = dataset.get("age_secs").and_then(|v| v.as_u64()) {
                        println!("   Age:      {}s", age);
                    }
                    if let Some(error) = dataset.get("last_error").and_then(|v| v.as_str()) {
                        println!("   Last error: {}", error);
                    }
                }

                if let Some(ledger) = health.get("ledger").filter(|v| !v.is_null()) {
                    println!("\n📊 Ledger:");
                    println!(
                        "   Users:    {}",
                        ledger.get("users").and_then(|v| v.as_i64()).unwrap_or(0)
                    );
                    println!(
                        "   Bonuses:  {}",
                        ledger
                            .get("bonuses_granted")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0)
                    );
                }
            } else {
                println!(
                    "\n⚠️  Sicil server responded with status: {}",
                    response.status()
                );
            }
        }
        Err(_) => {
            println!("\n❌ Sicil server is not running");
            println!("   Start it with: sicil serve");
        }
    }

    Ok(())
}
