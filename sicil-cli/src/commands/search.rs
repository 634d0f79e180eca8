//! `sicil search` command - Run one lookup against the local ledger

use anyhow::Result;
use serde_json::Value;
use sicil_core::{Config, LookupService, SearchOutcome};

use super::{open_cache, open_ledger};

pub async fn run(config: Config, user_id: i64, identifier: &str, json_output: bool) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let cache = open_cache(&config)?;
    let lookup = LookupService::new(ledger, cache, config.dataset.serve_stale);

    let result = lookup.search(user_id, identifier).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    match &result.outcome {
        SearchOutcome::Invalid(_) => println!("❌ Identifier must be exactly 11 digits."),
        SearchOutcome::Denied(_) => println!("⛔ User {} has no lookups left.", user_id),
        SearchOutcome::Failed(_) => println!("⚠️  Dataset could not be loaded. Try again later."),
        SearchOutcome::Empty => println!("🔍 No records found."),
        SearchOutcome::Found(records) => {
            println!("🔍 {} record(s) found\n", records.len());
            for (i, record) in records.iter().enumerate() {
                let role = if record.is_subject(identifier.trim()) {
                    "subject"
                } else {
                    "agent"
                };
                println!("── Record {} ({}) ──", i + 1, role);
                for (key, value) in &record.fields {
                    println!("   {:<28} {}", key, display_value(value));
                }
                println!();
            }
        }
    }

    if let Some(remaining) = result.remaining_searches {
        println!("Remaining lookups: {}", remaining);
    }

    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
