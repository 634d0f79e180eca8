//! `sicil config` commands - View and manage configuration

use anyhow::Result;
use sicil_core::Config;
use std::path::Path;

/// Show current configuration
pub fn show(config: Config) -> Result<()> {
    let url = if config.dataset.url.is_empty() {
        "(not set)".to_string()
    } else {
        truncate(&config.dataset.url, 23)
    };

    println!("╭─────────────────────────────────────────╮");
    println!("│         Sicil Configuration             │");
    println!("├─────────────────────────────────────────┤");
    println!("│ Server                                  │");
    println!("│   Host:         {:<23} │", config.server.host);
    println!("│   Port:         {:<23} │", config.server.port);
    println!("├─────────────────────────────────────────┤");
    println!("│ Dataset                                 │");
    println!("│   URL:          {:<23} │", url);
    println!(
        "│   Refresh:      {:<23} │",
        format!("{}s", config.dataset.refresh_interval_secs)
    );
    println!(
        "│   Timeout:      {:<23} │",
        format!("{}s", config.dataset.fetch_timeout_secs)
    );
    println!("│   Serve stale:  {:<23} │", config.dataset.serve_stale);
    println!("├─────────────────────────────────────────┤");
    println!("│ Ledger                                  │");
    println!("│   Initial:      {:<23} │", config.ledger.initial_searches);
    println!(
        "│   Bonus:        {:<23} │",
        format!(
            "{} after {} invites",
            config.ledger.bonus_amount, config.ledger.bonus_threshold
        )
    );
    println!("├─────────────────────────────────────────┤");
    println!("│ Membership                              │");
    println!(
        "│   Groups:       {:<23} │",
        config.membership.required_groups.len()
    );
    println!(
        "│   Bot token:    {:<23} │",
        if config.membership.bot_token.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("├─────────────────────────────────────────┤");
    println!("│ Logging                                 │");
    println!("│   Level:        {:<23} │", config.logging.level);
    println!("╰─────────────────────────────────────────╯");

    println!("\n📁 Paths:");
    if let Some(path) = Config::default_config_path() {
        let exists = path.exists();
        println!(
            "   Config:   {} {}",
            path.display(),
            if exists { "✓" } else { "(not created)" }
        );
    }
    if let Some(path) = config.db_path() {
        let exists = path.exists();
        println!(
            "   Database: {} {}",
            path.display(),
            if exists { "✓" } else { "(not created)" }
        );
    }

    Ok(())
}

/// Initialize default configuration
pub fn init(force: bool) -> Result<()> {
    let path = Config::default_config_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;

    let Some(config) = write_default(&path, force)? else {
        println!(
            "⚠️  Configuration file already exists at: {}",
            path.display()
        );
        println!("   Use --force to overwrite.");
        return Ok(());
    };

    println!("✅ Created configuration file at: {}", path.display());
    println!("\n📝 Default configuration:");
    println!("{}", toml::to_string_pretty(&config)?);

    // The defaults serve nothing until a dataset is configured
    println!("Next steps:");
    println!("   1. Set dataset.url (or SICIL_DATASET_URL) to the registry JSON");
    println!("   2. For group gating, fill membership.required_groups and bot_token");
    println!("   3. Run `sicil serve`");

    Ok(())
}

/// Write the default config to `path`.
///
/// Returns `None` without touching an existing file unless `force` is set.
fn write_default(path: &Path, force: bool) -> Result<Option<Config>> {
    if path.exists() && !force {
        return Ok(None);
    }

    // save_to_file creates the parent directory
    let config = Config::default();
    config.save_to_file(path)?;
    Ok(Some(config))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{}…", head)
    }
}
