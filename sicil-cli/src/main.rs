//! Sicil CLI - quota-metered registry lookup
//!
//! Runs the lookup server and offers operator commands against the
//! dataset and the quota ledger.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sicil_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sicil - quota-metered registry lookup
#[derive(Parser)]
#[command(name = "sicil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(long, global = true, env = "SICIL_PORT")]
    port: Option<u16>,

    /// Dataset URL (overrides config)
    #[arg(long, global = true, env = "SICIL_DATASET_URL")]
    dataset_url: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(long, global = true, env = "SICIL_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server and the background dataset refresher
    Serve,

    /// Look up an identifier on behalf of a user (spends one lookup)
    Search {
        user_id: i64,

        /// 11-digit national identifier
        identifier: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ledger commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Credit a referrer for a referred user
    Refer { referrer_id: i64, referred_id: i64 },

    /// Dataset commands
    #[command(subcommand)]
    Dataset(DatasetCommands),

    /// Check server status
    Status,

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Show one user's counters
    Show {
        user_id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show ledger totals
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum DatasetCommands {
    /// Download and parse the dataset locally and report what was loaded
    Check,

    /// Ask the running server to refetch its dataset
    Refresh,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Initialize default configuration
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(path) = &cli.config {
        Config::load_from_file(path)?
    } else {
        Config::load()?
    };

    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(url) = &cli.dataset_url {
        config.dataset.url = url.clone();
    }

    Config::ensure_dirs()?;

    match cli.command {
        Commands::Serve => commands::serve::run(config).await,
        Commands::Search {
            user_id,
            identifier,
            json,
        } => commands::search::run(config, user_id, &identifier, json).await,
        Commands::Account(cmd) => match cmd {
            AccountCommands::Show { user_id, json } => {
                commands::account::show(config, user_id, json).await
            }
            AccountCommands::Stats { json } => commands::account::stats(config, json).await,
        },
        Commands::Refer {
            referrer_id,
            referred_id,
        } => commands::account::refer(config, referrer_id, referred_id).await,
        Commands::Dataset(cmd) => match cmd {
            DatasetCommands::Check => commands::dataset::check(config).await,
            DatasetCommands::Refresh => commands::dataset::refresh(config).await,
        },
        Commands::Status => commands::status::run(config).await,
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => commands::config::show(config),
            ConfigCommands::Init { force } => commands::config::init(force),
        },
    }
}
