//! CLI command implementations

pub mod account;
pub mod config;
pub mod dataset;
pub mod search;
pub mod serve;
pub mod status;

use anyhow::Result;
use sicil_core::{Config, DatasetCache, HttpFetcher, QuotaLedger};
use std::sync::Arc;

pub(crate) async fn open_ledger(config: &Config) -> Result<Arc<QuotaLedger>> {
    let db_path = config
        .db_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine database path"))?;
    Ok(Arc::new(QuotaLedger::new(&db_path, &config.ledger).await?))
}

pub(crate) fn open_cache(config: &Config) -> Result<Arc<DatasetCache>> {
    let fetcher = HttpFetcher::new(config.dataset.fetch_timeout())?;
    Ok(Arc::new(DatasetCache::new(
        &config.dataset,
        Arc::new(fetcher),
    )))
}
