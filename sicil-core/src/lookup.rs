//! Quota-metered registry lookup.

use crate::dataset::{DatasetCache, DatasetRecord};
use crate::ledger::{LedgerError, QuotaLedger};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Length of a national identifier
pub const IDENTIFIER_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoQuota,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    BadIdentifierFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DatasetUnavailable,
}

/// Result of a lookup request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SearchOutcome {
    Denied(DenialReason),
    Invalid(InvalidReason),
    Failed(FailureReason),
    Empty,
    Found(Vec<Arc<DatasetRecord>>),
}

/// Outcome of a lookup plus the caller's quota right after it.
///
/// `remaining_searches` comes from the same statement that charged the
/// lookup; it is absent when the request was rejected before any charge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub outcome: SearchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_searches: Option<i64>,
}

/// Returns the identifier with surrounding whitespace removed if it is exactly
/// eleven ASCII digits.
pub fn validate_identifier(raw: &str) -> Option<&str> {
    let identifier = raw.trim();
    let well_formed =
        identifier.len() == IDENTIFIER_LEN && identifier.bytes().all(|b| b.is_ascii_digit());
    well_formed.then_some(identifier)
}

pub struct LookupService {
    ledger: Arc<QuotaLedger>,
    cache: Arc<DatasetCache>,
    serve_stale: bool,
}

impl LookupService {
    pub fn new(ledger: Arc<QuotaLedger>, cache: Arc<DatasetCache>, serve_stale: bool) -> Self {
        Self {
            ledger,
            cache,
            serve_stale,
        }
    }

    /// Validate, charge one lookup, make sure the dataset is usable, then search.
    ///
    /// The lookup is charged before the dataset is refreshed and is not given
    /// back when the refresh fails.
    #[instrument(skip(self))]
    pub async fn search(
        &self,
        user_id: i64,
        identifier: &str,
    ) -> Result<SearchResult, LedgerError> {
        let Some(identifier) = validate_identifier(identifier) else {
            return Ok(SearchResult {
                outcome: SearchOutcome::Invalid(InvalidReason::BadIdentifierFormat),
                remaining_searches: None,
            });
        };

        let consumption = self.ledger.consume_one(user_id).await?;
        let charged = |outcome: SearchOutcome| SearchResult {
            outcome,
            remaining_searches: Some(consumption.remaining),
        };

        if !consumption.consumed {
            info!("User {} has no lookups left", user_id);
            return Ok(charged(SearchOutcome::Denied(DenialReason::NoQuota)));
        }

        if let Err(e) = self.cache.ensure_fresh().await {
            let stale_available = self.cache.snapshot().await.is_loaded();
            if !(self.serve_stale && stale_available) {
                warn!("Lookup for user {} failed: {}", user_id, e);
                return Ok(charged(SearchOutcome::Failed(
                    FailureReason::DatasetUnavailable,
                )));
            }
            warn!("Serving stale dataset after refresh failure: {}", e);
        }

        let records = self.cache.snapshot().await.search(identifier);
        info!(
            "User {} looked up an identifier: {} match(es), {} lookups left",
            user_id,
            records.len(),
            consumption.remaining
        );

        if records.is_empty() {
            Ok(charged(SearchOutcome::Empty))
        } else {
            Ok(charged(SearchOutcome::Found(records)))
        }
    }
}
