//! # Sicil Core
//!
//! Core library for Sicil - a quota-metered registry lookup service.
//!
//! This crate provides:
//! - Configuration management
//! - Dataset download, parsing and a coalescing in-memory cache
//! - An identifier index over the loaded records
//! - Quota and referral ledger (SQLite)
//! - Group membership gate
//! - HTTP API server
//! - Shared data models

pub mod config;
pub mod dataset;
pub mod fetcher;
pub mod index;
pub mod ledger;
pub mod lookup;
pub mod membership;
pub mod model;
pub mod referral;
pub mod refresher;
pub mod server;

pub use config::{Config, DatasetConfig, LedgerConfig};
pub use dataset::{CacheStatus, DatasetCache, DatasetRecord, DatasetSnapshot};
pub use fetcher::{DatasetFetcher, FetchError, HttpFetcher};
pub use index::RecordIndex;
pub use ledger::{Consumption, LedgerError, LedgerStats, QuotaLedger, ReferralCredit, UserAccount};
pub use lookup::{LookupService, SearchOutcome, SearchResult};
pub use membership::{gate_from_config, MembershipError, MembershipGate};
pub use model::*;
pub use referral::{InviteStatus, ReferralCoordinator, StartOutcome};
pub use refresher::{RefreshReport, Refresher};
