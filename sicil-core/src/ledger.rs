//! Per-user quota and referral ledger.
//!
//! This module provides SQLite-based bookkeeping of how many lookups each
//! user has left and how many users they invited. Every mutation is a
//! single statement or a write-first transaction, so concurrent requests
//! for the same user serialize on the database write lock while requests
//! for different users never wait on an application-level lock.

use crate::config::LedgerConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::FromRow;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;

/// Errors related to the ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Failed to initialize database: {0}")]
    InitializationError(String),
}

/// A user's quota and referral counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UserAccount {
    pub user_id: i64,
    pub remaining_searches: i64,
    pub invited_users: i64,
    pub total_invites: i64,
    pub bonus_received: bool,
}

/// Result of trying to spend one lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Consumption {
    pub consumed: bool,
    pub remaining: i64,
}

/// Result of crediting a referrer for a specific referred user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReferralCredit {
    Credited { bonus_granted: bool },
    AlreadyCounted,
    /// The referrer has no account, so nothing was recorded
    UnknownReferrer,
}

/// Aggregate ledger figures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub users: i64,
    pub remaining_searches: i64,
    pub total_invites: i64,
    pub bonuses_granted: i64,
}

/// Amounts the ledger hands out
#[derive(Debug, Clone, Copy)]
struct Policy {
    initial_searches: i64,
    bonus_threshold: i64,
    bonus_amount: i64,
}

impl From<&LedgerConfig> for Policy {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            initial_searches: config.initial_searches,
            bonus_threshold: config.bonus_threshold,
            bonus_amount: config.bonus_amount,
        }
    }
}

/// Durable quota/referral bookkeeping
pub struct QuotaLedger {
    pool: SqlitePool,
    policy: Policy,
}

impl QuotaLedger {
    /// Open (or create) the ledger database at the given path
    #[instrument(skip_all)]
    pub async fn new(db_path: &Path, config: &LedgerConfig) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::InitializationError(format!("Failed to create directory: {}", e))
            })?;
        }

        debug!("Connecting to SQLite database at: {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;

        info!("Quota ledger initialized successfully");

        Ok(Self {
            pool,
            policy: Policy::from(config),
        })
    }

    /// Initialize the database schema
    async fn init_schema(pool: &SqlitePool) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                remaining_searches INTEGER DEFAULT 3,
                invited_users INTEGER DEFAULT 0,
                total_invites INTEGER DEFAULT 0,
                bonus_received BOOLEAN DEFAULT FALSE
            )
            "#,
        )
        .execute(pool)
        .await?;

        // One row per referred user a referrer was credited for
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS referrals (
                referrer_id INTEGER NOT NULL,
                referred_id INTEGER NOT NULL,
                credited_at TEXT NOT NULL,
                PRIMARY KEY (referrer_id, referred_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Insert the default row unless it exists. Returns whether it was created.
    async fn insert_default(
        conn: &mut SqliteConnection,
        user_id: i64,
        initial_searches: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (user_id, remaining_searches, invited_users, total_invites, bonus_received)
            VALUES (?, ?, 0, 0, FALSE)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(initial_searches)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_account(
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Option<UserAccount>, sqlx::Error> {
        sqlx::query_as::<_, UserAccount>(
            r#"
            SELECT user_id, remaining_searches, invited_users, total_invites, bonus_received
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(conn)
        .await
    }

    /// Return the user's account, creating it with the default quota on first reference
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, user_id: i64) -> Result<UserAccount, LedgerError> {
        let mut conn = self.pool.acquire().await?;

        if Self::insert_default(&mut conn, user_id, self.policy.initial_searches).await? {
            info!("Created account for user {}", user_id);
        }

        Self::fetch_account(&mut conn, user_id)
            .await?
            .ok_or(LedgerError::Storage(sqlx::Error::RowNotFound))
    }

    /// Read an account without creating it
    pub async fn account(&self, user_id: i64) -> Result<Option<UserAccount>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Ok(Self::fetch_account(&mut conn, user_id).await?)
    }

    /// Spend one lookup if any is left
    #[instrument(skip(self))]
    pub async fn consume_one(&self, user_id: i64) -> Result<Consumption, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_default(&mut conn, user_id, self.policy.initial_searches).await?;

        // The guard and the decrement are one statement
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET remaining_searches = remaining_searches - 1
            WHERE user_id = ? AND remaining_searches > 0
            RETURNING remaining_searches
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(remaining) = remaining {
            debug!("User {} spent a lookup, {} left", user_id, remaining);
            return Ok(Consumption {
                consumed: true,
                remaining,
            });
        }

        let remaining = Self::fetch_account(&mut conn, user_id)
            .await?
            .map(|a| a.remaining_searches)
            .unwrap_or(0);

        Ok(Consumption {
            consumed: false,
            remaining,
        })
    }

    /// Count one invite for the referrer, granting the one-time bonus when due.
    /// Returns whether the bonus was granted by this call.
    #[instrument(skip(self))]
    pub async fn record_invite(&self, referrer_id: i64) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // First statement writes, so the transaction holds the write lock throughout
        Self::insert_default(&mut tx, referrer_id, self.policy.initial_searches).await?;
        let granted = self.apply_invite(&mut tx, referrer_id).await?;

        tx.commit().await?;
        Ok(granted)
    }

    /// Credit `referrer_id` for bringing in `referred_id`, at most once per pair.
    ///
    /// Only an existing account can be credited. Invite links are handed out to
    /// known users, so a start token naming anyone else is ignored.
    #[instrument(skip(self))]
    pub async fn record_referral(
        &self,
        referrer_id: i64,
        referred_id: i64,
    ) -> Result<ReferralCredit, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Write-first: the pair insert takes the write lock and checks the referrer
        let first_time = sqlx::query(
            r#"
            INSERT INTO referrals (referrer_id, referred_id, credited_at)
            SELECT ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM users WHERE user_id = ?)
            ON CONFLICT(referrer_id, referred_id) DO NOTHING
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(Utc::now().to_rfc3339())
        .bind(referrer_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !first_time {
            let known = Self::fetch_account(&mut tx, referrer_id).await?.is_some();
            tx.rollback().await?;

            if !known {
                debug!("Ignoring referral from unknown user {}", referrer_id);
                return Ok(ReferralCredit::UnknownReferrer);
            }
            debug!(
                "Referral {} -> {} was already counted",
                referrer_id, referred_id
            );
            return Ok(ReferralCredit::AlreadyCounted);
        }

        let bonus_granted = self.apply_invite(&mut tx, referrer_id).await?;

        tx.commit().await?;
        Ok(ReferralCredit::Credited { bonus_granted })
    }

    /// Increment both invite counters and grant the bonus once the threshold is reached.
    /// Must run inside a write transaction.
    async fn apply_invite(
        &self,
        conn: &mut SqliteConnection,
        referrer_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let (invited_users, bonus_received): (i64, bool) = sqlx::query_as(
            r#"
            UPDATE users
            SET invited_users = invited_users + 1,
                total_invites = total_invites + 1
            WHERE user_id = ?
            RETURNING invited_users, bonus_received
            "#,
        )
        .bind(referrer_id)
        .fetch_one(&mut *conn)
        .await?;

        debug!("User {} now has {} invites", referrer_id, invited_users);

        if invited_users < self.policy.bonus_threshold || bonus_received {
            return Ok(false);
        }

        let granted = sqlx::query(
            r#"
            UPDATE users
            SET remaining_searches = remaining_searches + ?,
                bonus_received = TRUE
            WHERE user_id = ? AND bonus_received = FALSE
            "#,
        )
        .bind(self.policy.bonus_amount)
        .bind(referrer_id)
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        if granted {
            info!(
                "User {} earned the referral bonus of {} lookups",
                referrer_id, self.policy.bonus_amount
            );
        }

        Ok(granted)
    }

    /// Aggregate figures across all accounts
    pub async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let (users, remaining_searches, total_invites, bonuses_granted): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(remaining_searches), 0),
                    COALESCE(SUM(total_invites), 0),
                    COALESCE(SUM(CASE WHEN bonus_received THEN 1 ELSE 0 END), 0)
                FROM users
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerStats {
            users,
            remaining_searches,
            total_invites,
            bonuses_granted,
        })
    }

    /// Invites needed for the bonus
    pub fn bonus_threshold(&self) -> i64 {
        self.policy.bonus_threshold
    }

    /// Lookups granted by the bonus
    pub fn bonus_amount(&self) -> i64 {
        self.policy.bonus_amount
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// Ledger on a throwaway database; keep the `TempDir` alive for the test's duration
    pub async fn temp_ledger() -> (TempDir, QuotaLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = QuotaLedger::new(&dir.path().join("users.db"), &LedgerConfig::default())
            .await
            .unwrap();
        (dir, ledger)
    }
}
