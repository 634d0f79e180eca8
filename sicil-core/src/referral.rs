//! Referral handling.
//!
//! A user who opens the service through someone else's invite link
//! arrives with a start token naming the referrer. The referrer is
//! credited once per referred user; the ledger decides on the bonus.

use crate::ledger::{LedgerError, QuotaLedger, ReferralCredit, UserAccount};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What happened when a user started a session
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub account: UserAccount,
    /// Referrer named by a well-formed start token
    pub referrer_id: Option<i64>,
    /// The referrer reached the bonus threshold with this start
    pub referrer_bonus_granted: bool,
}

/// Invite progress shown to a user
#[derive(Debug, Clone, Serialize)]
pub struct InviteStatus {
    pub account: UserAccount,
    pub invites_needed: i64,
    pub bonus_amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_link: Option<String>,
}

pub struct ReferralCoordinator {
    ledger: Arc<QuotaLedger>,
    link_prefix: String,
}

impl ReferralCoordinator {
    pub fn new(ledger: Arc<QuotaLedger>, link_prefix: impl Into<String>) -> Self {
        Self {
            ledger,
            link_prefix: link_prefix.into(),
        }
    }

    /// Credit `referrer_id` for bringing in `referred_id`.
    /// Returns whether this credit granted the referrer's bonus.
    #[instrument(skip(self))]
    pub async fn on_referral(&self, referrer_id: i64, referred_id: i64) -> Result<bool, LedgerError> {
        if referrer_id == referred_id {
            debug!("Ignoring self-referral from {}", referrer_id);
            return Ok(false);
        }

        match self.ledger.record_referral(referrer_id, referred_id).await? {
            ReferralCredit::Credited { bonus_granted } => {
                info!("User {} referred user {}", referrer_id, referred_id);
                Ok(bonus_granted)
            }
            ReferralCredit::AlreadyCounted | ReferralCredit::UnknownReferrer => Ok(false),
        }
    }

    /// Handle a session start, optionally carrying a referral token
    #[instrument(skip(self))]
    pub async fn on_start(
        &self,
        user_id: i64,
        start_token: Option<&str>,
    ) -> Result<StartOutcome, LedgerError> {
        let referrer_id = start_token.and_then(parse_start_token);

        let referrer_bonus_granted = match referrer_id {
            Some(referrer_id) => self.on_referral(referrer_id, user_id).await?,
            None => false,
        };

        let account = self.ledger.get_or_create(user_id).await?;

        Ok(StartOutcome {
            account,
            referrer_id,
            referrer_bonus_granted,
        })
    }

    pub async fn invite_status(&self, user_id: i64) -> Result<InviteStatus, LedgerError> {
        let account = self.ledger.get_or_create(user_id).await?;
        let invites_needed = if account.bonus_received {
            0
        } else {
            (self.ledger.bonus_threshold() - account.invited_users).max(0)
        };

        Ok(InviteStatus {
            invites_needed,
            bonus_amount: self.ledger.bonus_amount(),
            invite_link: self.invite_link(user_id),
            account,
        })
    }

    pub fn invite_link(&self, user_id: i64) -> Option<String> {
        if self.link_prefix.is_empty() {
            None
        } else {
            Some(format!("{}{}", self.link_prefix, user_id))
        }
    }
}

/// Parse a referrer id out of a start token. Anything malformed is ignored.
pub fn parse_start_token(token: &str) -> Option<i64> {
    token.trim().parse::<i64>().ok().filter(|id| *id > 0)
}
