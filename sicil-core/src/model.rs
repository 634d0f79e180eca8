//! Shared data models for Sicil.
//!
//! Request and response bodies of the HTTP surface.

use crate::referral::StartOutcome;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lookup request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchRequest {
    pub user_id: i64,
    /// 11-digit national identifier
    pub identifier: String,
}

/// Session start, optionally through an invite link
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartRequest {
    pub user_id: i64,
    #[serde(default)]
    pub start_token: Option<String>,
}

/// Session start response; `missing_groups` lists groups still to join
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    #[serde(flatten)]
    pub outcome: StartOutcome,
    pub missing_groups: Vec<String>,
}

/// Explicit referral credit
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralRequest {
    pub referrer_id: i64,
    pub referred_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralResponse {
    pub bonus_granted: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorDetail {
    pub message: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_groups: Vec<String>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                message: message.into(),
                r#type: error_type.into(),
                code: None,
                missing_groups: Vec::new(),
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }

    pub fn membership_required(missing_groups: Vec<String>) -> Self {
        let mut error = Self::new(
            "Join the required groups before using the service",
            "membership_required",
        );
        error.error.missing_groups = missing_groups;
        error
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(message, "storage_error").with_code("ledger_unavailable")
    }
}
