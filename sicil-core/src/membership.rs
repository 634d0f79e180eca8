//! Group membership gate.
//!
//! The service may require users to belong to a set of chat groups
//! before they can use it. Membership is answered by an external
//! service; any failure to verify counts as "not a member".

use crate::config::MembershipConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Membership request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Membership service rejected the query: {0}")]
    Api(String),
}

/// Answers whether a user belongs to a group
#[async_trait]
pub trait MembershipGate: Send + Sync {
    async fn is_member(&self, user_id: i64, group: &str) -> Result<bool, MembershipError>;
}

/// Groups the user is not (verifiably) a member of, in the order given
pub async fn missing_groups(
    gate: &dyn MembershipGate,
    user_id: i64,
    groups: &[String],
) -> Vec<String> {
    let mut missing = Vec::new();
    for group in groups {
        match gate.is_member(user_id, group).await {
            Ok(true) => {}
            Ok(false) => missing.push(group.clone()),
            Err(e) => {
                warn!("Could not verify user {} in {}: {}", user_id, group, e);
                missing.push(group.clone());
            }
        }
    }
    missing
}

/// Pick the gate matching the configuration
pub fn gate_from_config(
    config: &MembershipConfig,
) -> Result<Arc<dyn MembershipGate>, MembershipError> {
    match (&config.bot_token, config.required_groups.is_empty()) {
        (Some(token), false) => Ok(Arc::new(TelegramGate::new(token.clone())?)),
        _ => Ok(Arc::new(OpenGate)),
    }
}

/// Treats everyone as a member. Used when no groups are required.
pub struct OpenGate;

#[async_trait]
impl MembershipGate for OpenGate {
    async fn is_member(&self, _user_id: i64, _group: &str) -> Result<bool, MembershipError> {
        Ok(true)
    }
}

/// Asks the Telegram Bot API (`getChatMember`)
pub struct TelegramGate {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<ChatMember>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

impl TelegramGate {
    pub fn new(token: impl Into<String>) -> Result<Self, MembershipError> {
        Self::with_api_base(token, "https://api.telegram.org")
    }

    pub fn with_api_base(
        token: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, MembershipError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl MembershipGate for TelegramGate {
    async fn is_member(&self, user_id: i64, group: &str) -> Result<bool, MembershipError> {
        let url = format!("{}/bot{}/getChatMember", self.api_base, self.token);
        let response: ApiResponse = self
            .client
            .get(&url)
            .query(&[("chat_id", group.to_string()), ("user_id", user_id.to_string())])
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(MembershipError::Api(
                response.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let status = response.result.map(|m| m.status).unwrap_or_default();
        debug!("User {} has status '{}' in {}", user_id, status, group);

        Ok(matches!(
            status.as_str(),
            "member" | "administrator" | "creator"
        ))
    }
}
