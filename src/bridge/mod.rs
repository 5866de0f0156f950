pub mod client;
pub mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BridgeSettings;
use crate::credits::AccountStatus;

/// Query parameter carrying the handshake token on the portal URL.
pub const BRIDGE_TOKEN_PARAM: &str = "figmaBridgeToken";

/// Backoff ceiling for failed polls.
pub const MAX_POLL_BACKOFF: Duration = Duration::from_secs(10);

/// Timing knobs of the token lifecycle. Each is independently adjustable on
/// a live store and resettable to these defaults (tests shrink them to
/// millisecond scale).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTiming {
    pub ttl: Duration,
    pub completion_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for BridgeTiming {
    fn default() -> Self {
        BridgeTiming::from(&BridgeSettings::default())
    }
}

impl From<&BridgeSettings> for BridgeTiming {
    fn from(settings: &BridgeSettings) -> Self {
        Self {
            ttl: settings.token_ttl(),
            completion_delay: settings.completion_delay(),
            poll_interval: settings.poll_interval(),
        }
    }
}

/// A freshly created handshake token as returned to the client.
#[derive(Debug, Clone)]
pub struct CreatedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub poll_after: Duration,
}

/// Completion details of a finished handshake. Identical across repeated
/// non-consuming polls of the same token.
#[derive(Debug, Clone)]
pub struct BridgeCompletion {
    pub account_status: AccountStatus,
    pub reason: String,
    pub payload: Value,
    pub expires_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Store-level poll result. `Gone` means the token existed and was already
/// consumed; `NotFound` means it never existed or every trace of it has
/// been garbage-collected, letting clients tell "already used" from "never
/// existed".
#[derive(Debug, Clone)]
pub enum TokenPoll {
    Pending {
        poll_after: Duration,
        expires_at: DateTime<Utc>,
    },
    Completed(BridgeCompletion),
    Expired,
    Gone,
    NotFound,
}

// ── Wire shapes ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub poll_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_status: Option<AccountStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

impl From<&TokenPoll> for PollResponse {
    fn from(poll: &TokenPoll) -> Self {
        let empty = |status: &str| PollResponse {
            status: status.to_string(),
            account_status: None,
            reason: None,
            payload: None,
            expires_at: None,
            completed_at: None,
            consumed_at: None,
            poll_after_ms: None,
        };
        match poll {
            TokenPoll::Pending {
                poll_after,
                expires_at,
            } => PollResponse {
                expires_at: Some(*expires_at),
                poll_after_ms: Some(poll_after.as_millis() as u64),
                ..empty("pending")
            },
            TokenPoll::Completed(completion) => PollResponse {
                account_status: Some(completion.account_status),
                reason: Some(completion.reason.clone()),
                payload: Some(completion.payload.clone()),
                expires_at: Some(completion.expires_at),
                completed_at: Some(completion.completed_at),
                consumed_at: completion.consumed_at,
                ..empty("completed")
            },
            TokenPoll::Expired => empty("expired"),
            TokenPoll::Gone => empty("gone"),
            TokenPoll::NotFound => empty("not_found"),
        }
    }
}

impl PollResponse {
    /// Reconstruct the store-level poll from a wire response (client side).
    pub fn into_poll(self) -> TokenPoll {
        match self.status.as_str() {
            "pending" => TokenPoll::Pending {
                poll_after: Duration::from_millis(self.poll_after_ms.unwrap_or(0)),
                expires_at: self.expires_at.unwrap_or_else(Utc::now),
            },
            "completed" => TokenPoll::Completed(BridgeCompletion {
                account_status: self.account_status.unwrap_or(AccountStatus::Trial),
                reason: self.reason.unwrap_or_default(),
                payload: self.payload.unwrap_or(Value::Null),
                expires_at: self.expires_at.unwrap_or_else(Utc::now),
                completed_at: self.completed_at.unwrap_or_else(Utc::now),
                consumed_at: self.consumed_at,
            }),
            "expired" => TokenPoll::Expired,
            "gone" => TokenPoll::Gone,
            _ => TokenPoll::NotFound,
        }
    }
}
