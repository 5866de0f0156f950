use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::{BridgeCompletion, BridgeTiming, CreatedToken, TokenPoll};
use crate::credits::AccountStatus;

#[derive(Debug, Clone)]
struct TokenEntry {
    created_at: DateTime<Utc>,
    ready_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    payload: Value,
    account_status: AccountStatus,
    reason: String,
}

/// In-memory registry of one-time handshake tokens.
///
/// A token is `pending` until its ready-at elapses (simulated verification
/// latency), then `completed`; the promotion happens lazily on the next
/// poll. Completed tokens answer repeated non-consuming polls with the same
/// payload until expiry. The first consuming poll deletes the live entry
/// and leaves an expiry-only tombstone, so a second consumption reports
/// `gone` rather than `not_found`. Expired live entries and expired
/// tombstones are garbage-collected on the poll that observes them.
pub struct BridgeTokenStore {
    entries: RwLock<HashMap<String, TokenEntry>>,
    tombstones: RwLock<HashMap<String, DateTime<Utc>>>,
    timing: RwLock<BridgeTiming>,
    defaults: BridgeTiming,
}

impl BridgeTokenStore {
    pub fn new(timing: BridgeTiming) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            timing: RwLock::new(timing),
            defaults: timing,
        }
    }

    pub async fn timing(&self) -> BridgeTiming {
        *self.timing.read().await
    }

    /// Override one timing knob; `None` restores that knob's default.
    pub async fn set_ttl(&self, ttl: Option<Duration>) {
        self.timing.write().await.ttl = ttl.unwrap_or(self.defaults.ttl);
    }

    pub async fn set_completion_delay(&self, delay: Option<Duration>) {
        self.timing.write().await.completion_delay =
            delay.unwrap_or(self.defaults.completion_delay);
    }

    pub async fn set_poll_interval(&self, interval: Option<Duration>) {
        self.timing.write().await.poll_interval =
            interval.unwrap_or(self.defaults.poll_interval);
    }

    /// Drop every token and tombstone. Test isolation hook.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.tombstones.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Mint a new one-time token.
    pub async fn create(&self, analysis_endpoint: Option<String>) -> Result<CreatedToken> {
        let timing = self.timing().await;
        let token = generate_token()?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(timing.ttl).context("token ttl out of range")?;
        let ready_at = now
            + chrono::Duration::from_std(timing.completion_delay)
                .context("completion delay out of range")?;

        let payload = json!({
            "plan": "trial",
            "grantedAt": now,
            "analysisEndpoint": analysis_endpoint,
            "metadata": { "accountStatus": "trial" },
        });

        self.entries.write().await.insert(
            token.clone(),
            TokenEntry {
                created_at: now,
                ready_at,
                expires_at,
                completed_at: None,
                payload,
                account_status: AccountStatus::Trial,
                reason: "auth_bridge".to_string(),
            },
        );

        tracing::info!(token = %token, expires_at = %expires_at, "created bridge token");
        Ok(CreatedToken {
            token,
            expires_at,
            poll_after: timing.poll_interval,
        })
    }

    /// Advance the token's state machine by one observation.
    pub async fn poll(&self, token: &str, consume: bool) -> TokenPoll {
        let now = Utc::now();
        let timing = self.timing().await;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(token) {
            if now >= entry.expires_at {
                entries.remove(token);
                tracing::info!(token = %token, "bridge token expired");
                return TokenPoll::Expired;
            }

            if now < entry.ready_at {
                return TokenPoll::Pending {
                    poll_after: timing.poll_interval,
                    expires_at: entry.expires_at,
                };
            }

            // Lazy pending -> completed promotion.
            if entry.completed_at.is_none() {
                entry.completed_at = Some(now);
                tracing::debug!(
                    token = %token,
                    waited_ms = (now - entry.created_at).num_milliseconds(),
                    "bridge token completed"
                );
            }
            let completed_at = entry.completed_at.unwrap_or(now);

            let mut completion = BridgeCompletion {
                account_status: entry.account_status,
                reason: entry.reason.clone(),
                payload: entry.payload.clone(),
                expires_at: entry.expires_at,
                completed_at,
                consumed_at: None,
            };

            if consume {
                completion.consumed_at = Some(now);
                let expires_at = entry.expires_at;
                entries.remove(token);
                drop(entries);
                self.tombstones
                    .write()
                    .await
                    .insert(token.to_string(), expires_at);
                tracing::info!(token = %token, "bridge token consumed");
            }

            return TokenPoll::Completed(completion);
        }
        drop(entries);

        let mut tombstones = self.tombstones.write().await;
        match tombstones.get(token) {
            Some(expires_at) if now >= *expires_at => {
                tombstones.remove(token);
                TokenPoll::NotFound
            }
            Some(_) => TokenPoll::Gone,
            None => TokenPoll::NotFound,
        }
    }
}

fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes).context("failed to read OS randomness")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
