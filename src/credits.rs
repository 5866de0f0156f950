use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Anonymous,
    Trial,
    Pro,
}

impl AccountStatus {
    pub fn is_paid(&self) -> bool {
        matches!(self, AccountStatus::Trial | AccountStatus::Pro)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "anonymous" => Some(AccountStatus::Anonymous),
            "trial" => Some(AccountStatus::Trial),
            "pro" => Some(AccountStatus::Pro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Anonymous => "anonymous",
            AccountStatus::Trial => "trial",
            AccountStatus::Pro => "pro",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account standing plus remaining free usage. Paid statuses always report
/// `0/0`: gating is bypassed for them, not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditsState {
    pub status: AccountStatus,
    pub total: u32,
    pub remaining: u32,
}

impl CreditsState {
    pub fn for_status(status: AccountStatus, baseline: u32) -> Self {
        if status.is_paid() {
            Self {
                status,
                total: 0,
                remaining: 0,
            }
        } else {
            Self {
                status,
                total: baseline,
                remaining: baseline,
            }
        }
    }
}

/// Persisted snapshot shape under the well-known storage key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreditsSnapshot {
    remaining: u32,
    total: u32,
    account_status: String,
}

/// Raw key-value persistence for the credit snapshot. The ledger owns
/// parsing, so a store only ever sees opaque strings.
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn read(&self) -> Result<Option<String>>;
    async fn write(&self, raw: &str) -> Result<()>;
}

/// File-backed store: one JSON document at `<data_dir>/credits.json`.
pub struct FileCreditStore {
    path: PathBuf,
}

impl FileCreditStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("credits.json"),
        }
    }
}

#[async_trait]
impl CreditStore for FileCreditStore {
    async fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read credits file: {}", self.path.display()))?;
        Ok(Some(content))
    }

    async fn write(&self, raw: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create data directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write credits file: {}", self.path.display()))
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCreditStore {
    raw: Mutex<Option<String>>,
}

impl MemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(raw: &str) -> Self {
        Self {
            raw: Mutex::new(Some(raw.to_string())),
        }
    }
}

#[async_trait]
impl CreditStore for MemoryCreditStore {
    async fn read(&self) -> Result<Option<String>> {
        Ok(self.raw.lock().await.clone())
    }

    async fn write(&self, raw: &str) -> Result<()> {
        *self.raw.lock().await = Some(raw.to_string());
        Ok(())
    }
}

/// Process-durable credit accounting. State loads lazily from the store,
/// every mutation persists before returning, and all transitions keep
/// `remaining <= total`.
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    baseline: u32,
    state: RwLock<CreditsState>,
    loaded: Mutex<bool>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, baseline: u32) -> Self {
        Self {
            store,
            baseline,
            state: RwLock::new(CreditsState::for_status(AccountStatus::Anonymous, baseline)),
            loaded: Mutex::new(false),
        }
    }

    /// Load the persisted snapshot once. A missing snapshot falls back to
    /// the anonymous default; a malformed one additionally rewrites the
    /// default so the store is not left corrupt.
    pub async fn ensure_loaded(&self) -> Result<()> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return Ok(());
        }

        match self.store.read().await? {
            None => {
                tracing::debug!("no persisted credits snapshot, using defaults");
            }
            Some(raw) => match parse_snapshot(&raw) {
                Some(state) => {
                    *self.state.write().await = state;
                    tracing::info!(status = %state.status, remaining = state.remaining, "loaded credits snapshot");
                }
                None => {
                    tracing::warn!("malformed credits snapshot, resetting to defaults");
                    let default = CreditsState::for_status(AccountStatus::Anonymous, self.baseline);
                    *self.state.write().await = default;
                    self.persist(default).await?;
                }
            },
        }

        *loaded = true;
        Ok(())
    }

    pub async fn snapshot(&self) -> CreditsState {
        *self.state.read().await
    }

    pub async fn status(&self) -> AccountStatus {
        self.state.read().await.status
    }

    pub async fn is_paid(&self) -> bool {
        self.status().await.is_paid()
    }

    /// Whether an analysis needing `required` credits is gated. Paid
    /// accounts are never blocked.
    pub async fn is_blocked(&self, required: u32) -> bool {
        let state = self.state.read().await;
        if state.status.is_paid() {
            return false;
        }
        required > state.remaining
    }

    /// Consume up to `frame_count` credits, clamped at zero. Paid accounts
    /// are a no-op. Returns whether anything was actually consumed.
    pub async fn consume(&self, frame_count: u32) -> Result<bool> {
        let updated = {
            let mut state = self.state.write().await;
            if state.status.is_paid() {
                return Ok(false);
            }
            let spent = frame_count.min(state.remaining);
            if spent == 0 {
                return Ok(false);
            }
            state.remaining -= spent;
            *state
        };
        self.persist(updated).await?;
        tracing::info!(remaining = updated.remaining, "consumed analysis credits");
        Ok(true)
    }

    /// Move the account to `next`, recomputing the credit snapshot for the
    /// new standing. Returns whether anything changed, so callers re-sync
    /// dependent state only on true.
    pub async fn set_status(&self, next: AccountStatus, source: &str) -> Result<bool> {
        let updated = {
            let mut state = self.state.write().await;
            if state.status == next {
                return Ok(false);
            }
            *state = CreditsState::for_status(next, self.baseline);
            *state
        };
        self.persist(updated).await?;
        tracing::info!(status = %next, source = %source, "account status changed");
        Ok(true)
    }

    async fn persist(&self, state: CreditsState) -> Result<()> {
        let snapshot = CreditsSnapshot {
            remaining: state.remaining,
            total: state.total,
            account_status: state.status.as_str().to_string(),
        };
        let raw = serde_json::to_string(&snapshot).context("failed to serialize credits")?;
        self.store.write(&raw).await
    }
}

fn parse_snapshot(raw: &str) -> Option<CreditsState> {
    let snapshot: CreditsSnapshot = serde_json::from_str(raw).ok()?;
    let status = AccountStatus::parse(&snapshot.account_status)?;
    if snapshot.remaining > snapshot.total {
        return None;
    }
    Some(CreditsState {
        status,
        total: snapshot.total,
        remaining: snapshot.remaining,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger_with(store: MemoryCreditStore, baseline: u32) -> CreditLedger {
        CreditLedger::new(Arc::new(store), baseline)
    }

    #[tokio::test]
    async fn missing_snapshot_defaults_to_anonymous() {
        let ledger = ledger_with(MemoryCreditStore::new(), 0);
        ledger.ensure_loaded().await.unwrap();

        let state = ledger.snapshot().await;
        assert_eq!(state.status, AccountStatus::Anonymous);
        assert_eq!(state.total, 0);
        assert_eq!(state.remaining, 0);
    }

    #[tokio::test]
    async fn malformed_snapshot_resets_and_rewrites() {
        let store = Arc::new(MemoryCreditStore::seeded("not json at all"));
        let ledger = CreditLedger::new(store.clone(), 2);
        ledger.ensure_loaded().await.unwrap();

        assert_eq!(ledger.snapshot().await.remaining, 2);
        // The corrupt value must have been replaced on disk, not just ignored.
        let rewritten = store.read().await.unwrap().unwrap();
        let reparsed = parse_snapshot(&rewritten).unwrap();
        assert_eq!(reparsed.status, AccountStatus::Anonymous);
        assert_eq!(reparsed.remaining, 2);
    }

    #[tokio::test]
    async fn unknown_status_string_counts_as_malformed() {
        let store = MemoryCreditStore::seeded(r#"{"remaining":1,"total":1,"accountStatus":"vip"}"#);
        let ledger = ledger_with(store, 0);
        ledger.ensure_loaded().await.unwrap();
        assert_eq!(ledger.snapshot().await.status, AccountStatus::Anonymous);
    }

    #[tokio::test]
    async fn snapshot_with_remaining_above_total_is_rejected() {
        let store =
            MemoryCreditStore::seeded(r#"{"remaining":9,"total":3,"accountStatus":"anonymous"}"#);
        let ledger = ledger_with(store, 1);
        ledger.ensure_loaded().await.unwrap();
        assert_eq!(ledger.snapshot().await.remaining, 1);
    }

    #[tokio::test]
    async fn valid_snapshot_round_trips() {
        let store =
            MemoryCreditStore::seeded(r#"{"remaining":1,"total":3,"accountStatus":"anonymous"}"#);
        let ledger = ledger_with(store, 3);
        ledger.ensure_loaded().await.unwrap();

        let state = ledger.snapshot().await;
        assert_eq!(state.remaining, 1);
        assert_eq!(state.total, 3);
    }

    #[tokio::test]
    async fn anonymous_zero_baseline_blocks_any_frames() {
        let ledger = ledger_with(MemoryCreditStore::new(), 0);
        ledger.ensure_loaded().await.unwrap();

        assert!(ledger.is_blocked(1).await);
        assert!(ledger.is_blocked(10).await);
        assert!(!ledger.is_blocked(0).await);
    }

    #[tokio::test]
    async fn paid_accounts_are_never_blocked() {
        let ledger = ledger_with(MemoryCreditStore::new(), 0);
        ledger.ensure_loaded().await.unwrap();
        ledger
            .set_status(AccountStatus::Trial, "test")
            .await
            .unwrap();

        assert!(!ledger.is_blocked(100).await);
        let state = ledger.snapshot().await;
        assert_eq!(state.total, 0);
        assert_eq!(state.remaining, 0);
    }

    #[tokio::test]
    async fn consume_clamps_at_zero_and_persists() {
        let store = Arc::new(MemoryCreditStore::new());
        let ledger = CreditLedger::new(store.clone(), 3);
        ledger.ensure_loaded().await.unwrap();

        assert!(ledger.consume(5).await.unwrap());
        assert_eq!(ledger.snapshot().await.remaining, 0);
        assert!(!ledger.consume(1).await.unwrap());

        let persisted = parse_snapshot(&store.read().await.unwrap().unwrap()).unwrap();
        assert_eq!(persisted.remaining, 0);
        assert_eq!(persisted.total, 3);
    }

    #[tokio::test]
    async fn consume_is_noop_for_paid() {
        let ledger = ledger_with(MemoryCreditStore::new(), 3);
        ledger.ensure_loaded().await.unwrap();
        ledger.set_status(AccountStatus::Pro, "test").await.unwrap();

        assert!(!ledger.consume(4).await.unwrap());
        assert_eq!(ledger.snapshot().await.remaining, 0);
    }

    #[tokio::test]
    async fn set_status_same_value_is_noop() {
        let ledger = ledger_with(MemoryCreditStore::new(), 0);
        ledger.ensure_loaded().await.unwrap();
        assert!(
            !ledger
                .set_status(AccountStatus::Anonymous, "test")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn downgrade_to_anonymous_restores_baseline() {
        let ledger = ledger_with(MemoryCreditStore::new(), 5);
        ledger.ensure_loaded().await.unwrap();
        ledger
            .set_status(AccountStatus::Trial, "test")
            .await
            .unwrap();
        ledger
            .set_status(AccountStatus::Anonymous, "test")
            .await
            .unwrap();

        let state = ledger.snapshot().await;
        assert_eq!(state.remaining, 5);
        assert_eq!(state.total, 5);
    }

    #[tokio::test]
    async fn file_store_round_trips_across_instances() {
        let dir = tempdir().unwrap();

        {
            let ledger = CreditLedger::new(Arc::new(FileCreditStore::new(dir.path())), 4);
            ledger.ensure_loaded().await.unwrap();
            ledger.consume(1).await.unwrap();
        }

        let ledger = CreditLedger::new(Arc::new(FileCreditStore::new(dir.path())), 4);
        ledger.ensure_loaded().await.unwrap();
        assert_eq!(ledger.snapshot().await.remaining, 3);
    }

    #[test]
    fn account_status_parse_and_display() {
        assert_eq!(AccountStatus::parse("trial"), Some(AccountStatus::Trial));
        assert_eq!(AccountStatus::parse(" pro "), Some(AccountStatus::Pro));
        assert_eq!(AccountStatus::parse("TRIAL"), None);
        assert_eq!(AccountStatus::Pro.to_string(), "pro");
    }
}
