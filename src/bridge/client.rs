use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;

use super::store::BridgeTokenStore;
use super::{
    BRIDGE_TOKEN_PARAM, BridgeCompletion, CreateTokenRequest, CreateTokenResponse, CreatedToken,
    MAX_POLL_BACKOFF, PollResponse, TokenPoll,
};
use crate::credits::{AccountStatus, CreditLedger};
use crate::session::events::SessionEvent;

/// Bytes that must be escaped inside a query value. Deliberately narrow so
/// URL-safe token alphabets pass through unchanged.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// Floor for the delay before the first poll after the portal opens.
const MIN_FIRST_POLL_DELAY: Duration = Duration::from_millis(50);

/// How the client reaches the token store: over HTTP in production, or
/// directly in-process for tests and same-process local development.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn create_token(&self, analysis_endpoint: Option<String>) -> Result<CreatedToken>;
    async fn poll(&self, token: &str, consume: bool) -> Result<TokenPoll>;
}

pub struct HttpBridgeTransport {
    client: Arc<reqwest::Client>,
    base_url: String,
}

impl HttpBridgeTransport {
    pub fn new(client: Arc<reqwest::Client>, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BridgeTransport for HttpBridgeTransport {
    async fn create_token(&self, analysis_endpoint: Option<String>) -> Result<CreatedToken> {
        let response: CreateTokenResponse = self
            .client
            .post(format!("{}/api/figma/auth-bridge", self.base_url))
            .json(&CreateTokenRequest { analysis_endpoint })
            .send()
            .await
            .context("bridge token creation request failed")?
            .error_for_status()
            .context("bridge token creation rejected")?
            .json()
            .await
            .context("failed to parse bridge token response")?;

        Ok(CreatedToken {
            token: response.token,
            expires_at: response.expires_at,
            poll_after: Duration::from_millis(response.poll_after_ms),
        })
    }

    async fn poll(&self, token: &str, consume: bool) -> Result<TokenPoll> {
        let response = self
            .client
            .get(format!("{}/api/figma/auth-bridge/{token}", self.base_url))
            .query(&[("consume", if consume { "1" } else { "0" })])
            .send()
            .await
            .context("bridge poll request failed")?;

        // 404/410 are protocol states, not transport failures; the body
        // status keeps expired and gone distinguishable.
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(TokenPoll::NotFound);
        }
        if status == reqwest::StatusCode::GONE {
            let body: PollResponse = response
                .json()
                .await
                .unwrap_or_else(|_| PollResponse::from(&TokenPoll::Gone));
            return Ok(body.into_poll());
        }

        let body: PollResponse = response
            .error_for_status()
            .context("bridge poll rejected")?
            .json()
            .await
            .context("failed to parse bridge poll response")?;
        Ok(body.into_poll())
    }
}

/// In-process transport straight to the store. Used by tests and when the
/// portal server runs inside the same process.
pub struct LocalBridgeTransport {
    store: Arc<BridgeTokenStore>,
}

impl LocalBridgeTransport {
    pub fn new(store: Arc<BridgeTokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BridgeTransport for LocalBridgeTransport {
    async fn create_token(&self, analysis_endpoint: Option<String>) -> Result<CreatedToken> {
        self.store.create(analysis_endpoint).await
    }

    async fn poll(&self, token: &str, consume: bool) -> Result<TokenPoll> {
        Ok(self.store.poll(token, consume).await)
    }
}

struct BridgeState {
    token: String,
    expires_at: DateTime<Utc>,
    poll_interval: Duration,
    portal_opened_at: Option<DateTime<Utc>>,
    failures: u32,
}

/// State shared between the client facade and its spawned poll task.
struct BridgeInner {
    transport: Arc<dyn BridgeTransport>,
    ledger: Arc<CreditLedger>,
    events_tx: broadcast::Sender<SessionEvent>,
    portal_base: String,
    analysis_endpoint: String,
    poll_interval: Duration,
    max_poll_failures: u32,
    state: Mutex<Option<BridgeState>>,
    portal_url: RwLock<String>,
}

impl BridgeInner {
    async fn tracked_interval(&self) -> Duration {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.poll_interval)
            .unwrap_or(self.poll_interval)
    }

    /// Returns the new failure count, or None when bridge state is already
    /// torn down.
    async fn bump_failures(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        let state = state.as_mut()?;
        state.failures += 1;
        Some(state.failures)
    }

    async fn finalize_completion(&self, completion: BridgeCompletion) {
        let opened_at = self.state.lock().await.as_ref().and_then(|s| s.portal_opened_at);
        if let Some(opened_at) = opened_at {
            tracing::debug!(
                elapsed_ms = (Utc::now() - opened_at).num_milliseconds(),
                "handshake round trip finished"
            );
        }

        // A status embedded in the payload metadata wins over the top-level
        // field so the server can steer the grant.
        let status = completion
            .payload
            .get("metadata")
            .and_then(|m| m.get("accountStatus"))
            .and_then(Value::as_str)
            .and_then(AccountStatus::parse)
            .unwrap_or(completion.account_status);

        match self.ledger.set_status(status, "auth_bridge").await {
            Ok(true) => {
                tracing::info!(status = %status, "auth handshake completed");
                let _ = self
                    .events_tx
                    .send(SessionEvent::account_changed(status, "auth_bridge"));
            }
            Ok(false) => {
                tracing::debug!(status = %status, "auth handshake completed, status unchanged");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist account status from handshake");
            }
        }

        self.reset_state(false).await;
    }

    /// Clear bridge state; unless retained, the exposed portal URL reverts
    /// to its token-less base.
    async fn reset_state(&self, retain_portal_url: bool) {
        *self.state.lock().await = None;
        if !retain_portal_url {
            *self.portal_url.write().await = self.portal_base.clone();
        }
    }
}

/// Client half of the auth handshake: mints a token, derives the portal
/// URL, and polls the store until completion, expiry, or failure
/// exhaustion. Promotion is best-effort: every failure path logs and
/// tears down without surfacing an error to the analysis flow.
pub struct AuthBridgeClient {
    inner: Arc<BridgeInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthBridgeClient {
    pub fn new(
        transport: Arc<dyn BridgeTransport>,
        ledger: Arc<CreditLedger>,
        events_tx: broadcast::Sender<SessionEvent>,
        portal_base: String,
        analysis_endpoint: String,
        poll_interval: Duration,
        max_poll_failures: u32,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                transport,
                ledger,
                events_tx,
                portal_url: RwLock::new(portal_base.clone()),
                portal_base,
                analysis_endpoint,
                poll_interval,
                max_poll_failures,
                state: Mutex::new(None),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// The URL the UI should open. Token-less base until a handshake is
    /// prepared.
    pub async fn portal_url(&self) -> String {
        self.inner.portal_url.read().await.clone()
    }

    /// Create a handshake token (or reuse the unexpired one) and return the
    /// portal URL carrying it. The state lock is held across the creation
    /// await, so concurrent callers share a single in-flight creation
    /// instead of racing duplicates.
    pub async fn prepare_portal_url(&self) -> Result<String> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if let Some(existing) = state.as_ref() {
            if Utc::now() < existing.expires_at {
                return Ok(inner.portal_url.read().await.clone());
            }
            tracing::debug!(token = %existing.token, "bridge token expired, minting a fresh one");
        }

        let created = inner
            .transport
            .create_token(Some(inner.analysis_endpoint.clone()))
            .await
            .context("failed to create bridge token")?;

        let url = set_query_param(&inner.portal_base, BRIDGE_TOKEN_PARAM, &created.token);
        *inner.portal_url.write().await = url.clone();

        let poll_interval = if created.poll_after.is_zero() {
            inner.poll_interval
        } else {
            created.poll_after
        };
        *state = Some(BridgeState {
            token: created.token,
            expires_at: created.expires_at,
            poll_interval,
            portal_opened_at: None,
            failures: 0,
        });

        Ok(url)
    }

    /// Called when the UI reports the portal link was activated. A genuine
    /// open starts the polling loop; against a local analysis endpoint the
    /// account is additionally promoted to trial on the spot, since no real
    /// round trip is needed when developing against a local server.
    pub async fn handle_portal_opened(&self, portal_opened: bool) -> Result<()> {
        if !portal_opened {
            tracing::debug!("portal link not actually opened, skipping bridge poll");
            return Ok(());
        }

        let (token, first_delay) = {
            let mut state = self.inner.state.lock().await;
            let Some(state) = state.as_mut() else {
                tracing::warn!("portal opened without a prepared bridge token");
                return Ok(());
            };
            state.portal_opened_at = Some(Utc::now());
            (
                state.token.clone(),
                state.poll_interval.max(MIN_FIRST_POLL_DELAY),
            )
        };

        if is_local_endpoint(&self.inner.analysis_endpoint) && !self.inner.ledger.is_paid().await {
            tracing::info!(
                endpoint = %self.inner.analysis_endpoint,
                "local analysis endpoint, promoting to trial immediately"
            );
            if self
                .inner
                .ledger
                .set_status(AccountStatus::Trial, "local_dev")
                .await?
            {
                let _ = self
                    .inner
                    .events_tx
                    .send(SessionEvent::account_changed(AccountStatus::Trial, "local_dev"));
            }
        }

        let handle = tokio::spawn(poll_loop(self.inner.clone(), token, first_delay));
        if let Some(previous) = self.poll_task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop polling from outside the poll task (aborts the timer) and clear
    /// bridge state.
    pub async fn cancel_polling(&self, retain_portal_url: bool) {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        self.inner.reset_state(retain_portal_url).await;
    }
}

// ── Poll loop ────────────────────────────────────────────────────

async fn poll_loop(inner: Arc<BridgeInner>, token: String, first_delay: Duration) {
    let mut delay = first_delay;
    loop {
        tokio::time::sleep(delay).await;

        match inner.transport.poll(&token, true).await {
            Ok(TokenPoll::Pending { poll_after, .. }) => {
                delay = if poll_after.is_zero() {
                    inner.tracked_interval().await
                } else {
                    poll_after
                };
            }
            Ok(TokenPoll::Completed(completion)) => {
                inner.finalize_completion(completion).await;
                return;
            }
            Ok(terminal @ (TokenPoll::Expired | TokenPoll::Gone | TokenPoll::NotFound)) => {
                tracing::info!(token = %token, state = ?terminal, "bridge token gone, stopping poll");
                inner.reset_state(false).await;
                return;
            }
            Err(e) => {
                let Some(failures) = inner.bump_failures().await else {
                    return;
                };
                if failures >= inner.max_poll_failures {
                    tracing::warn!(error = %e, failures, "giving up on bridge polling");
                    inner.reset_state(false).await;
                    return;
                }
                delay = poll_backoff(inner.tracked_interval().await, failures);
                tracing::warn!(error = %e, failures, retry_in = ?delay, "bridge poll failed, backing off");
            }
        }
    }
}

/// Backoff after `failures` consecutive poll errors: linear in the tracked
/// interval, capped.
fn poll_backoff(interval: Duration, failures: u32) -> Duration {
    interval
        .saturating_mul(failures.saturating_add(1))
        .min(MAX_POLL_BACKOFF)
}

fn is_local_endpoint(endpoint: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    match url.host_str() {
        Some(host) => {
            host == "localhost"
                || host == "127.0.0.1"
                || host == "::1"
                || host == "[::1]"
                || host.ends_with(".local")
        }
        None => false,
    }
}

/// Set `key=value` on a URL, replacing any prior occurrence of the key.
fn set_query_param(url: &str, key: &str, value: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let mut pairs: Vec<String> = query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(key))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let encoded = utf8_percent_encode(value, QUERY_VALUE).to_string();
    pairs.push(format!("{key}={encoded}"));
    format!("{base}?{}", pairs.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::MemoryCreditStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct MockTransport {
        create_count: AtomicUsize,
        create_delay: Duration,
        polls: Mutex<VecDeque<Result<TokenPoll>>>,
    }

    impl MockTransport {
        fn new(polls: Vec<Result<TokenPoll>>) -> Self {
            Self {
                create_count: AtomicUsize::new(0),
                create_delay: Duration::from_millis(10),
                polls: Mutex::new(polls.into()),
            }
        }

        fn created(&self) -> usize {
            self.create_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BridgeTransport for MockTransport {
        async fn create_token(&self, _analysis_endpoint: Option<String>) -> Result<CreatedToken> {
            sleep(self.create_delay).await;
            let n = self.create_count.fetch_add(1, Ordering::SeqCst);
            Ok(CreatedToken {
                token: format!("tok-{n}"),
                expires_at: Utc::now() + chrono::Duration::seconds(60),
                poll_after: Duration::from_millis(10),
            })
        }

        async fn poll(&self, _token: &str, _consume: bool) -> Result<TokenPoll> {
            self.polls
                .lock()
                .await
                .pop_front()
                .unwrap_or(Ok(TokenPoll::NotFound))
        }
    }

    fn completion(status: AccountStatus) -> TokenPoll {
        TokenPoll::Completed(BridgeCompletion {
            account_status: status,
            reason: "auth_bridge".into(),
            payload: serde_json::json!({}),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            completed_at: Utc::now(),
            consumed_at: Some(Utc::now()),
        })
    }

    fn client_with(
        transport: Arc<MockTransport>,
        endpoint: &str,
        max_failures: u32,
    ) -> (
        Arc<AuthBridgeClient>,
        Arc<CreditLedger>,
        broadcast::Receiver<SessionEvent>,
    ) {
        let ledger = Arc::new(CreditLedger::new(Arc::new(MemoryCreditStore::new()), 0));
        let (events_tx, events_rx) = broadcast::channel(16);
        let client = Arc::new(AuthBridgeClient::new(
            transport,
            ledger.clone(),
            events_tx,
            "http://localhost:8081/auth-portal".into(),
            endpoint.into(),
            Duration::from_millis(10),
            max_failures,
        ));
        (client, ledger, events_rx)
    }

    #[tokio::test]
    async fn portal_url_carries_token_param() {
        let transport = Arc::new(MockTransport::new(vec![]));
        let (client, _, _) = client_with(transport, "https://analysis.example.com/api", 5);

        let url = client.prepare_portal_url().await.unwrap();
        assert_eq!(
            url,
            "http://localhost:8081/auth-portal?figmaBridgeToken=tok-0"
        );
        assert_eq!(client.portal_url().await, url);
    }

    #[tokio::test]
    async fn unexpired_token_is_reused() {
        let transport = Arc::new(MockTransport::new(vec![]));
        let (client, _, _) = client_with(transport.clone(), "https://analysis.example.com", 5);

        let first = client.prepare_portal_url().await.unwrap();
        let second = client.prepare_portal_url().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.created(), 1);
    }

    #[tokio::test]
    async fn concurrent_prepare_shares_one_creation() {
        let transport = Arc::new(MockTransport::new(vec![]));
        let (client, _, _) = client_with(transport.clone(), "https://analysis.example.com", 5);

        let a = {
            let client = client.clone();
            tokio::spawn(async move { client.prepare_portal_url().await.unwrap() })
        };
        let b = {
            let client = client.clone();
            tokio::spawn(async move { client.prepare_portal_url().await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a, b);
        assert_eq!(transport.created(), 1);
    }

    #[tokio::test]
    async fn completion_promotes_account_and_resets_url() {
        let transport = Arc::new(MockTransport::new(vec![
            Ok(TokenPoll::Pending {
                poll_after: Duration::from_millis(5),
                expires_at: Utc::now() + chrono::Duration::seconds(60),
            }),
            Ok(completion(AccountStatus::Trial)),
        ]));
        let (client, ledger, mut events) =
            client_with(transport, "https://analysis.example.com/api", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("expected account event")
            .unwrap();
        assert_eq!(event.kind(), "account_changed");
        assert_eq!(ledger.status().await, AccountStatus::Trial);

        // Poll task settled: portal URL back to its token-less base.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(client.portal_url().await, "http://localhost:8081/auth-portal");
    }

    #[tokio::test]
    async fn portal_not_opened_does_not_poll() {
        let transport = Arc::new(MockTransport::new(vec![Ok(completion(
            AccountStatus::Trial,
        ))]));
        let (client, ledger, _) = client_with(transport, "https://analysis.example.com", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(false).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(ledger.status().await, AccountStatus::Anonymous);
    }

    #[tokio::test]
    async fn local_endpoint_promotes_immediately() {
        let transport = Arc::new(MockTransport::new(vec![Ok(completion(
            AccountStatus::Trial,
        ))]));
        let (client, ledger, mut events) = client_with(transport, "http://127.0.0.1:4000/api", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();

        // Promotion happens before the first poll fires.
        assert_eq!(ledger.status().await, AccountStatus::Trial);
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind(), "account_changed");
    }

    #[tokio::test]
    async fn terminal_gone_stops_polling_without_failures() {
        let transport = Arc::new(MockTransport::new(vec![Ok(TokenPoll::Gone)]));
        let (client, ledger, _) = client_with(transport, "https://analysis.example.com", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(ledger.status().await, AccountStatus::Anonymous);
        assert_eq!(client.portal_url().await, "http://localhost:8081/auth-portal");
    }

    #[tokio::test]
    async fn gives_up_after_max_failures() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(anyhow::anyhow!("connection refused")),
            Err(anyhow::anyhow!("connection refused")),
            Ok(completion(AccountStatus::Trial)),
        ]));
        let (client, ledger, _) = client_with(transport, "https://analysis.example.com", 2);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        // Gave up before reaching the queued completion.
        assert_eq!(ledger.status().await, AccountStatus::Anonymous);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_recover() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(anyhow::anyhow!("flaky")),
            Ok(completion(AccountStatus::Trial)),
        ]));
        let (client, ledger, _) = client_with(transport, "https://analysis.example.com", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(ledger.status().await, AccountStatus::Trial);
    }

    #[tokio::test]
    async fn cancel_polling_aborts_and_resets() {
        let transport = Arc::new(MockTransport::new(vec![Ok(TokenPoll::Pending {
            poll_after: Duration::from_millis(5),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        })]));
        let (client, ledger, _) = client_with(transport, "https://analysis.example.com", 5);
        ledger.ensure_loaded().await.unwrap();

        client.prepare_portal_url().await.unwrap();
        client.handle_portal_opened(true).await.unwrap();
        client.cancel_polling(false).await;

        assert_eq!(client.portal_url().await, "http://localhost:8081/auth-portal");
        // A fresh prepare mints a new token.
        let url = client.prepare_portal_url().await.unwrap();
        assert!(url.contains("figmaBridgeToken=tok-1"));
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let interval = Duration::from_secs(2);
        assert_eq!(poll_backoff(interval, 1), Duration::from_secs(4));
        assert_eq!(poll_backoff(interval, 2), Duration::from_secs(6));
        assert_eq!(poll_backoff(interval, 100), MAX_POLL_BACKOFF);
    }

    #[test]
    fn local_endpoint_detection() {
        assert!(is_local_endpoint("http://localhost:4000/api"));
        assert!(is_local_endpoint("http://127.0.0.1:4000/api"));
        assert!(is_local_endpoint("http://analysis.local/api"));
        assert!(!is_local_endpoint("https://analysis.example.com/api"));
        assert!(!is_local_endpoint("not a url"));
    }

    #[test]
    fn set_query_param_replaces_prior_occurrence() {
        let url = set_query_param(
            "http://localhost:8081/auth-portal?figmaBridgeToken=old&theme=dark",
            BRIDGE_TOKEN_PARAM,
            "new token",
        );
        assert_eq!(
            url,
            "http://localhost:8081/auth-portal?theme=dark&figmaBridgeToken=new%20token"
        );
    }

    #[test]
    fn set_query_param_on_bare_url() {
        let url = set_query_param("http://localhost:8081/p", BRIDGE_TOKEN_PARAM, "abc_-123");
        assert_eq!(url, "http://localhost:8081/p?figmaBridgeToken=abc_-123");
    }
}
