use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{AnalysisOutcome, AnalysisRequest, classify_response};
use crate::error::SessionError;
use crate::session::CancelFlag;

/// The upstream analysis call. One request per flow; the adapter owns
/// timeout and cancellation so callers only see the typed outcome.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancelFlag,
    ) -> Result<AnalysisOutcome, SessionError>;
}

pub struct HttpAnalysisService {
    client: Arc<reqwest::Client>,
    endpoint: String,
    timeout: Duration,
}

impl HttpAnalysisService {
    pub fn new(client: Arc<reqwest::Client>, endpoint: String, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: &AnalysisRequest) -> Result<Value, SessionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| SessionError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancelFlag,
    ) -> Result<AnalysisOutcome, SessionError> {
        tracing::info!(
            endpoint = %self.endpoint,
            frames = request.frames.len(),
            "sending analysis request"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.send(request)) => match result {
                Err(_) => {
                    tracing::warn!(endpoint = %self.endpoint, timeout = ?self.timeout, "analysis request timed out");
                    Err(SessionError::Timeout)
                }
                Ok(Ok(payload)) => Ok(classify_response(payload)),
                Ok(Err(e)) => Err(e),
            }
        }
    }
}
