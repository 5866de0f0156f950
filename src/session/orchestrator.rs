use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::RunHandle;
use super::events::{SessionEvent, StatusReport, StatusWarning};
use crate::analysis::cache::AnalysisCache;
use crate::analysis::client::AnalysisService;
use crate::analysis::{AnalysisOutcome, AnalysisRequest, FramePayload, PROMPT_CONTRACT_VERSION};
use crate::bridge::client::AuthBridgeClient;
use crate::credits::{AccountStatus, CreditLedger};
use crate::error::SessionError;
use crate::export::{ExportCache, FrameExporter};
use crate::selection::{FlowFrame, SelectionSource, flow_key, select_flow_frames};

/// How an analyze call ended when it didn't error.
#[derive(Debug, Clone)]
pub enum AnalyzeCompletion {
    Completed { from_cache: bool, payload: Value },
    Cancelled,
}

/// Top-level session state machine. Composes the frame selector, both
/// caches, the credit ledger, the analysis service and the auth bridge into
/// `analyze` / `cancel` / `sync_selection_status` / `complete_auth_handshake`.
///
/// At most one analysis run owns the active slot at a time. Starting a new
/// run while one is in flight does not queue: the newer run takes the slot
/// and the older one keeps executing in the background, settling against
/// its own handle.
pub struct SessionOrchestrator {
    selection: Arc<dyn SelectionSource>,
    exporter: Arc<dyn FrameExporter>,
    export_cache: Arc<ExportCache>,
    analysis_cache: Arc<AnalysisCache>,
    service: Arc<dyn AnalysisService>,
    ledger: Arc<CreditLedger>,
    bridge: Arc<AuthBridgeClient>,
    events_tx: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<Arc<RunHandle>>>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selection: Arc<dyn SelectionSource>,
        exporter: Arc<dyn FrameExporter>,
        export_cache: Arc<ExportCache>,
        analysis_cache: Arc<AnalysisCache>,
        service: Arc<dyn AnalysisService>,
        ledger: Arc<CreditLedger>,
        bridge: Arc<AuthBridgeClient>,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            selection,
            exporter,
            export_cache,
            analysis_cache,
            service,
            ledger,
            bridge,
            events_tx,
            active: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Recompute and broadcast the current session status. Pure projection:
    /// reads selection, credits and portal URL, mutates nothing.
    pub async fn sync_selection_status(&self) -> StatusReport {
        let selection = self.selection.current();
        let flow = select_flow_frames(&selection);
        let credits = self.ledger.snapshot().await;

        let mut warnings = Vec::new();
        if flow.non_exportable > 0 {
            warnings.push(StatusWarning::NonExportableLayers);
        }
        if flow.over_limit() {
            warnings.push(StatusWarning::FrameLimitExceeded);
        }
        if !flow.is_empty()
            && !credits.status.is_paid()
            && flow.len() as u32 > credits.remaining
        {
            warnings.push(StatusWarning::CreditsInsufficient);
        }

        let analyzing = self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.is_settled());

        let report = StatusReport {
            selection_name: selection.name.clone(),
            frames: flow.preview().to_vec(),
            frame_count: flow.len(),
            warnings,
            credits,
            portal_url: self.bridge.portal_url().await,
            analyzing,
        };
        let _ = self.events_tx.send(SessionEvent::status(report.clone()));
        report
    }

    /// Run one flow analysis end to end. Serves from cache when possible,
    /// otherwise exports frames, sends one request upstream, caches a
    /// populated result and settles with exactly one terminal notification.
    pub async fn analyze(&self) -> Result<AnalyzeCompletion, SessionError> {
        self.ledger
            .ensure_loaded()
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))?;

        let selection = self.selection.current();
        let flow = select_flow_frames(&selection);
        if flow.is_empty() {
            return Err(SessionError::EmptySelection);
        }
        if flow.over_limit() {
            return Err(SessionError::TooManyFrames);
        }

        let key = flow_key(&flow.frames);

        // Cache hit: serve with no network and no credit mutation.
        if let Some(cached) = self.analysis_cache.get(&key).await {
            tracing::info!(flow_key = %key, "serving cached analysis");
            let _ = self.events_tx.send(SessionEvent::AnalysisCompleted {
                run_id: Uuid::new_v4().to_string(),
                flow_key: key,
                from_cache: true,
                payload: cached.payload.clone(),
                timestamp: Utc::now(),
            });
            return Ok(AnalyzeCompletion::Completed {
                from_cache: true,
                payload: cached.payload,
            });
        }

        let frame_count = flow.len() as u32;
        if !self.ledger.is_paid().await && self.ledger.is_blocked(frame_count).await {
            let remaining = self.ledger.snapshot().await.remaining;
            return Err(SessionError::CreditsExhausted {
                required: frame_count,
                remaining,
            });
        }

        let run = RunHandle::new(
            key.clone(),
            selection.name.clone(),
            flow.len(),
            flow.ids(),
        );
        *self.active.lock().await = Some(run.clone());
        tracing::info!(run_id = %run.id, flow_key = %key, frames = flow.len(), "analysis started");
        let _ = self.events_tx.send(SessionEvent::AnalysisStarted {
            run_id: run.id.clone(),
            flow_key: key,
            frame_count: flow.len(),
            timestamp: Utc::now(),
        });

        let outcome = self.run_analysis(&run, &selection.name, &flow.frames).await;
        self.release_slot(&run).await;

        match outcome {
            Ok(payload) => {
                if run.claim_settlement() {
                    let _ = self.events_tx.send(SessionEvent::AnalysisCompleted {
                        run_id: run.id.clone(),
                        flow_key: run.flow_key.clone(),
                        from_cache: false,
                        payload: payload.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Ok(AnalyzeCompletion::Completed {
                    from_cache: false,
                    payload,
                })
            }
            Err(SessionError::Cancelled) => {
                if run.claim_settlement() {
                    tracing::info!(run_id = %run.id, "analysis cancelled");
                    let _ = self.events_tx.send(SessionEvent::AnalysisCancelled {
                        run_id: run.id.clone(),
                        flow_key: run.flow_key.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Ok(AnalyzeCompletion::Cancelled)
            }
            Err(e) => {
                if run.claim_settlement() {
                    tracing::error!(run_id = %run.id, error = %e, "analysis failed");
                    let _ = self.events_tx.send(SessionEvent::AnalysisFailed {
                        run_id: run.id.clone(),
                        flow_key: run.flow_key.clone(),
                        message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_analysis(
        &self,
        run: &Arc<RunHandle>,
        selection_name: &str,
        frames: &[FlowFrame],
    ) -> Result<Value, SessionError> {
        let mut payloads = Vec::with_capacity(frames.len());
        for frame in frames {
            let bytes = match self.export_cache.get(&frame.id, frame.version).await {
                Some(bytes) => bytes,
                None => {
                    let bytes = self.exporter.export(frame).await.map_err(|e| {
                        SessionError::ExportFailed {
                            frame_id: frame.id.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    self.export_cache
                        .put(&frame.id, frame.version, bytes.clone())
                        .await;
                    bytes
                }
            };
            payloads.push(FramePayload {
                frame_id: frame.id.clone(),
                frame_name: frame.name.clone(),
                index: frame.index,
                image: STANDARD.encode(&bytes),
                metadata: json!({ "version": frame.version }),
            });
        }

        // Checkpoint: a cancel during export aborts before any network.
        if run.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let request = AnalysisRequest {
            selection_name: selection_name.to_string(),
            frames: payloads,
            metadata: json!({
                "promptVersion": PROMPT_CONTRACT_VERSION,
                "flowKey": run.flow_key,
                "runId": run.id,
            }),
        };
        let outcome = self.service.analyze(&request, &run.cancel).await?;

        // Checkpoint: the response may have raced a cancel.
        if run.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        self.analysis_cache
            .put(&run.flow_key, frames.len(), &outcome)
            .await;

        let payload = match &outcome {
            AnalysisOutcome::Populated(result) => {
                if let Some(hint) = result.account_status_hint {
                    self.apply_account_status(hint, "analysis_response").await;
                }
                result.payload.clone()
            }
            AnalysisOutcome::Empty => {
                tracing::warn!(flow_key = %run.flow_key, "analysis returned no findings");
                json!({})
            }
        };

        if let Err(e) = self.ledger.consume(frames.len() as u32).await {
            tracing::warn!(error = %e, "failed to persist credit consumption");
        }

        Ok(payload)
    }

    /// Flag the active run as cancelled and abort its in-flight request. A
    /// cancel landing after the run settled is a no-op.
    pub async fn cancel(&self) {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) if run.is_settled() => {
                tracing::debug!(run_id = %run.id, "cancel after run settled, ignoring");
            }
            Some(run) => {
                tracing::info!(run_id = %run.id, "cancel requested");
                run.cancel.cancel();
            }
            None => {
                tracing::debug!("cancel with no active run");
            }
        }
    }

    /// Apply a completed handshake's account status. Shared entry point for
    /// the bridge client's poll loop and a host UI that received the
    /// completion payload by other means.
    pub async fn complete_auth_handshake(
        &self,
        status: AccountStatus,
        source: &str,
    ) -> Result<(), SessionError> {
        self.ledger
            .set_status(status, source)
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))
            .map(|changed| {
                if changed {
                    let _ = self.events_tx.send(SessionEvent::account_changed(status, source));
                }
            })
    }

    async fn apply_account_status(&self, status: AccountStatus, source: &str) {
        match self.ledger.set_status(status, source).await {
            Ok(true) => {
                let _ = self.events_tx.send(SessionEvent::account_changed(status, source));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to apply account status hint");
            }
        }
    }

    async fn release_slot(&self, run: &Arc<RunHandle>) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|current| current.id == run.id) {
            *active = None;
        }
    }
}
