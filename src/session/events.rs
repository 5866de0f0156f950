use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::credits::{AccountStatus, CreditsState};
use crate::selection::FlowFrame;

/// Projection of the current session state, emitted by `sync_selection_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub selection_name: String,
    /// Preview of the flow, truncated to the frame bound.
    pub frames: Vec<FlowFrame>,
    /// Full exportable frame count (may exceed the preview length).
    pub frame_count: usize,
    pub warnings: Vec<StatusWarning>,
    pub credits: CreditsState,
    pub portal_url: String,
    pub analyzing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusWarning {
    NonExportableLayers,
    FrameLimitExceeded,
    CreditsInsufficient,
}

/// Notifications pushed to the host UI over the session's broadcast
/// channel. Every analysis run ends in exactly one of `AnalysisCompleted`,
/// `AnalysisCancelled`, or `AnalysisFailed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        report: StatusReport,
        timestamp: DateTime<Utc>,
    },
    AnalysisStarted {
        run_id: String,
        flow_key: String,
        frame_count: usize,
        timestamp: DateTime<Utc>,
    },
    AnalysisCompleted {
        run_id: String,
        flow_key: String,
        from_cache: bool,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    AnalysisCancelled {
        run_id: String,
        flow_key: String,
        timestamp: DateTime<Utc>,
    },
    AnalysisFailed {
        run_id: String,
        flow_key: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    AccountChanged {
        status: AccountStatus,
        source: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn status(report: StatusReport) -> Self {
        SessionEvent::Status {
            report,
            timestamp: Utc::now(),
        }
    }

    pub fn account_changed(status: AccountStatus, source: &str) -> Self {
        SessionEvent::AccountChanged {
            status,
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Status { .. } => "status",
            SessionEvent::AnalysisStarted { .. } => "analysis_started",
            SessionEvent::AnalysisCompleted { .. } => "analysis_completed",
            SessionEvent::AnalysisCancelled { .. } => "analysis_cancelled",
            SessionEvent::AnalysisFailed { .. } => "analysis_failed",
            SessionEvent::AccountChanged { .. } => "account_changed",
        }
    }
}
