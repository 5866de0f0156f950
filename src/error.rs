use crate::selection::MAX_FLOW_FRAMES;

/// Errors surfaced by the session orchestrator.
///
/// Input and gating errors are returned before a run starts and mutate no
/// state. Run-phase errors (`ExportFailed`, `Transport`, `MalformedResponse`,
/// `Timeout`) additionally produce an `AnalysisFailed` event. `Cancelled` is
/// a terminal state, not a failure; it never co-occurs with a result or
/// error notification for the same run.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("select at least one frame with exportable content")]
    EmptySelection,

    #[error("select up to {MAX_FLOW_FRAMES} frames for flow analysis")]
    TooManyFrames,

    #[error("out of free analyses: {required} frame(s) requested, {remaining} credit(s) left")]
    CreditsExhausted { required: u32, remaining: u32 },

    #[error("failed to export frame {frame_id}: {message}")]
    ExportFailed { frame_id: String, message: String },

    #[error("analysis request failed: {0}")]
    Transport(String),

    #[error("analysis service returned an unreadable response: {0}")]
    MalformedResponse(String),

    #[error("analysis took too long, try again with fewer frames")]
    Timeout,

    #[error("analysis cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}
