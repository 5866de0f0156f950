pub mod cache;
pub mod client;

use serde::Serialize;
use serde_json::Value;

use crate::credits::AccountStatus;

/// Version of the question we ask the analysis service. Bumping this voids
/// every cached answer (see `cache`).
pub const PROMPT_CONTRACT_VERSION: &str = "flow-analysis/3";

/// Top-level keys whose nested object, when populated, makes a response
/// actionable even without summary text or findings lists.
const NESTED_SECTION_KEYS: [&str; 3] = ["copywriting", "accessibility", "confidence"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub frame_id: String,
    pub frame_name: String,
    pub index: usize,
    /// Exported image bytes, base64-encoded for the JSON wire.
    pub image: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub selection_name: String,
    pub frames: Vec<FramePayload>,
    pub metadata: Value,
}

/// A successful, non-empty response from the analysis service.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub payload: Value,
    pub metadata: Value,
    /// Account status the service asked us to apply, when present in
    /// response metadata.
    pub account_status_hint: Option<AccountStatus>,
}

/// Discriminated result produced by the service adapter. Consumers never
/// re-derive emptiness from JSON shape; it is classified exactly once,
/// here.
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    /// Structurally empty: nothing actionable in any recognized field.
    /// Never cached, so the next request re-asks the service.
    Empty,
    Populated(AnalysisResult),
}

impl AnalysisOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, AnalysisOutcome::Empty)
    }
}

/// Classify a raw service response. Populated means: non-empty `summary` or
/// `scope` text, or a non-empty list under any top-level key, or a populated
/// nested object under one of the known section keys.
pub fn classify_response(payload: Value) -> AnalysisOutcome {
    if !is_structurally_empty(&payload) {
        let metadata = payload.get("metadata").cloned().unwrap_or(Value::Null);
        let account_status_hint = metadata
            .get("accountStatus")
            .and_then(Value::as_str)
            .and_then(AccountStatus::parse);
        AnalysisOutcome::Populated(AnalysisResult {
            payload,
            metadata,
            account_status_hint,
        })
    } else {
        AnalysisOutcome::Empty
    }
}

fn is_structurally_empty(payload: &Value) -> bool {
    let Some(obj) = payload.as_object() else {
        return true;
    };

    for key in ["summary", "scope"] {
        if let Some(text) = obj.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return false;
            }
        }
    }

    for (key, value) in obj {
        if let Some(list) = value.as_array() {
            if !list.is_empty() {
                tracing::trace!(key = %key, "response has findings list");
                return false;
            }
        }
    }

    for key in NESTED_SECTION_KEYS {
        if let Some(section) = obj.get(key).and_then(Value::as_object) {
            if !section.is_empty() {
                return false;
            }
        }
    }

    true
}
