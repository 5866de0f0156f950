use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{AnalysisOutcome, PROMPT_CONTRACT_VERSION};

#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub flow_key: String,
    pub frame_count: usize,
    pub prompt_version: String,
    pub payload: Value,
    pub metadata: Value,
    pub completed_at: DateTime<Utc>,
}

/// In-memory cache of completed analyses keyed by flow key. An entry written
/// under an older prompt contract is dead (the question has changed, so any
/// prior answer is void) and is evicted on lookup. Structurally empty
/// outcomes are never stored: a transient empty upstream response must not
/// be served indefinitely as a final answer.
#[derive(Default)]
pub struct AnalysisCache {
    entries: RwLock<HashMap<String, CachedAnalysis>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, flow_key: &str) -> Option<CachedAnalysis> {
        {
            let entries = self.entries.read().await;
            match entries.get(flow_key) {
                Some(entry) if entry.prompt_version == PROMPT_CONTRACT_VERSION => {
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Stale contract version: evict so the map doesn't accumulate dead
        // entries across contract bumps.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(flow_key) {
            if entry.prompt_version != PROMPT_CONTRACT_VERSION {
                tracing::debug!(flow_key = %flow_key, stale = %entry.prompt_version, "evicting stale analysis");
                entries.remove(flow_key);
            }
        }
        None
    }

    /// Store a completed analysis. Empty outcomes are dropped; returns
    /// whether anything was written.
    pub async fn put(&self, flow_key: &str, frame_count: usize, outcome: &AnalysisOutcome) -> bool {
        let AnalysisOutcome::Populated(result) = outcome else {
            tracing::debug!(flow_key = %flow_key, "skipping cache write for empty analysis");
            return false;
        };
        self.entries.write().await.insert(
            flow_key.to_string(),
            CachedAnalysis {
                flow_key: flow_key.to_string(),
                frame_count,
                prompt_version: PROMPT_CONTRACT_VERSION.to_string(),
                payload: result.payload.clone(),
                metadata: result.metadata.clone(),
                completed_at: Utc::now(),
            },
        );
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    async fn put_with_version(&self, flow_key: &str, result: &super::AnalysisResult, version: &str) {
        self.entries.write().await.insert(
            flow_key.to_string(),
            CachedAnalysis {
                flow_key: flow_key.to_string(),
                frame_count: 1,
                prompt_version: version.to_string(),
                payload: result.payload.clone(),
                metadata: result.metadata.clone(),
                completed_at: Utc::now(),
            },
        );
    }
}
