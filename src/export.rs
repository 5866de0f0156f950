use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::selection::FlowFrame;

/// Renders a frame to encoded image bytes. External collaborator: the real
/// implementation lives in the host; tests use canned bytes.
#[async_trait]
pub trait FrameExporter: Send + Sync {
    async fn export(&self, frame: &FlowFrame) -> Result<Vec<u8>>;
}

struct CachedImage {
    version: u64,
    bytes: Vec<u8>,
}

/// Content-addressed cache of exported frame images, keyed by frame id with
/// the mutation version as the staleness check. A version mismatch is a
/// miss; `put` overwrites whatever was stored for that id. No eviction;
/// growth is bounded by the editing session.
#[derive(Default)]
pub struct ExportCache {
    entries: RwLock<HashMap<String, CachedImage>>,
}

impl ExportCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, frame_id: &str, version: u64) -> Option<Vec<u8>> {
        let entries = self.entries.read().await;
        entries
            .get(frame_id)
            .filter(|img| img.version == version)
            .map(|img| img.bytes.clone())
    }

    pub async fn put(&self, frame_id: &str, version: u64, bytes: Vec<u8>) {
        self.entries
            .write()
            .await
            .insert(frame_id.to_string(), CachedImage { version, bytes });
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
