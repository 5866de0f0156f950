pub mod events;
pub mod orchestrator;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use uuid::Uuid;

/// Cooperative cancellation signal threaded through a run's suspension
/// points. `cancel` is sticky: once set it stays set, and every current and
/// future waiter wakes immediately.
#[derive(Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set. Registers the waiter before checking
    /// the flag so a cancel landing between the two is not lost.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Identity and terminal-state bookkeeping for one analysis run. The
/// orchestrator's slot holds at most one of these; a run that lost the slot
/// to a newer one still settles against its own handle.
pub struct RunHandle {
    pub id: String,
    pub flow_key: String,
    pub selection_name: String,
    pub frame_count: usize,
    pub frame_ids: Vec<String>,
    pub cancel: CancelFlag,
    notified: AtomicBool,
}

impl RunHandle {
    pub fn new(
        flow_key: String,
        selection_name: String,
        frame_count: usize,
        frame_ids: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            flow_key,
            selection_name,
            frame_count,
            frame_ids,
            cancel: CancelFlag::new(),
            notified: AtomicBool::new(false),
        })
    }

    /// Claim the right to emit this run's single terminal notification.
    /// Exactly one caller wins; every later claim returns false.
    pub fn claim_settlement(&self) -> bool {
        !self.notified.swap(true, Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}
