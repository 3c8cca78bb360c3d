//! Handle for a long-running background task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Cancels its tasks on [`Subscription::cancel`] or when dropped.
///
/// The flag is shared with the tasks so a result that arrives after
/// cancellation is discarded instead of applied.
pub struct Subscription {
    canceled: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(canceled: Arc<AtomicBool>, handles: Vec<JoinHandle<()>>) -> Self {
        Self { canceled, handles }
    }

    /// Fresh cancellation flag to hand to the tasks before spawning them.
    pub fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    pub fn cancel(&mut self) {
        self.canceled.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Whether every task has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_aborts_tasks() {
        let canceled = Subscription::flag();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let mut subscription = Subscription::new(canceled.clone(), vec![handle]);

        assert!(!subscription.is_canceled());
        subscription.cancel();
        assert!(subscription.is_canceled());
        assert!(canceled.load(Ordering::SeqCst));
        assert!(subscription.is_finished());
    }

    #[tokio::test]
    async fn test_drop_sets_flag() {
        let canceled = Subscription::flag();
        drop(Subscription::new(canceled.clone(), Vec::new()));
        assert!(canceled.load(Ordering::SeqCst));
    }
}
