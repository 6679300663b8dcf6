//! Cooperative cancellation.
//!
//! Handlers receive a [`CancelToken`] that fires when the channel
//! closes, the worker begins shutting down, or the originating request
//! times out. Cancellation is always cooperative: nothing is torn down
//! for a handler that ignores its token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable cancellation handle. All clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    // A rendezvous that is never sent on; receivers resolve when every
    // sender is dropped, which `cancel` forces by swapping the slot.
    tx: Arc<parking_lot::Mutex<Option<flume::Sender<()>>>>,
    rx: flume::Receiver<()>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(parking_lot::Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token fires. Resolves immediately if it already
    /// has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // recv fails exactly when the last sender is dropped.
        let _ = self.rx.recv_async().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unfired() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        // Idempotent.
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[compio::test]
    async fn cancelled_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = compio::runtime::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(task.await);
        // Resolves immediately once fired.
        token.cancelled().await;
    }
}
