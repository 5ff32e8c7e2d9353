//! Cancellation signal
//!
//! A single [`Interrupt`] propagates from process entry through every
//! blocking call: the signal watcher trips it, the invoker and review
//! runner select on it, and the loop exits with reason UserInterrupt.

use tokio::sync::watch;
use tracing::debug;

/// Shared stop flag with async wakeup
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: watch::Sender<bool>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request cancellation; idempotent
    pub fn stop(&self) {
        debug!("Interrupt::stop: called");
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without stopping; treat as never-cancelled.
        std::future::pending::<()>().await;
    }
}
