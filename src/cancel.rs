//! # Cooperative Cancellation
//!
//! `CancelHandle` is owned by whoever may abort a run (the host, Ctrl-C, a
//! failing sibling stage); `CancelSignal` is the read side passed down into
//! every component that suspends. Signals can be linked so a child operation
//! observes both its own handle and the parent's.

use std::sync::Arc;

use futures::future::{select_all, FutureExt};
use tokio::sync::watch;

use crate::error::PipelineError;

/// Write side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Get a signal observing this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receivers: vec![self.tx.subscribe()],
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of one or more cancellation handles
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { receivers: Vec::new() }
    }

    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    /// Fail with `PipelineError::Cancelled` if the signal has been raised
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A signal that fires when either this signal or `handle` fires
    pub fn linked(&self, handle: &CancelHandle) -> CancelSignal {
        let mut receivers = self.receivers.clone();
        receivers.push(handle.tx.subscribe());
        CancelSignal { receivers }
    }

    /// Resolve once any linked handle is cancelled.
    ///
    /// Cancel-safe: can be recreated on every `select!` iteration. A handle
    /// that is dropped without cancelling never resolves.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }

        let waiters = self.receivers.iter().map(|rx| {
            let mut rx = rx.clone();
            async move {
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            .boxed()
        });

        select_all(waiters).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_handle_and_signal_share_state() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        assert!(!signal.is_cancelled());
        assert!(signal.checkpoint().is_ok());

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(signal.is_cancelled());
        assert!(matches!(signal.checkpoint(), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_linked_signal_observes_both_sides() {
        let parent = CancelHandle::new();
        let sibling = CancelHandle::new();
        let linked = parent.signal().linked(&sibling);

        assert!(!linked.is_cancelled());
        sibling.cancel();
        assert!(linked.is_cancelled());
        assert!(!parent.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let handle = CancelHandle::new();
        let signal = handle.signal();

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cancelled() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
