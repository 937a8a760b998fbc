//! [`OperationCounter`] tracks in-flight `load_async` calls so a caller can poll for quiescence
//! before shutting its runtime down; [`StatusUpdate`]/[`StatusSender`] carry the zero-or-more
//! progress notifications a handler emits before its final callback fires.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::model::{ErrorMessage, ProgressTag};

/// One message on a request's status stream.
pub type StatusUpdate = Result<ProgressTag, ErrorMessage>;

/// The sending half of a request's status stream, handed to a handler at dispatch time.
pub type StatusSender = mpsc::UnboundedSender<StatusUpdate>;

/// The receiving half, handed back to the caller of `load_async`.
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusUpdate>;

/// Creates a fresh status channel for one request.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}

/// Process-wide (or per-`Dispatcher`) count of in-flight `load_async` operations.
///
/// Incremented before dispatch, decremented exactly once when a request's final callback fires —
/// on the success path and on every failure path alike. Callers poll [`OperationCounter::get`] to
/// decide when it is safe to stop driving the shared runtime.
#[derive(Debug, Clone, Default)]
pub struct OperationCounter(Arc<AtomicI64>);

impl OperationCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter. Panics in debug builds if this would take the counter negative —
    /// that would mean a final callback fired twice for the same dispatch, violating the
    /// exactly-once invariant every handler must uphold.
    pub fn decrement(&self) {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(
            previous > 0,
            "OperationCounter went negative: a final callback fired more than once"
        );
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_quiescent(&self) -> bool {
        self.get() == 0
    }

    /// RAII guard that decrements on drop, so a handler cannot forget to decrement on an early
    /// return or a panicking branch.
    pub fn guard(&self) -> OperationGuard {
        self.increment();
        OperationGuard {
            counter: self.clone(),
            armed: true,
        }
    }
}

/// Decrements its [`OperationCounter`] exactly once, on drop, unless [`OperationGuard::disarm`]
/// was called first (for call sites that manage the decrement themselves).
pub struct OperationGuard {
    counter: OperationCounter,
    armed: bool,
}

impl OperationGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.counter.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_returns_to_zero_after_guard_drops() {
        let counter = OperationCounter::new();
        assert!(counter.is_quiescent());
        {
            let _guard = counter.guard();
            assert_eq!(counter.get(), 1);
        }
        assert!(counter.is_quiescent());
    }

    #[test]
    fn disarmed_guard_does_not_double_decrement() {
        let counter = OperationCounter::new();
        let guard = counter.guard();
        counter.decrement();
        guard.disarm();
        assert!(counter.is_quiescent());
    }

    #[tokio::test]
    async fn status_channel_delivers_updates_in_order() {
        let (tx, mut rx) = status_channel();
        tx.send(Ok(ProgressTag("resolving"))).unwrap();
        tx.send(Ok(ProgressTag("completed"))).unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(Ok(ProgressTag("resolving"))));
        assert_eq!(rx.recv().await, Some(Ok(ProgressTag("completed"))));
        assert_eq!(rx.recv().await, None);
    }
}
