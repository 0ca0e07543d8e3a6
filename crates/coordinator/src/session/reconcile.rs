//! Debounced snapshot reconciliation
//!
//! Every local mutation schedules a write of the full roster to the
//! transport's persisted snapshot. Bursts coalesce into exactly one write:
//! each new schedule resets the timer rather than queueing another write.
//! Disposal cancels whatever is pending.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

type FlushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type FlushFn = Arc<dyn Fn() -> FlushFuture + Send + Sync>;

/// Reset-style debounce around a single flush action
pub struct ReconcileScheduler {
    delay: Duration,
    flush: FlushFn,
    pending: Mutex<Option<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl ReconcileScheduler {
    /// `flush` performs the persisted write; it is invoked at most once per
    /// quiet period of `delay`.
    pub fn new<F, Fut>(delay: Duration, flush: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            delay,
            flush: Arc::new(move || Box::pin(flush()) as FlushFuture),
            pending: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// (Re)start the debounce window; any pending write is discarded and
    /// replaced
    pub fn schedule(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let delay = self.delay;
        let flush = Arc::clone(&self.flush);
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        trace!("reconcile scheduled in {:?}", delay);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flush().await;
        }));
    }

    /// Cancel the pending write and refuse future schedules; disposal only
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }
}

impl Drop for ReconcileScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }
}
