use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts admitted requests that haven't completed yet.
///
/// Independent of the serving state lock so long running requests never
/// hold up deciding a state transition. Only the final step of a drain waits
/// on it.
#[derive(Debug, Default)]
pub struct RequestTracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request. The request completes when the returned guard
    /// is dropped.
    pub(crate) fn start(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            tracker: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until there are no requests in flight.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            // Register interest before checking so a completion between the
            // check and the await isn't missed.
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Marks one admitted request as in flight.
///
/// Dropping the guard completes the request, so completion happens exactly
/// once on every exit path, including errors, panics and cancelled futures.
#[derive(Debug)]
#[must_use]
pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}
