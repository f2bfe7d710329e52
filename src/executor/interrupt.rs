use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

/// Cancellation signal for a graph run
///
/// Every vertex task of a run holds a clone. Once set, vertices still waiting
/// on their dependencies give up instead of running. The executor sets its own
/// signal on the first failed vertex. Callers can cancel a run from outside by
/// passing one to [`Executor::run_with_interrupt`](`crate::Executor::run_with_interrupt`).
#[derive(Clone, Debug)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    /// Create a signal that is not yet set
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Cancel the run, waking up every vertex blocked in [`Interrupt::wait`]
    ///
    /// Setting an already set signal has no further effect.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the run has been cancelled
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the run is cancelled, immediately if it already was
    pub async fn wait(&self) {
        // Register as a waiter before checking the flag, otherwise a `set`
        // between the check and the await would be missed
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_set() {
            return;
        }

        notified.await;
    }
}
