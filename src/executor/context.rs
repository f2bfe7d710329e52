use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Handler, Interrupt};

/// Synchronization surface of a single vertex for one run
///
/// Every channel carries exactly one boolean and is closed after sending.
pub(crate) struct Channels {
    /// One receiver per dependency
    pub inbound: BTreeMap<String, oneshot::Receiver<bool>>,
    /// One sender per dependent
    pub outbound: BTreeMap<String, oneshot::Sender<bool>>,
    /// Completion signal read by the executor
    pub done: oneshot::Sender<bool>,
}

/// Result of waiting on the dependencies of a vertex
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DependencyStatus {
    /// All dependencies completed successfully
    Ready,
    /// The given dependency failed, or went away without reporting
    Failed(String),
    /// The run was cancelled while waiting
    Cancelled,
}

/// Per-run bookkeeping for a vertex
pub(crate) struct VertexContext<T> {
    name: String,
    payload: T,
    dependencies: Vec<String>,
    dependents: Vec<String>,
    visited: OnceLock<Instant>,
    finished: OnceLock<Instant>,
    channels: Mutex<Option<Channels>>,
}

impl<T> VertexContext<T> {
    pub fn new(name: String, payload: T, channels: Channels) -> Self {
        let dependencies = channels.inbound.keys().cloned().collect();
        let dependents = channels.outbound.keys().cloned().collect();
        Self {
            name,
            payload,
            dependencies,
            dependents,
            visited: OnceLock::new(),
            finished: OnceLock::new(),
            channels: Mutex::new(Some(channels)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    pub fn is_visited(&self) -> bool {
        self.visited.get().is_some()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished.get().copied()
    }

    fn take_channels(&self) -> Option<Channels> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Mark the vertex as visited and hand over its channels
    ///
    /// Only the first caller gets the channels, every later call returns `None`.
    pub fn claim(&self) -> Option<Channels> {
        self.visited.set(Instant::now()).ok()?;
        self.take_channels()
    }

    /// Drop the channels of a vertex that was never claimed, so its dependents
    /// see the dependency as failed instead of waiting forever.
    pub fn release(&self) -> bool {
        self.take_channels().is_some()
    }

    /// Wait for a result from every dependency
    ///
    /// Returns at the first failed dependency. A dependency that closes its
    /// channel without sending a value is considered failed.
    pub async fn wait_dependencies(
        &self,
        inbound: BTreeMap<String, oneshot::Receiver<bool>>,
        interrupt: &Interrupt,
    ) -> DependencyStatus {
        for (dep, rx) in inbound {
            // Prefer a value that is already available over the cancellation
            let result = tokio::select! {
                biased;
                result = rx => result,
                _ = interrupt.wait() => return DependencyStatus::Cancelled,
            };

            match result {
                Ok(true) => {}
                Ok(false) => return DependencyStatus::Failed(dep),
                Err(_) => {
                    warn!(dependency = %dep, "dependency closed without reporting a result");
                    return DependencyStatus::Failed(dep);
                }
            }
        }

        DependencyStatus::Ready
    }

    /// Run the handler for this vertex and record the finish time
    pub async fn run<H>(&self, handler: &H) -> bool
    where
        H: Handler<T> + ?Sized,
        T: Send + Sync,
    {
        let success = handler.block_run(&self.name, &self.payload).await;
        let finished = *self.finished.get_or_init(Instant::now);
        if let Some(visited) = self.visited.get() {
            debug!(success, elapsed = ?finished.duration_since(*visited), "vertex finished");
        }
        success
    }

    /// Send the result of this vertex to every dependent and to the executor,
    /// closing all channels
    pub fn report(
        &self,
        outbound: BTreeMap<String, oneshot::Sender<bool>>,
        done: oneshot::Sender<bool>,
        success: bool,
    ) {
        for (dependent, tx) in outbound {
            if tx.send(success).is_err() {
                // the dependent stopped waiting, this happens on cancellation
                debug!(dependent = %dependent, "dependent no longer listening");
            }
        }
        let _ = done.send(success);
    }
}
