//! Concurrent execution of a dependency [`Graph`]

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info, instrument, span, Instrument, Level, Span};

use crate::errors::{Error, Result};
use crate::graph::Graph;

mod context;
mod interrupt;

use context::{Channels, DependencyStatus, VertexContext};
pub use interrupt::*;

#[async_trait]
/// The unit of work executed for every vertex of the graph
///
/// ```rust
/// use async_trait::async_trait;
/// use kform_dag::Handler;
///
/// struct Apply;
///
/// #[async_trait]
/// impl Handler<String> for Apply {
///     async fn block_run(&self, name: &str, manifest: &String) -> bool {
///         println!("applying {name}: {manifest}");
///         true
///     }
/// }
/// ```
pub trait Handler<T: Send + Sync>: Send + Sync {
    /// Execute the work for the given vertex, returning `true` on success.
    ///
    /// It is called at most once per vertex and run, only after every
    /// dependency of the vertex has succeeded.
    async fn block_run(&self, name: &str, payload: &T) -> bool;

    /// Called once at the end of every run with the aggregate result
    async fn post_run(&self, _start: Instant, _finish: Instant, _success: bool) {}
}

#[derive(Clone, Debug)]
/// Executor configuration
pub struct Options {
    /// Interval between progress logs while waiting for the run to
    /// complete. Defaults to 5 seconds
    progress_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl Options {
    /// Set how often the executor logs the number of vertices still
    /// pending while it waits for a run to complete
    pub fn progress_interval(self, progress_interval: Duration) -> Self {
        let mut opts = self;
        opts.progress_interval = progress_interval;
        opts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Final state of a run
pub enum RunStatus {
    /// Every reachable vertex completed successfully
    Succeeded,
    /// At least one vertex failed or could not run
    Failed,
    /// The run was cancelled by the caller
    Cancelled,
}

impl RunStatus {
    /// Return `true` if the run succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "success"),
            RunStatus::Failed => write!(f, "failure"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-vertex completion signals, read by the executor
type Completions = BTreeMap<String, oneshot::Receiver<bool>>;

/// State shared by every vertex of a single run
struct Run<T> {
    contexts: BTreeMap<String, Arc<VertexContext<T>>>,
    tasks: Mutex<Vec<JoinHandle<bool>>>,
    cancel: Interrupt,
}

/// Walks a [`Graph`] invoking a [`Handler`] once per vertex
///
/// Every vertex reachable from the root gets its own tokio task, which waits
/// for all of its dependencies to succeed before calling
/// [`Handler::block_run`]. A failed vertex does not run its dependents, and
/// the first failure cancels every vertex still waiting on its dependencies.
/// Vertices on unrelated branches that already started are allowed to finish.
///
/// The executor keeps no state between runs, and requires a tokio runtime
/// with the time driver enabled.
///
/// ```rust
/// use async_trait::async_trait;
/// use kform_dag::{Executor, Graph, Handler, RunStatus};
///
/// struct Print;
///
/// #[async_trait]
/// impl Handler<&'static str> for Print {
///     async fn block_run(&self, name: &str, kind: &&'static str) -> bool {
///         println!("{kind} {name}");
///         true
///     }
/// }
///
/// let graph = Graph::new();
/// graph.add_vertex("root", "root").unwrap();
/// graph.add_vertex("input.x", "input").unwrap();
/// graph.add_vertex("resource.r", "resource").unwrap();
/// graph.connect("input.x", "resource.r");
/// graph.connect_to_root("root").unwrap();
///
/// let executor = Executor::new(Print);
/// let status = tokio_test::block_on(executor.run(&graph, "root")).unwrap();
/// assert_eq!(status, RunStatus::Succeeded);
/// ```
pub struct Executor<H> {
    handler: Arc<H>,
    opts: Options,
}

impl<H> Executor<H> {
    /// Create a new executor with default options
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            opts: Options::default(),
        }
    }

    /// Replace the executor options
    pub fn with_options(self, opts: Options) -> Self {
        let mut executor = self;
        executor.opts = opts;
        executor
    }

    /// Return a reference to the handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run the graph starting from `root`
    ///
    /// Returns an error if `root` is not part of the graph or if the graph is
    /// inconsistent, otherwise the final status of the run. In both cases
    /// [`Handler::post_run`] is called exactly once.
    pub async fn run<T>(&self, graph: &Graph<T>, root: &str) -> Result<RunStatus>
    where
        T: Clone + Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        self.run_with_interrupt(graph, root, Interrupt::new()).await
    }

    /// Run the graph starting from `root`, stopping early with
    /// [`RunStatus::Cancelled`] if the given interrupt is set
    ///
    /// Vertices still waiting on their dependencies when the interrupt is set
    /// never run, vertices already running are allowed to finish.
    #[instrument(name = "run_dag", skip_all, fields(root = %root, status = field::Empty), err)]
    pub async fn run_with_interrupt<T>(
        &self,
        graph: &Graph<T>,
        root: &str,
        interrupt: Interrupt,
    ) -> Result<RunStatus>
    where
        T: Clone + Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        let start = Instant::now();
        let (run, completions) = match Self::prepare(graph, root) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.handler.post_run(start, Instant::now(), false).await;
                return Err(e);
            }
        };

        self.explore(root, &run).await;

        // Vertices not reachable from the root never run. Close their channels
        // so any reachable dependent fails instead of blocking
        for ctx in run.contexts.values().filter(|ctx| !ctx.is_visited()) {
            if ctx.release() {
                debug!(vertex = %ctx.name(), "vertex not reachable from root");
            }
        }

        let status = self
            .wait_for_completion(&run, completions, &interrupt)
            .await;

        // Let running handlers finish so no task outlives the run
        let tasks = std::mem::take(&mut *run.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for res in future::join_all(tasks).await {
            if let Err(e) = res {
                error!("vertex task failed: {e}");
            }
        }

        let finish = Instant::now();
        let completed = run
            .contexts
            .values()
            .filter(|ctx| ctx.finished_at().is_some())
            .count();
        debug!(completed, total = run.contexts.len(), "run finished");

        Span::current().record("status", field::display(status));
        self.handler
            .post_run(start, finish, status.is_success())
            .await;

        Ok(status)
    }

    /// Create the vertex contexts, wiring one channel per dependency edge
    /// plus one completion channel per vertex
    fn prepare<T>(graph: &Graph<T>, root: &str) -> Result<(Run<T>, Completions)>
    where
        T: Clone,
    {
        let snapshot = graph.snapshot()?;
        if !snapshot.vertices.contains_key(root) {
            return Err(Error::VertexNotFound(root.to_string()));
        }

        let mut inbound: BTreeMap<String, BTreeMap<String, oneshot::Receiver<bool>>> =
            BTreeMap::new();
        let mut outbound: BTreeMap<String, BTreeMap<String, oneshot::Sender<bool>>> =
            BTreeMap::new();
        for (name, deps) in snapshot.up.iter() {
            for dep in deps {
                let (tx, rx) = oneshot::channel();
                outbound
                    .entry(dep.clone())
                    .or_default()
                    .insert(name.clone(), tx);
                inbound
                    .entry(name.clone())
                    .or_default()
                    .insert(dep.clone(), rx);
            }
        }

        let mut contexts = BTreeMap::new();
        let mut completions = BTreeMap::new();
        for (name, payload) in snapshot.vertices {
            let (done, done_rx) = oneshot::channel();
            let channels = Channels {
                inbound: inbound.remove(&name).unwrap_or_default(),
                outbound: outbound.remove(&name).unwrap_or_default(),
                done,
            };
            let ctx = VertexContext::new(name.clone(), payload, channels);
            contexts.insert(name.clone(), Arc::new(ctx));
            completions.insert(name, done_rx);
        }

        let run = Run {
            contexts,
            tasks: Mutex::new(Vec::new()),
            cancel: Interrupt::new(),
        };
        Ok((run, completions))
    }

    /// Claim the vertex, spawn its task and continue with its dependents
    ///
    /// Only the caller that claims a vertex explores its dependents, the
    /// set of visited vertices is the same as walking every path.
    fn explore<'a, T>(&'a self, name: &'a str, run: &'a Run<T>) -> BoxFuture<'a, ()>
    where
        T: Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        async move {
            let Some(ctx) = run.contexts.get(name) else {
                return;
            };
            let Some(channels) = ctx.claim() else {
                return;
            };

            let handle = self.spawn(Arc::clone(ctx), channels, run.cancel.clone());
            run.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);

            future::join_all(ctx.dependents().iter().map(|dep| self.explore(dep, run))).await;
        }
        .boxed()
    }

    fn spawn<T>(
        &self,
        ctx: Arc<VertexContext<T>>,
        channels: Channels,
        cancel: Interrupt,
    ) -> JoinHandle<bool>
    where
        T: Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let span = span!(Level::DEBUG, "run_vertex", vertex = %ctx.name());
        tokio::spawn(
            async move {
                let Channels {
                    inbound,
                    outbound,
                    done,
                } = channels;

                debug!(dependencies = ?ctx.dependencies(), "waiting for dependencies");
                let success = match ctx.wait_dependencies(inbound, &cancel).await {
                    DependencyStatus::Ready => ctx.run(handler.as_ref()).await,
                    DependencyStatus::Failed(dep) => {
                        debug!(dependency = %dep, "dependency failed, skipping vertex");
                        false
                    }
                    DependencyStatus::Cancelled => {
                        debug!("run cancelled, skipping vertex");
                        false
                    }
                };

                ctx.report(outbound, done, success);
                success
            }
            .instrument(span),
        )
    }

    /// Wait until every visited vertex reports its result
    ///
    /// Returns at the first failure, cancelling every vertex still waiting on
    /// its dependencies.
    async fn wait_for_completion<T>(
        &self,
        run: &Run<T>,
        completions: Completions,
        interrupt: &Interrupt,
    ) -> RunStatus {
        let mut pending: FuturesUnordered<_> = completions
            .into_iter()
            .filter(|(name, _)| run.contexts.get(name).is_some_and(|ctx| ctx.is_visited()))
            .map(|(name, rx)| async move { (name, rx.await) })
            .collect();
        let mut remaining = pending.len();

        let period = self.opts.progress_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let status = loop {
            tokio::select! {
                biased;
                _ = interrupt.wait() => {
                    break RunStatus::Cancelled;
                }
                next = pending.next() => match next {
                    None => break RunStatus::Succeeded,
                    Some((_, Ok(true))) => {
                        remaining -= 1;
                    }
                    Some((name, Ok(false))) => {
                        debug!(vertex = %name, "vertex failed");
                        break RunStatus::Failed;
                    }
                    Some((name, Err(_))) => {
                        error!(vertex = %name, "vertex terminated without reporting a result");
                        break RunStatus::Failed;
                    }
                },
                _ = ticker.tick() => {
                    info!(remaining, "waiting for vertices to complete");
                }
            }
        };

        if !status.is_success() {
            run.cancel.set();
        }

        status
    }
}
