//! Dependency-ready scheduling with bounded concurrency.
//!
//! Every node keeps a counter of unfinished active dependencies. Nodes whose
//! counter reaches zero enter a ready heap (smallest identity first) and are
//! spawned on a [`JoinSet`], each holding one [`Semaphore`] permit. A node's
//! work receives the outputs of its direct dependencies.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, instrument, warn};

use crate::graph::{GraphError, GraphTraverser, Node, NodeId};

/// Failures raised by the scheduler itself rather than by node work.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Owning side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Cancel when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                handle.cancel();
            }
        })
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn check(&self) -> Result<(), ScheduleError> {
        if self.is_cancelled() {
            Err(ScheduleError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// A node handed to the work function, with its dependencies' outputs in
/// identity order.
#[derive(Debug, Clone)]
pub struct ReadyNode<T> {
    pub node: Node,
    pub dependencies: Vec<(NodeId, T)>,
}

/// Run `work` once per node, each node only after all of its active
/// dependencies finished.
///
/// The first error returned by `work` aborts every in-flight task and is
/// returned as is. Cancellation aborts in-flight work with
/// [`ScheduleError::Cancelled`].
#[instrument(skip(traverser, cancel, work), fields(nodes = traverser.graph().len()))]
pub async fn run_ready_queue<T, E, F, Fut>(
    traverser: &GraphTraverser<'_>,
    max_concurrency: usize,
    cancel: &CancelSignal,
    work: F,
) -> Result<BTreeMap<NodeId, T>, E>
where
    T: Clone + Send + 'static,
    E: From<ScheduleError> + Send + 'static,
    F: Fn(ReadyNode<T>) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    cancel.check()?;

    let len = traverser.graph().len();
    let mut pending: Vec<usize> = (0..len)
        .map(|idx| traverser.dependency_indices(idx).len())
        .collect();
    let mut ready: BinaryHeap<Reverse<(&NodeId, usize)>> = pending
        .iter()
        .enumerate()
        .filter(|(_, &count)| count == 0)
        .map(|(idx, _)| Reverse((&traverser.node_at(idx).id, idx)))
        .collect();

    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks: JoinSet<(usize, Result<T, E>)> = JoinSet::new();
    let mut results: Vec<Option<T>> = vec![None; len];
    let mut finished = 0usize;

    loop {
        while let Some(Reverse((_, idx))) = ready.peek().copied() {
            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                break;
            };
            ready.pop();

            let dependencies = traverser
                .dependency_indices(idx)
                .iter()
                .filter_map(|&dep| {
                    results[dep]
                        .clone()
                        .map(|output| (traverser.node_at(dep).id.clone(), output))
                })
                .collect();
            let node = traverser.node_at(idx).clone();
            debug!(node = %node.id, "node ready");
            let fut = work(ReadyNode { node, dependencies });
            tasks.spawn(async move {
                let _permit = permit;
                (idx, fut.await)
            });
        }

        if tasks.is_empty() {
            break;
        }

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                return Err(ScheduleError::Cancelled.into());
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        let (idx, outcome) = joined.map_err(|e| ScheduleError::Join(e.to_string()))?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                tasks.abort_all();
                return Err(e);
            }
        };

        results[idx] = Some(output);
        finished += 1;
        for &dependent in traverser.dependent_indices(idx) {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse((&traverser.node_at(dependent).id, dependent)));
            }
        }
    }

    if finished < len {
        if let Some(path) = traverser.find_cycle() {
            return Err(ScheduleError::Graph(GraphError::CycleDetected { path }).into());
        }
    }

    Ok(results
        .into_iter()
        .enumerate()
        .filter_map(|(idx, output)| {
            output.map(|output| (traverser.node_at(idx).id.clone(), output))
        })
        .collect())
}
