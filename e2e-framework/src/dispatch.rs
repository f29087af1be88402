//! Worker pool for batched per-task operations
//!
//! `K` workers pull tasks from a channel of capacity `K`. Each task carries
//! its own one-shot result channel: the worker writes it exactly once, the
//! waiter reads it exactly once. Task ids are dense from 0 so handlers can
//! derive distinct object names with [`indexed_name`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{E2eError, Result};
use crate::ledger::indexed_name;
use crate::metrics;

/// What a task does with its fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreatePvcAndApp,
    DeletePvcAndApp,
    CreateSnapshot,
    DeleteSnapshot,
    /// Anything else; fails the task with [`E2eError::UnknownOperation`].
    Unknown(String),
}

impl Operation {
    pub fn parse(s: &str) -> Self {
        match s {
            "createPVCAndApp" => Operation::CreatePvcAndApp,
            "deletePVCAndApp" => Operation::DeletePvcAndApp,
            "createSnapshot" => Operation::CreateSnapshot,
            "deleteSnapshot" => Operation::DeleteSnapshot,
            other => Operation::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::CreatePvcAndApp => "createPVCAndApp",
            Operation::DeletePvcAndApp => "deletePVCAndApp",
            Operation::CreateSnapshot => "createSnapshot",
            Operation::DeleteSnapshot => "deleteSnapshot",
            Operation::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task input handed to a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct TaskSpec<F> {
    pub id: usize,
    /// `${unique_name}${id}`
    pub name: String,
    pub operation: Operation,
    /// Private copy of the batch fixture.
    pub fixture: F,
}

struct Task<F> {
    spec: TaskSpec<F>,
    result: oneshot::Sender<Result<()>>,
}

/// Executes known operations for the dispatcher.
#[async_trait]
pub trait TaskHandler<F>: Send + Sync {
    async fn handle(&self, task: TaskSpec<F>) -> Result<()>;
}

/// Submitted tasks awaiting their results, in id order.
pub struct Batch {
    operation: Operation,
    pending: Vec<(usize, oneshot::Receiver<Result<()>>)>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Aggregate outcome of a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub failed: usize,
    pub total: usize,
    pub error: Option<E2eError>,
}

impl BatchOutcome {
    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fixed-size pool of workers sharing one task channel.
pub struct Dispatcher<F> {
    sender: mpsc::Sender<Task<F>>,
    workers: Vec<JoinHandle<()>>,
}

async fn run_worker<F: Send + 'static>(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Task<F>>>>,
    handler: Arc<dyn TaskHandler<F>>,
) {
    loop {
        // The lock is held only while waiting for the next task
        let next = queue.lock().await.recv().await;
        let Some(Task { spec, result }) = next else {
            debug!(worker, "Task channel closed, worker exiting");
            return;
        };

        let id = spec.id;
        let operation = spec.operation.clone();
        let outcome = match &operation {
            Operation::Unknown(kind) => Err(E2eError::UnknownOperation(kind.clone())),
            _ => handler.handle(spec).await,
        };
        metrics::record_dispatch(operation.as_str(), outcome.is_ok());
        if let Err(e) = &outcome {
            warn!(worker, task = id, operation = %operation, error = %e, "Task failed");
        }
        if result.send(outcome).is_err() {
            warn!(worker, task = id, "Result receiver dropped");
        }
    }
}

impl<F: Send + 'static> Dispatcher<F> {
    /// Start `workers` workers (at least one).
    pub fn new(workers: usize, handler: Arc<dyn TaskHandler<F>>) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(workers);
        let queue = Arc::new(Mutex::new(receiver));
        let handles = (0..workers)
            .map(|worker| tokio::spawn(run_worker(worker, queue.clone(), handler.clone())))
            .collect();
        Self {
            sender,
            workers: handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue one task; waits while the channel is full.
    pub async fn submit(&self, spec: TaskSpec<F>) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        let id = spec.id;
        self.sender
            .send(Task { spec, result: tx })
            .await
            .map_err(|_| E2eError::Api(format!("dispatcher stopped before task {} was queued", id)))?;
        Ok(rx)
    }

    /// Queue `count` tasks named `${unique_name}0..${unique_name}{count-1}`,
    /// each with its own deep copy of `fixture`.
    pub async fn submit_batch(
        &self,
        unique_name: &str,
        count: usize,
        operation: Operation,
        fixture: &F,
    ) -> Result<Batch>
    where
        F: Clone,
    {
        let mut pending = Vec::with_capacity(count);
        for id in 0..count {
            let spec = TaskSpec {
                id,
                name: indexed_name(unique_name, id),
                operation: operation.clone(),
                fixture: fixture.clone(),
            };
            pending.push((id, self.submit(spec).await?));
        }
        info!(operation = %operation, count, "Batch submitted");
        Ok(Batch { operation, pending })
    }

    /// Close the channel and wait for every worker to exit.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Dispatcher worker panicked");
            }
        }
    }
}

/// Wait for every task of a batch and count failures.
///
/// Each result channel is read by its own collector task; a dropped sender
/// (worker gone) counts as a failure.
pub async fn wait_for_all(batch: Batch) -> BatchOutcome {
    let total = batch.pending.len();
    let failed = Arc::new(AtomicUsize::new(0));

    let collectors: Vec<JoinHandle<(usize, Option<String>)>> = batch
        .pending
        .into_iter()
        .map(|(id, rx)| {
            let failed = failed.clone();
            tokio::spawn(async move {
                let outcome = rx.await.unwrap_or_else(|_| {
                    Err(E2eError::Api("task result channel closed without a result".to_string()))
                });
                match outcome {
                    Ok(()) => (id, None),
                    Err(e) => {
                        failed.fetch_add(1, Ordering::SeqCst);
                        (id, Some(e.to_string()))
                    }
                }
            })
        })
        .collect();

    let mut details = Vec::new();
    for joined in futures::future::join_all(collectors).await {
        match joined {
            Ok((_, None)) => {}
            Ok((id, Some(msg))) => details.push(format!("task {}: {}", id, msg)),
            Err(e) => {
                failed.fetch_add(1, Ordering::SeqCst);
                details.push(format!("collector panicked: {}", e));
            }
        }
    }

    let failed = failed.load(Ordering::SeqCst);
    let error = (failed > 0).then(|| E2eError::BatchFailed {
        operation: batch.operation.to_string(),
        failed,
        total,
        details: details.join("; "),
    });
    if failed > 0 {
        warn!(operation = %batch.operation, failed, total, "Batch finished with failures");
    } else {
        info!(operation = %batch.operation, total, "Batch finished");
    }
    BatchOutcome {
        failed,
        total,
        error,
    }
}
