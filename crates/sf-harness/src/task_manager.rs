//! Bounded-concurrency execution engine.
//!
//! Ad-hoc work goes through [`AsyncTaskManager::execute`] or
//! [`AsyncTaskManager::execute_batch`] and holds a slot of the shared
//! [`PriorityGate`] while it runs. Long-lived work (connection tasks, the
//! health monitor) is spawned with [`AsyncTaskManager::create_background_task`]
//! and does not hold a slot.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::priority_gate::{Priority, PriorityGate};

/// Worker slots used when no configuration is supplied.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

// ---------------------------------------------------------------------------
// Identifiers and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    #[default]
    Parallel,
    Sequential,
}

/// Outcome of a batch. Never fails as a whole; every operation has a slot
/// in `results`, in submission order.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<Result<T, String>>,
    pub elapsed: Duration,
}

impl<T> BatchResult<T> {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    /// Error messages of the failed slots, with their positions.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e.as_str())))
            .collect()
    }
}

/// How a background task ended when it was awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExit {
    Completed,
    Panicked,
    /// The grace period elapsed and the task was force-aborted.
    Aborted,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTaskInfo {
    pub id: TaskId,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub batches: u64,
    pub background_spawned: u64,
    pub background_active: usize,
    pub max_concurrency: usize,
    pub available_slots: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub completed: usize,
    pub aborted: usize,
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    batches: AtomicU64,
    background_spawned: AtomicU64,
}

struct BackgroundEntry {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

enum Outcome {
    Ok,
    Failed,
    Panicked,
}

// ---------------------------------------------------------------------------
// AsyncTaskManager
// ---------------------------------------------------------------------------

pub struct AsyncTaskManager {
    gate: Arc<PriorityGate>,
    background: DashMap<TaskId, BackgroundEntry>,
    counters: Counters,
    root: CancellationToken,
}

impl AsyncTaskManager {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            gate: PriorityGate::new(max_concurrency),
            background: DashMap::new(),
            counters: Counters::default(),
            root: CancellationToken::new(),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.gate.capacity()
    }

    /// Run one operation under a worker slot. The operation's error is
    /// returned unchanged; nothing is retried.
    pub async fn execute<T, E, F, Fut>(
        &self,
        priority: Priority,
        op_type: &str,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.gate.acquire(priority).await;
        let started = Instant::now();
        let result = operation().await;
        let ok = result.is_ok();
        self.record(if ok { Outcome::Ok } else { Outcome::Failed });
        debug!(
            op_type,
            ?priority,
            ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "operation finished"
        );
        result
    }

    /// Run many operations, capturing each failure (panics included) in its
    /// own slot. `max_concurrency` further limits a parallel batch; every
    /// operation still needs a gate slot.
    pub async fn execute_batch<T, E, F, Fut>(
        &self,
        operations: Vec<F>,
        strategy: BatchStrategy,
        max_concurrency: Option<usize>,
    ) -> BatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let total = operations.len();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        let results: Vec<Result<T, String>> = match strategy {
            BatchStrategy::Sequential => {
                let mut out = Vec::with_capacity(total);
                for op in operations {
                    out.push(self.run_captured(op).await);
                }
                out
            }
            BatchStrategy::Parallel => {
                let limit = max_concurrency
                    .unwrap_or_else(|| self.gate.capacity())
                    .clamp(1, total.max(1));
                stream::iter(operations.into_iter().map(|op| self.run_captured(op)))
                    .buffered(limit)
                    .collect()
                    .await
            }
        };

        let success_count = results.iter().filter(|r| r.is_ok()).count();
        let failure_count = total - success_count;
        let elapsed = started.elapsed();
        info!(
            ?strategy,
            total,
            success_count,
            failure_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch finished"
        );

        BatchResult {
            success_count,
            failure_count,
            results,
            elapsed,
        }
    }

    async fn run_captured<T, E, F, Fut>(&self, operation: F) -> Result<T, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let _permit = self.gate.acquire(Priority::Normal).await;
        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => {
                self.record(Outcome::Ok);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(Outcome::Failed);
                Err(e.to_string())
            }
            Err(payload) => {
                self.record(Outcome::Panicked);
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "batch operation panicked");
                Err(format!("operation panicked: {message}"))
            }
        }
    }

    fn record(&self, outcome: Outcome) {
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Ok => &self.counters.succeeded,
            Outcome::Failed => &self.counters.failed,
            Outcome::Panicked => &self.counters.panicked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // -- background tasks ---------------------------------------------------

    /// Spawn a named long-lived task. The closure receives the token that
    /// [`cancel_background_task`](Self::cancel_background_task) and
    /// [`shutdown`](Self::shutdown) signal; returning after it fires is a
    /// normal exit.
    pub fn create_background_task<F, Fut>(&self, name: impl Into<String>, task: F) -> TaskId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.prune_finished();

        let id = TaskId::new();
        let name = name.into();
        let token = self.root.child_token();
        let fut = task(token.clone());
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            debug!(task = %task_name, id = %id, "background task exited");
        });

        self.counters
            .background_spawned
            .fetch_add(1, Ordering::Relaxed);
        debug!(task = %name, id = %id, "background task spawned");
        self.background.insert(
            id,
            BackgroundEntry {
                name,
                token,
                handle,
                started_at: Utc::now(),
            },
        );
        id
    }

    /// Signal cancellation without waiting. `false` when the task is unknown
    /// or has already finished.
    pub fn cancel_background_task(&self, id: TaskId) -> bool {
        let Some(entry) = self.background.get(&id) else {
            return false;
        };
        if entry.handle.is_finished() {
            drop(entry);
            self.background.remove(&id);
            return false;
        }
        entry.token.cancel();
        debug!(task = %entry.name, id = %id, "background task cancellation requested");
        true
    }

    /// Wait up to `grace` for a task to end, force-aborting it afterwards.
    /// The task is forgotten either way.
    pub async fn await_background_task(&self, id: TaskId, grace: Duration) -> TaskExit {
        let Some((_, entry)) = self.background.remove(&id) else {
            return TaskExit::NotFound;
        };
        let BackgroundEntry { name, handle, .. } = entry;
        join_with_grace(name, id, handle, grace).await
    }

    /// Cancel then await within `grace`.
    pub async fn stop_background_task(&self, id: TaskId, grace: Duration) -> TaskExit {
        self.cancel_background_task(id);
        self.await_background_task(id, grace).await
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.background
            .get(&id)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    pub fn background_tasks(&self) -> Vec<BackgroundTaskInfo> {
        let mut tasks: Vec<BackgroundTaskInfo> = self
            .background
            .iter()
            .map(|entry| BackgroundTaskInfo {
                id: *entry.key(),
                name: entry.name.clone(),
                started_at: entry.started_at,
                cancelled: entry.token.is_cancelled(),
                finished: entry.handle.is_finished(),
            })
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            background_spawned: self.counters.background_spawned.load(Ordering::Relaxed),
            background_active: self
                .background
                .iter()
                .filter(|e| !e.handle.is_finished())
                .count(),
            max_concurrency: self.gate.capacity(),
            available_slots: self.gate.available(),
            waiting: self.gate.waiting(),
        }
    }

    /// Cancel every background task and wait for them, each within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.root.cancel();
        let ids: Vec<TaskId> = self.background.iter().map(|e| *e.key()).collect();
        let exits =
            futures::future::join_all(ids.into_iter().map(|id| self.await_background_task(id, grace)))
                .await;

        let mut report = ShutdownReport::default();
        for exit in exits {
            match exit {
                TaskExit::Aborted => report.aborted += 1,
                TaskExit::NotFound => {}
                TaskExit::Completed | TaskExit::Panicked => report.completed += 1,
            }
        }
        info!(
            completed = report.completed,
            aborted = report.aborted,
            "task manager shut down"
        );
        report
    }

    fn prune_finished(&self) {
        self.background.retain(|_, entry| !entry.handle.is_finished());
    }
}

impl Default for AsyncTaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl fmt::Debug for AsyncTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskManager")
            .field("gate", &self.gate)
            .field("background", &self.background.len())
            .finish()
    }
}

async fn join_with_grace(
    name: String,
    id: TaskId,
    mut handle: JoinHandle<()>,
    grace: Duration,
) -> TaskExit {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => TaskExit::Completed,
        Ok(Err(e)) if e.is_panic() => {
            warn!(task = %name, id = %id, "background task panicked");
            TaskExit::Panicked
        }
        Ok(Err(_)) => TaskExit::Aborted,
        Err(_) => {
            handle.abort();
            warn!(
                task = %name,
                id = %id,
                grace_ms = grace.as_millis() as u64,
                "background task did not stop within grace period; forced termination"
            );
            TaskExit::Aborted
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
