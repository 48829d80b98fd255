//! Serialized fetch queue.
//!
//! Tasks run strictly in FIFO order with at most one in flight. A task's
//! completion, successful or not, is the only thing that starts the next
//! one, so a failing request can delay polling but never stall it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::entity::{EntityId, EntityKey, EntityKind};

/// A deferred unit of fetch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTask {
    /// Fetch one entity and ingest it.
    Entity(EntityKey),
    /// Fetch a whole collection and replace the kind's slice.
    Collection(EntityKind),
}

impl FetchTask {
    /// Single-entity fetch.
    #[must_use]
    pub const fn entity(kind: EntityKind, id: EntityId) -> Self {
        Self::Entity(EntityKey::new(kind, id))
    }
}

impl fmt::Display for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(key) => write!(f, "fetch {key}"),
            Self::Collection(kind) => write!(f, "load {}", kind.plural()),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Result written to the store.
    Stored,
    /// Request denied; cache left as it was.
    Unauthorized,
    /// Fetch failed and the entity was dropped from the cache.
    Evicted,
    /// Collection load failed; cache left as it was.
    Failed(String),
}

/// Runs a single task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one task. Must not panic; failures are reported as outcomes.
    async fn execute(&self, task: FetchTask) -> TaskOutcome;
}

/// Tally of one [`FetchQueue::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks run.
    pub executed: usize,
    /// Tasks that stored a result.
    pub stored: usize,
    /// Tasks denied as unauthorized.
    pub unauthorized: usize,
    /// Tasks that evicted their entity.
    pub evicted: usize,
    /// Collection loads that failed.
    pub failed: usize,
    /// Another drain was already running, so this call did nothing.
    pub skipped: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        self.executed += 1;
        match outcome {
            TaskOutcome::Stored => self.stored += 1,
            TaskOutcome::Unauthorized => self.unauthorized += 1,
            TaskOutcome::Evicted => self.evicted += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// FIFO task list with a single consumer.
#[derive(Debug, Default)]
pub struct FetchQueue {
    pending: Mutex<VecDeque<FetchTask>>,
    batch_len: AtomicUsize,
    draining: AtomicBool,
}

/// Clears the draining flag even if the drain future is dropped mid-task.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FetchQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task.
    pub fn enqueue(&self, task: FetchTask) {
        trace!(%task, "queued");
        self.pending.lock().push_back(task);
    }

    /// Remove the head task.
    pub fn pop(&self) -> Option<FetchTask> {
        self.pending.lock().pop_front()
    }

    /// Number of waiting tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no tasks are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Waiting tasks, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FetchTask> {
        self.pending.lock().iter().copied().collect()
    }

    /// Record the current length as the size of the batch about to drain.
    pub fn mark_batch(&self) -> usize {
        let len = self.len();
        self.batch_len.store(len, Ordering::Relaxed);
        len
    }

    /// Size recorded by the last [`mark_batch`](Self::mark_batch); reset to
    /// zero once the queue drains.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.batch_len.load(Ordering::Relaxed)
    }

    /// Whether a drain pass is in progress.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Run tasks one at a time until the queue is empty.
    ///
    /// Tasks enqueued while draining are picked up by the same pass. A
    /// concurrent call returns immediately with `skipped` set.
    pub async fn drain<E: TaskExecutor>(&self, executor: &E) -> DrainReport {
        let mut report = DrainReport::default();
        if self.draining.swap(true, Ordering::AcqRel) {
            report.skipped = true;
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        while let Some(task) = self.pop() {
            let outcome = executor.execute(task).await;
            trace!(%task, ?outcome, "task complete");
            report.record(&outcome);
        }

        self.batch_len.store(0, Ordering::Relaxed);
        debug!(
            executed = report.executed,
            evicted = report.evicted,
            unauthorized = report.unauthorized,
            "queue drained"
        );
        report
    }
}
