//! Progress tracking
//!
//! Plan-level accounting (batches and partition-stores done, remaining-time
//! estimate) plus a per-batch handle tasks use to report completion. Updates
//! are logged and, when a receiver was requested, pushed onto a channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Progress update pushed to an optional observer
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    BatchStarted {
        batch_id: usize,
        total_batches: usize,
        partition_stores: usize,
    },
    TaskFinished {
        batch_id: usize,
        task_id: usize,
        succeeded: bool,
        tasks_done: usize,
        tasks_total: usize,
    },
    BatchCompleted(ProgressSnapshot),
}

/// Cumulative progress after a batch
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub batches_done: usize,
    pub batches_total: usize,
    pub partition_stores_done: usize,
    pub partition_stores_total: usize,
    pub elapsed: Duration,
    pub estimated_remaining: Duration,
}

impl ProgressSnapshot {
    /// Percent of partition-stores moved; 100 when the plan moves nothing
    pub fn percent_complete(&self) -> f64 {
        if self.partition_stores_total == 0 {
            100.0
        } else {
            self.partition_stores_done as f64 / self.partition_stores_total as f64 * 100.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "batches moved: {} out of {}, partition-stores moved: {} out of {}, percent done: {:.2}, estimated time left: {:?}",
            self.batches_done,
            self.batches_total,
            self.partition_stores_done,
            self.partition_stores_total,
            self.percent_complete(),
            self.estimated_remaining
        )
    }
}

/// Remaining time as `elapsed * remaining / done`; `elapsed` when nothing is done yet
pub fn estimate_remaining(elapsed: Duration, done: usize, total: usize) -> Duration {
    if done == 0 {
        return elapsed;
    }
    let remaining = total.saturating_sub(done);
    elapsed.mul_f64(remaining as f64 / done as f64)
}

/// Plan-level accounting
#[derive(Debug)]
pub struct ProgressTracker {
    batches_total: usize,
    partition_stores_total: usize,
    batches_done: usize,
    partition_stores_done: usize,
    elapsed: Duration,
}

impl ProgressTracker {
    pub fn new(batches_total: usize, partition_stores_total: usize) -> Self {
        Self {
            batches_total,
            partition_stores_total,
            batches_done: 0,
            partition_stores_done: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Account for a finished batch and return the new totals
    pub fn record_batch(&mut self, partition_stores: usize, batch_elapsed: Duration) -> ProgressSnapshot {
        self.batches_done += 1;
        self.partition_stores_done += partition_stores;
        self.elapsed += batch_elapsed;
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            batches_done: self.batches_done,
            batches_total: self.batches_total,
            partition_stores_done: self.partition_stores_done,
            partition_stores_total: self.partition_stores_total,
            elapsed: self.elapsed,
            estimated_remaining: estimate_remaining(
                self.elapsed,
                self.partition_stores_done,
                self.partition_stores_total,
            ),
        }
    }
}

/// Sink for progress updates
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressUpdate>>,
}

impl ProgressReporter {
    /// Reporter that only logs
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Reporter plus the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Push an update. A full or closed channel drops the update rather than
    /// stall migration work.
    pub fn report(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(update) {
                debug!(error = %e, "Dropped progress update");
            }
        }
    }
}

/// Progress handle for one batch sub-phase, shared by its tasks
#[derive(Debug, Clone)]
pub struct BatchProgress {
    batch_id: usize,
    tasks_total: usize,
    partition_stores_total: usize,
    tasks_done: Arc<AtomicUsize>,
    partition_stores_done: Arc<AtomicUsize>,
    reporter: ProgressReporter,
}

impl BatchProgress {
    pub fn new(
        batch_id: usize,
        tasks_total: usize,
        partition_stores_total: usize,
        reporter: ProgressReporter,
    ) -> Self {
        Self {
            batch_id,
            tasks_total,
            partition_stores_total,
            tasks_done: Arc::new(AtomicUsize::new(0)),
            partition_stores_done: Arc::new(AtomicUsize::new(0)),
            reporter,
        }
    }

    pub fn record_partition_stores(&self, count: usize) {
        self.partition_stores_done.fetch_add(count, Ordering::Relaxed);
    }

    pub fn task_finished(&self, task_id: usize, succeeded: bool) {
        let tasks_done = self.tasks_done.fetch_add(1, Ordering::Relaxed) + 1;
        let stores_done = self.partition_stores_done.load(Ordering::Relaxed);

        info!(
            batch_id = self.batch_id,
            task_id,
            succeeded,
            tasks_done,
            tasks_total = self.tasks_total,
            partition_stores_done = stores_done,
            partition_stores_total = self.partition_stores_total,
            "Rebalance task finished"
        );

        self.reporter.report(ProgressUpdate::TaskFinished {
            batch_id: self.batch_id,
            task_id,
            succeeded,
            tasks_done,
            tasks_total: self.tasks_total,
        });
    }

    pub fn tasks_done(&self) -> usize {
        self.tasks_done.load(Ordering::Relaxed)
    }

    pub fn partition_stores_done(&self) -> usize {
        self.partition_stores_done.load(Ordering::Relaxed)
    }
}
