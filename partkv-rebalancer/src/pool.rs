//! Worker pool
//!
//! Bounded pool of tokio tasks used by one batch sub-phase. Parallelism is a
//! semaphore; capacity bounds how many jobs the pool holds at once. Once shut
//! down the pool refuses new work.

use crate::error::PoolError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Decrements the outstanding count when a job ends, however it ends
struct Outstanding(Arc<AtomicUsize>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    /// Semaphore for concurrency
    permits: Arc<Semaphore>,
    /// Jobs submitted and not yet finished
    outstanding: Arc<AtomicUsize>,
    capacity: Option<usize>,
    jobs: JoinSet<()>,
    closed: bool,
}

impl WorkerPool {
    /// Pool running at most `max_parallel` jobs at once and holding at most
    /// `capacity` jobs (`None` for unbounded)
    pub fn new(max_parallel: usize, capacity: Option<usize>) -> Self {
        let max_parallel = max_parallel.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(max_parallel)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity,
            jobs: JoinSet::new(),
            closed: false,
        }
    }

    /// Submit a job
    pub fn submit<F>(&mut self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_with_notice(job, ())
    }

    /// Submit a job together with a `notice` that is dropped only after the
    /// job's permit and outstanding slot are released. A submission made in
    /// reaction to the notice always sees the freed slot.
    pub fn submit_with_notice<F, N>(&mut self, job: F, notice: N) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
        N: Send + 'static,
    {
        if self.closed {
            return Err(PoolError::Shutdown);
        }
        if let Some(capacity) = self.capacity {
            if self.outstanding.load(Ordering::SeqCst) >= capacity {
                return Err(PoolError::Saturated(capacity));
            }
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = Outstanding(self.outstanding.clone());
        let permits = self.permits.clone();

        // Locals drop in reverse order, on return, panic or abort alike
        self.jobs.spawn(async move {
            let _notice = notice;
            let _outstanding = outstanding;
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            job.await;
        });
        Ok(())
    }

    /// Jobs submitted and not yet finished
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Stop accepting work; running jobs continue
    pub fn shutdown(&mut self) {
        self.closed = true;
    }

    /// Shut down and wait, without a deadline, for every job to end.
    /// Returns how many jobs panicked or were cancelled.
    pub async fn await_termination(&mut self) -> usize {
        self.closed = true;
        let mut abnormal = 0;
        while let Some(result) = self.jobs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker job ended abnormally");
                abnormal += 1;
            }
        }
        debug!("Worker pool drained");
        abnormal
    }

    pub fn is_terminated(&self) -> bool {
        self.closed && self.jobs.is_empty()
    }

    /// Abort every job still held by the pool
    pub fn shutdown_now(&mut self) {
        self.closed = true;
        self.jobs.abort_all();
    }
}
