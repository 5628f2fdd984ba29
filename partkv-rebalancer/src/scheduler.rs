//! Node-exclusive task scheduler
//!
//! Dispatches the stealer-based tasks of one batch sub-phase onto a
//! [`WorkerPool`] such that a node takes part in at most one in-flight task,
//! as stealer or as donor. Dispatch order is randomized at two levels: each
//! stealer's task list is shuffled once, and the stealer order is reshuffled
//! on every scheduling attempt.
//!
//! The scheduler is a single-writer actor. Only [`TaskScheduler::run`] touches
//! the scheduling state; finished tasks report back over a channel and the run
//! loop frees their nodes, then tries to dispatch more work.

use crate::error::BatchError;
use crate::pool::WorkerPool;
use crate::task::{RebalanceTask, TaskRunner};
use partkv_core::NodeId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

/// Completion notice sent once per dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDone {
    pub task_id: usize,
    pub stealer_id: NodeId,
    pub donor_id: NodeId,
}

/// Sends the completion notice when dropped, so it fires exactly once whether
/// the job finished, panicked or was cancelled
struct CompletionGuard {
    tx: mpsc::UnboundedSender<TaskDone>,
    done: Option<TaskDone>,
}

impl CompletionGuard {
    fn new(tx: mpsc::UnboundedSender<TaskDone>, done: TaskDone) -> Self {
        Self { tx, done: Some(done) }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = self.tx.send(done);
        }
    }
}

/// Hook observing every dispatch and completion, with the busy set as it
/// stands right after the event
pub trait SchedulerObserver: Send + Sync {
    fn on_dispatch(&self, _task: &RebalanceTask, _busy: &HashSet<NodeId>) {}

    fn on_complete(&self, _done: &TaskDone, _busy: &HashSet<NodeId>) {}
}

/// Mutable scheduling state of one sub-phase
struct SchedulerState {
    tasks_by_stealer: HashMap<NodeId, Vec<Arc<RebalanceTask>>>,
    stealer_ids: Vec<NodeId>,
    busy: HashSet<NodeId>,
    pending: usize,
    in_flight: usize,
    remaining: usize,
}

impl SchedulerState {
    fn new(tasks: &[Arc<RebalanceTask>], rng: &mut StdRng) -> Result<Self, BatchError> {
        let mut tasks_by_stealer: HashMap<NodeId, Vec<Arc<RebalanceTask>>> = HashMap::new();
        for task in tasks {
            let stealer = task.stealer_id().ok_or_else(|| {
                BatchError::Validation(format!("task {} has no single stealer", task.task_id()))
            })?;
            tasks_by_stealer.entry(stealer).or_default().push(task.clone());
        }
        for list in tasks_by_stealer.values_mut() {
            list.shuffle(rng);
        }

        Ok(Self {
            stealer_ids: tasks_by_stealer.keys().copied().collect(),
            tasks_by_stealer,
            busy: HashSet::new(),
            pending: tasks.len(),
            in_flight: 0,
            remaining: tasks.len(),
        })
    }
}

pub struct TaskScheduler {
    batch_id: usize,
    max_parallel: usize,
    runner: TaskRunner,
    rng: StdRng,
    observer: Option<Arc<dyn SchedulerObserver>>,
}

impl TaskScheduler {
    pub fn new(batch_id: usize, runner: TaskRunner, max_parallel: usize) -> Self {
        Self {
            batch_id,
            max_parallel: max_parallel.max(1),
            runner,
            rng: StdRng::from_entropy(),
            observer: None,
        }
    }

    /// Use a deterministic shuffle sequence
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Dispatch every task and wait until each one has reported completion
    #[instrument(skip(self, tasks, pool), fields(batch_id = self.batch_id, tasks = tasks.len()))]
    pub async fn run(
        &mut self,
        tasks: Vec<Arc<RebalanceTask>>,
        pool: &mut WorkerPool,
    ) -> Result<(), BatchError> {
        let mut state = SchedulerState::new(&tasks, &mut self.rng)?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        info!(
            stealers = state.stealer_ids.len(),
            max_parallel = self.max_parallel,
            "Scheduling rebalance tasks"
        );

        self.schedule_more(&mut state, pool, &tx)?;

        while state.remaining > 0 {
            if state.in_flight == 0 {
                error!(
                    remaining = state.remaining,
                    "No task in flight but work remains, giving up on sub-phase"
                );
                break;
            }
            let Some(done) = rx.recv().await else {
                break;
            };
            self.done_task(&mut state, done);
            self.schedule_more(&mut state, pool, &tx)?;
        }

        crate::metrics::set_tasks_in_flight(0);
        Ok(())
    }

    fn schedule_more(
        &mut self,
        state: &mut SchedulerState,
        pool: &mut WorkerPool,
        tx: &mpsc::UnboundedSender<TaskDone>,
    ) -> Result<(), BatchError> {
        while self.schedule_next_task(state, pool, tx)?.is_some() {}
        Ok(())
    }

    /// Dispatch one task whose stealer and donor are both idle, if any
    fn schedule_next_task(
        &mut self,
        state: &mut SchedulerState,
        pool: &mut WorkerPool,
        tx: &mpsc::UnboundedSender<TaskDone>,
    ) -> Result<Option<Arc<RebalanceTask>>, BatchError> {
        if state.pending == 0 || state.in_flight >= self.max_parallel {
            return Ok(None);
        }

        state.stealer_ids.shuffle(&mut self.rng);

        let mut picked = None;
        for (slot, &stealer) in state.stealer_ids.iter().enumerate() {
            if state.busy.contains(&stealer) {
                continue;
            }
            let Some(list) = state.tasks_by_stealer.get(&stealer) else {
                continue;
            };
            if let Some(index) = list.iter().position(|t| !state.busy.contains(&t.donor_id())) {
                picked = Some((slot, stealer, index));
                break;
            }
        }

        let Some((slot, stealer, index)) = picked else {
            return Ok(None);
        };

        let Some(list) = state.tasks_by_stealer.get_mut(&stealer) else {
            return Ok(None);
        };
        let task = list.swap_remove(index);
        if list.is_empty() {
            state.tasks_by_stealer.remove(&stealer);
            state.stealer_ids.swap_remove(slot);
        }

        let donor = task.donor_id();
        state.busy.insert(stealer);
        state.busy.insert(donor);
        state.pending -= 1;
        state.in_flight += 1;

        let guard = CompletionGuard::new(
            tx.clone(),
            TaskDone {
                task_id: task.task_id(),
                stealer_id: stealer,
                donor_id: donor,
            },
        );
        let runner = self.runner.clone();
        let job_task = task.clone();
        pool.submit_with_notice(async move { runner.run(job_task).await }, guard)?;

        debug!(
            task_id = task.task_id(),
            stealer_id = stealer,
            donor_id = donor,
            in_flight = state.in_flight,
            "Dispatched rebalance task"
        );
        crate::metrics::set_tasks_in_flight(state.in_flight);
        if let Some(observer) = &self.observer {
            observer.on_dispatch(&task, &state.busy);
        }

        Ok(Some(task))
    }

    fn done_task(&mut self, state: &mut SchedulerState, done: TaskDone) {
        state.busy.remove(&done.stealer_id);
        state.busy.remove(&done.donor_id);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.remaining = state.remaining.saturating_sub(1);

        debug!(
            task_id = done.task_id,
            in_flight = state.in_flight,
            remaining = state.remaining,
            "Rebalance task done"
        );
        crate::metrics::set_tasks_in_flight(state.in_flight);
        if let Some(observer) = &self.observer {
            observer.on_complete(&done, &state.busy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrationError;
    use crate::task::{DonorPermits, PartitionMigrator, TaskState};
    use parking_lot::Mutex;
    use partkv_core::PartitionMove;
    use std::time::Duration;

    /// Sleeps for a fixed time per move
    struct SleepyMigrator(Duration);

    #[async_trait::async_trait]
    impl PartitionMigrator for SleepyMigrator {
        async fn migrate(
            &self,
            _batch_id: usize,
            _task_id: usize,
            _partition_move: &PartitionMove,
        ) -> Result<(), MigrationError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    /// Tracks in-flight node pairs and the peak number of in-flight tasks
    #[derive(Default)]
    struct Recorder {
        in_flight: Mutex<HashMap<usize, (NodeId, NodeId)>>,
        peak: Mutex<usize>,
        dispatched: Mutex<Vec<usize>>,
    }

    impl SchedulerObserver for Recorder {
        fn on_dispatch(&self, task: &RebalanceTask, busy: &HashSet<NodeId>) {
            let stealer = task.stealer_id().unwrap();
            let donor = task.donor_id();
            let mut in_flight = self.in_flight.lock();
            for (s, d) in in_flight.values() {
                assert!(![*s, *d].contains(&stealer) && ![*s, *d].contains(&donor));
            }
            in_flight.insert(task.task_id(), (stealer, donor));
            assert_eq!(busy.len(), in_flight.len() * 2);
            let mut peak = self.peak.lock();
            *peak = (*peak).max(in_flight.len());
            self.dispatched.lock().push(task.task_id());
        }

        fn on_complete(&self, done: &TaskDone, busy: &HashSet<NodeId>) {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(&done.task_id);
            assert_eq!(busy.len(), in_flight.len() * 2);
        }
    }

    fn tasks(pairs: &[(NodeId, NodeId)]) -> Vec<Arc<RebalanceTask>> {
        pairs
            .iter()
            .enumerate()
            .map(|(id, &(stealer, donor))| {
                let m = PartitionMove::new(stealer, donor, [id as u32], ["users"]).unwrap();
                Arc::new(RebalanceTask::stealer_based(0, id, vec![m], 1).unwrap())
            })
            .collect()
    }

    fn scheduler(max_parallel: usize, recorder: Arc<Recorder>) -> TaskScheduler {
        let runner = TaskRunner::new(
            Arc::new(SleepyMigrator(Duration::from_secs(10))),
            DonorPermits::default(),
            Duration::ZERO,
        );
        TaskScheduler::new(0, runner, max_parallel)
            .with_seed(7)
            .with_observer(recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_tasks_run_together() {
        let recorder = Arc::new(Recorder::default());
        let tasks = tasks(&[(1, 0), (3, 2), (5, 4)]);
        let mut pool = WorkerPool::new(usize::MAX, None);
        let start = tokio::time::Instant::now();

        scheduler(usize::MAX, recorder.clone())
            .run(tasks.clone(), &mut pool)
            .await
            .unwrap();
        pool.await_termination().await;

        assert_eq!(*recorder.peak.lock(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(tasks.iter().all(|t| t.state() == TaskState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_is_serialized() {
        let recorder = Arc::new(Recorder::default());
        let tasks = tasks(&[(1, 0), (2, 1), (3, 2)]);
        let mut pool = WorkerPool::new(usize::MAX, None);
        let start = tokio::time::Instant::now();

        scheduler(usize::MAX, recorder.clone())
            .run(tasks, &mut pool)
            .await
            .unwrap();
        pool.await_termination().await;

        // 1<-0 and 3<-2 share no node, so at most two run together
        assert!(*recorder.peak.lock() <= 2);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert_eq!(recorder.dispatched.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_stealer_serialized() {
        let recorder = Arc::new(Recorder::default());
        let tasks = tasks(&[(1, 0), (1, 2), (1, 3)]);
        let mut pool = WorkerPool::new(usize::MAX, None);
        let start = tokio::time::Instant::now();

        scheduler(usize::MAX, recorder.clone())
            .run(tasks, &mut pool)
            .await
            .unwrap();

        assert_eq!(*recorder.peak.lock(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_ceiling() {
        let recorder = Arc::new(Recorder::default());
        let tasks = tasks(&[(1, 0), (3, 2), (5, 4), (7, 6)]);
        let mut pool = WorkerPool::new(usize::MAX, None);

        scheduler(2, recorder.clone())
            .run(tasks, &mut pool)
            .await
            .unwrap();

        assert_eq!(*recorder.peak.lock(), 2);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_fatal() {
        let recorder = Arc::new(Recorder::default());
        let mut pool = WorkerPool::new(1, None);
        pool.shutdown();

        let result = scheduler(usize::MAX, recorder)
            .run(tasks(&[(1, 0)]), &mut pool)
            .await;

        assert!(matches!(result, Err(BatchError::SchedulingRejected(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_one_chain_never_rejected() {
        for seed in 0..100 {
            let runner = TaskRunner::new(
                Arc::new(SleepyMigrator(Duration::ZERO)),
                DonorPermits::default(),
                Duration::ZERO,
            );
            let tasks = tasks(&[(1, 0), (2, 1), (3, 2)]);
            let mut pool = WorkerPool::new(1, Some(1));

            TaskScheduler::new(0, runner, 1)
                .with_seed(seed)
                .run(tasks.clone(), &mut pool)
                .await
                .unwrap();
            assert_eq!(pool.await_termination().await, 0);
            assert!(tasks.iter().all(|t| t.state() == TaskState::Succeeded));
        }
    }

    #[tokio::test]
    async fn test_empty_task_set() {
        let mut pool = WorkerPool::new(1, None);
        scheduler(1, Arc::new(Recorder::default()))
            .run(Vec::new(), &mut pool)
            .await
            .unwrap();
    }

    #[test]
    fn test_donor_based_task_rejected() {
        let m = PartitionMove::new(1, 0, [0], ["users"]).unwrap();
        let task = Arc::new(RebalanceTask::donor_based(0, 0, vec![m], 1).unwrap());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            SchedulerState::new(&[task], &mut rng),
            Err(BatchError::Validation(_))
        ));
    }
}
