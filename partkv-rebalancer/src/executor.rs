//! Batch executor
//!
//! Runs one batch of the plan:
//! 1. An empty batch only advances the cluster metadata.
//! 2. Moves are split by store kind into a read-only and a read-write subset.
//! 3. The read-only step is committed, then its moves are migrated.
//! 4. The read-write step is committed, proxies get time to pick up the new
//!    topology, then the read-write moves are migrated.
//!
//! A failed sub-phase rolls back the metadata it committed before the error
//! propagates. Nothing is retried at batch level.

use crate::admin::AdminClient;
use crate::config::{RebalanceConfig, RebalanceStrategy};
use crate::coordinator::ClusterStateCoordinator;
use crate::error::{BatchError, TaskFailure};
use crate::pool::WorkerPool;
use crate::progress::{BatchProgress, ProgressReporter};
use crate::scheduler::{SchedulerObserver, TaskScheduler};
use crate::task::{DonorPermits, PartitionMigrator, RebalanceTask, TaskRunner};
use partkv_core::{
    filter_moves_by_stores, filter_stores, group_moves_by_donor, BatchPlan, PartitionMove,
    StoreKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

/// How a sub-phase ended once its worker pool drained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubBatchOutcome {
    Success,
    /// At least one task failed; carries every failure
    RebalancingFailure(Vec<TaskFailure>),
    /// No failures, but these tasks never reached a terminal state
    Incomplete(Vec<usize>),
}

impl SubBatchOutcome {
    pub fn from_tasks(tasks: &[Arc<RebalanceTask>]) -> Self {
        let failures: Vec<TaskFailure> = tasks.iter().filter_map(|t| t.to_failure()).collect();
        if !failures.is_empty() {
            return Self::RebalancingFailure(failures);
        }

        let incomplete: Vec<usize> = tasks
            .iter()
            .filter(|t| !t.is_complete())
            .map(|t| t.task_id())
            .collect();
        if !incomplete.is_empty() {
            return Self::Incomplete(incomplete);
        }

        Self::Success
    }
}

/// Cuts a running proxy pause short
#[derive(Debug, Clone, Default)]
pub struct PauseInterrupter {
    notify: Arc<Notify>,
}

impl PauseInterrupter {
    /// Wake any pause in progress. Has no effect on later pauses.
    pub fn interrupt(&self) {
        self.notify.notify_waiters();
    }
}

/// Which half of a batch is running
#[derive(Debug, Clone, Copy)]
struct SubPhase {
    has_read_only: bool,
    has_read_write: bool,
    finished_read_only: bool,
}

impl SubPhase {
    fn name(&self) -> &'static str {
        if self.finished_read_only {
            "read-write"
        } else {
            "read-only"
        }
    }
}

pub struct BatchExecutor {
    coordinator: ClusterStateCoordinator,
    migrator: Arc<dyn PartitionMigrator>,
    config: RebalanceConfig,
    reporter: ProgressReporter,
    interrupter: PauseInterrupter,
    observer: Option<Arc<dyn SchedulerObserver>>,
    seed: Option<u64>,
    next_task_id: AtomicUsize,
}

impl BatchExecutor {
    pub fn new(
        admin: Arc<dyn AdminClient>,
        migrator: Arc<dyn PartitionMigrator>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            coordinator: ClusterStateCoordinator::new(admin),
            migrator,
            config,
            reporter: ProgressReporter::disabled(),
            interrupter: PauseInterrupter::default(),
            observer: None,
            seed: None,
            next_task_id: AtomicUsize::new(0),
        }
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_scheduler_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Seed the scheduler shuffles
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn pause_interrupter(&self) -> PauseInterrupter {
        self.interrupter.clone()
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    /// Execute one batch of the plan
    #[instrument(skip(self, batch), fields(moves = batch.moves().len()))]
    pub async fn execute_batch(&self, batch_id: usize, batch: &BatchPlan) -> Result<(), BatchError> {
        match self.run_batch(batch_id, batch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(batch_id, error = %e, "Error while executing batch");
                Err(e)
            }
        }
    }

    async fn run_batch(&self, batch_id: usize, batch: &BatchPlan) -> Result<(), BatchError> {
        if batch.is_empty() {
            info!(batch_id, "Batch moves no partitions, advancing cluster metadata only");
            return self
                .coordinator
                .transition_cluster_only(batch_id, batch)
                .await;
        }

        let read_only_stores = filter_stores(batch.final_stores(), StoreKind::ReadOnly);
        let read_write_stores = filter_stores(batch.final_stores(), StoreKind::ReadWrite);
        let has_read_only = !read_only_stores.is_empty();
        let has_read_write = !read_write_stores.is_empty();

        let read_only_moves = filter_moves_by_stores(batch.moves(), &read_only_stores);
        let read_write_moves = filter_moves_by_stores(batch.moves(), &read_write_stores);

        info!(
            batch_id,
            has_read_only,
            has_read_write,
            read_only_moves = read_only_moves.len(),
            read_write_moves = read_write_moves.len(),
            "Executing batch"
        );

        // Read-only step
        let phase = SubPhase {
            has_read_only,
            has_read_write,
            finished_read_only: false,
        };
        self.coordinator
            .transition(batch_id, batch, has_read_only, has_read_write, false, &read_only_moves)
            .await?;
        if has_read_only {
            self.execute_sub_batch(batch_id, batch, phase, read_only_moves)
                .await?;
        }

        // Read-write step
        let phase = SubPhase {
            finished_read_only: true,
            ..phase
        };
        self.coordinator
            .transition(batch_id, batch, has_read_only, has_read_write, true, &read_write_moves)
            .await?;
        if has_read_write {
            self.proxy_pause(batch_id).await;
            self.execute_sub_batch(batch_id, batch, phase, read_write_moves)
                .await?;
        }

        info!(batch_id, "Batch complete");
        Ok(())
    }

    /// Give routing proxies time to observe the committed topology
    async fn proxy_pause(&self, batch_id: usize) {
        let pause = self.config.proxy_pause();
        if pause.is_zero() {
            return;
        }

        info!(
            batch_id,
            pause_secs = pause.as_secs(),
            "Pausing before read-write migration so proxies pick up the new cluster"
        );
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = self.interrupter.notify.notified() => {
                warn!(batch_id, "Proxy pause interrupted, resuming migration");
            }
        }
    }

    async fn execute_sub_batch(
        &self,
        batch_id: usize,
        batch: &BatchPlan,
        phase: SubPhase,
        moves: Vec<PartitionMove>,
    ) -> Result<(), BatchError> {
        let tasks = self.build_tasks(batch_id, &moves)?;
        let partition_stores: usize = moves.iter().map(|m| m.partition_store_count()).sum();

        info!(
            batch_id,
            phase = phase.name(),
            tasks = tasks.len(),
            partition_stores,
            "Starting sub-batch"
        );

        let progress = BatchProgress::new(batch_id, tasks.len(), partition_stores, self.reporter.clone());
        let runner = TaskRunner::new(
            self.migrator.clone(),
            DonorPermits::for_cluster(batch.current_cluster()),
            self.config.retry_delay(),
        )
        .with_progress(progress);
        let mut pool = WorkerPool::new(self.config.parallelism(), self.config.worker_capacity);

        let dispatched = self.dispatch(batch_id, &tasks, runner, &mut pool).await;

        if let Err(e) = &dispatched {
            error!(batch_id, error = %e, "Worker pool did not terminate normally, forcing shutdown");
            pool.shutdown_now();
        }
        let abnormal = pool.await_termination().await;
        if abnormal > 0 {
            error!(
                batch_id,
                phase = phase.name(),
                abnormal,
                "Worker jobs panicked or were cancelled"
            );
        }
        dispatched?;

        match SubBatchOutcome::from_tasks(&tasks) {
            SubBatchOutcome::Success => {
                info!(batch_id, phase = phase.name(), "Sub-batch complete");
                Ok(())
            }
            SubBatchOutcome::RebalancingFailure(failures) => {
                error!(
                    batch_id,
                    phase = phase.name(),
                    failed = failures.len(),
                    "Sub-batch had failed tasks, rolling back"
                );
                if let Err(e) = self
                    .coordinator
                    .rollback(
                        batch_id,
                        batch,
                        phase.has_read_only,
                        phase.has_read_write,
                        phase.finished_read_only,
                    )
                    .await
                {
                    error!(batch_id, error = %e, "Metadata rollback failed");
                }
                Err(BatchError::RebalancingFailure { failures })
            }
            SubBatchOutcome::Incomplete(task_ids) => {
                error!(
                    batch_id,
                    phase = phase.name(),
                    incomplete = ?task_ids,
                    "Sub-batch has incomplete tasks, leaving metadata for operator review"
                );
                Err(BatchError::IncompleteTasks { task_ids })
            }
        }
    }

    fn build_tasks(
        &self,
        batch_id: usize,
        moves: &[PartitionMove],
    ) -> Result<Vec<Arc<RebalanceTask>>, BatchError> {
        let max_tries = self.config.max_tries;
        let mut tasks = Vec::new();

        match self.config.strategy {
            RebalanceStrategy::StealerBased => {
                for m in moves {
                    let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                    tasks.push(Arc::new(RebalanceTask::stealer_based(
                        batch_id,
                        task_id,
                        vec![m.clone()],
                        max_tries,
                    )?));
                }
            }
            RebalanceStrategy::DonorBased => {
                for group in group_moves_by_donor(moves).into_values() {
                    let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                    tasks.push(Arc::new(RebalanceTask::donor_based(
                        batch_id, task_id, group, max_tries,
                    )?));
                }
            }
        }
        Ok(tasks)
    }

    async fn dispatch(
        &self,
        batch_id: usize,
        tasks: &[Arc<RebalanceTask>],
        runner: TaskRunner,
        pool: &mut WorkerPool,
    ) -> Result<(), BatchError> {
        match self.config.strategy {
            RebalanceStrategy::StealerBased => {
                let mut scheduler = TaskScheduler::new(batch_id, runner, self.config.parallelism());
                if let Some(seed) = self.seed {
                    scheduler = scheduler.with_seed(seed);
                }
                if let Some(observer) = &self.observer {
                    scheduler = scheduler.with_observer(observer.clone());
                }
                scheduler.run(tasks.to_vec(), pool).await
            }
            RebalanceStrategy::DonorBased => {
                for task in tasks {
                    let runner = runner.clone();
                    let task = task.clone();
                    pool.submit(async move { runner.run(task).await })?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminError, ServerState, StateTransition, StateTransitionRequest};
    use crate::error::MigrationError;
    use parking_lot::Mutex;
    use partkv_core::{Cluster, Node, StoreDefinition};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingAdmin {
        transitions: Mutex<Vec<StateTransition>>,
    }

    #[async_trait::async_trait]
    impl AdminClient for RecordingAdmin {
        async fn fetch_cluster_state(
            &self,
        ) -> Result<(Cluster, Vec<StoreDefinition>), AdminError> {
            Err(AdminError::Rpc("unused".to_string()))
        }

        async fn server_state(&self, _node: &Node) -> Result<ServerState, AdminError> {
            Ok(ServerState::Normal)
        }

        async fn read_only_format(&self, _node: &Node, _store: &str) -> Result<u32, AdminError> {
            Ok(2)
        }

        async fn transition_state(&self, request: StateTransitionRequest) -> Result<(), AdminError> {
            self.transitions.lock().push(request.transition);
            Ok(())
        }
    }

    struct InstantMigrator;

    #[async_trait::async_trait]
    impl PartitionMigrator for InstantMigrator {
        async fn migrate(
            &self,
            _batch_id: usize,
            _task_id: usize,
            _partition_move: &PartitionMove,
        ) -> Result<(), MigrationError> {
            Ok(())
        }
    }

    fn cluster(layout: &[(u32, Vec<u32>)]) -> Cluster {
        Cluster::new(
            "test",
            layout
                .iter()
                .map(|(id, parts)| Node::new(*id, "localhost", 6660 + *id as u16, parts.clone())),
        )
        .unwrap()
    }

    fn executor(admin: Arc<RecordingAdmin>, config: RebalanceConfig) -> BatchExecutor {
        BatchExecutor::new(admin, Arc::new(InstantMigrator), config).with_seed(1)
    }

    #[test]
    fn test_outcome_prefers_failures() {
        let m = PartitionMove::new(1, 0, [0], ["users"]).unwrap();
        let failed = Arc::new(RebalanceTask::stealer_based(0, 0, vec![m.clone()], 1).unwrap());
        failed.mark_running();
        failed.finish(Err(MigrationError::Timeout));
        let stuck = Arc::new(RebalanceTask::stealer_based(0, 1, vec![m], 1).unwrap());

        match SubBatchOutcome::from_tasks(&[failed, stuck.clone()]) {
            SubBatchOutcome::RebalancingFailure(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].task_id, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            SubBatchOutcome::from_tasks(&[stuck]),
            SubBatchOutcome::Incomplete(vec![1])
        );
        assert_eq!(SubBatchOutcome::from_tasks(&[]), SubBatchOutcome::Success);
    }

    #[tokio::test]
    async fn test_empty_batch_advances_metadata_only() {
        let admin = Arc::new(RecordingAdmin::default());
        let current = cluster(&[(0, vec![0]), (1, vec![1])]);
        let stores = vec![StoreDefinition::read_write("users", 1)];
        let batch = BatchPlan::new(current.clone(), stores.clone(), current, stores, Vec::new());

        executor(admin.clone(), RebalanceConfig::default())
            .execute_batch(0, &batch)
            .await
            .unwrap();

        assert_eq!(*admin.transitions.lock(), vec![StateTransition::ClusterOnly]);
    }

    #[tokio::test]
    async fn test_donor_based_runs_every_move() {
        let admin = Arc::new(RecordingAdmin::default());
        let current = cluster(&[(0, vec![0, 1]), (1, vec![]), (2, vec![])]);
        let target = cluster(&[(0, vec![]), (1, vec![0]), (2, vec![1])]);
        let stores = vec![StoreDefinition::read_write("users", 1)];
        let moves = vec![
            PartitionMove::new(1, 0, [0], ["users"]).unwrap(),
            PartitionMove::new(2, 0, [1], ["users"]).unwrap(),
        ];
        let batch = BatchPlan::new(current, stores.clone(), target, stores, moves);
        let (reporter, mut rx) = ProgressReporter::channel(16);
        let config = RebalanceConfig {
            strategy: RebalanceStrategy::DonorBased,
            proxy_pause_secs: 0,
            ..Default::default()
        };

        executor(admin.clone(), config)
            .with_reporter(reporter)
            .execute_batch(0, &batch)
            .await
            .unwrap();

        assert_eq!(*admin.transitions.lock(), vec![StateTransition::CommitAndMarker]);
        // One donor-based task for donor 0
        assert!(matches!(
            rx.recv().await,
            Some(crate::progress::ProgressUpdate::TaskFinished { tasks_total: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_interrupt_resumes_batch() {
        let admin = Arc::new(RecordingAdmin::default());
        let current = cluster(&[(0, vec![0]), (1, vec![])]);
        let target = cluster(&[(0, vec![]), (1, vec![0])]);
        let stores = vec![StoreDefinition::read_write("users", 1)];
        let moves = vec![PartitionMove::new(1, 0, [0], ["users"]).unwrap()];
        let batch = BatchPlan::new(current, stores.clone(), target, stores, moves);

        let executor = executor(admin, RebalanceConfig::default());
        let interrupter = executor.pause_interrupter();
        let start = tokio::time::Instant::now();

        let run = executor.execute_batch(0, &batch);
        let interrupt = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            interrupter.interrupt();
        };
        let (result, ()) = tokio::join!(run, interrupt);

        result.unwrap();
        assert!(start.elapsed() < Duration::from_secs(300));
    }
}
