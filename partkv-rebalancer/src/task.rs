//! Rebalance tasks
//!
//! A task is the unit of parallel migration work. Stealer-based tasks carry a
//! single partition move; donor-based tasks carry every move sharing a donor.
//! The [`TaskRunner`] drives a task through the [`PartitionMigrator`]
//! collaborator, retrying each move up to the task's retry budget, and leaves
//! it in exactly one terminal state.

use crate::error::{MigrationError, TaskError, TaskFailure};
use crate::progress::BatchProgress;
use parking_lot::Mutex;
use partkv_core::{Cluster, NodeId, PartitionMove};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Moves partition data from a donor to a stealer
#[async_trait::async_trait]
pub trait PartitionMigrator: Send + Sync {
    /// Perform one migration attempt for `partition_move`
    async fn migrate(
        &self,
        batch_id: usize,
        task_id: usize,
        partition_move: &PartitionMove,
    ) -> Result<(), MigrationError>;
}

/// How the task was cut from the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    StealerBased,
    DonorBased,
}

/// Task lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed(MigrationError),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// A unit of migration work within one batch sub-phase
#[derive(Debug)]
pub struct RebalanceTask {
    batch_id: usize,
    task_id: usize,
    kind: TaskKind,
    moves: Vec<PartitionMove>,
    max_tries: u32,
    state: Mutex<TaskState>,
}

impl RebalanceTask {
    /// Task for a single stealer/donor pair; `moves` must hold exactly one move
    pub fn stealer_based(
        batch_id: usize,
        task_id: usize,
        moves: Vec<PartitionMove>,
        max_tries: u32,
    ) -> Result<Self, TaskError> {
        if moves.len() != 1 {
            return Err(TaskError::InvalidMoveCount(moves.len()));
        }
        Ok(Self::new(batch_id, task_id, TaskKind::StealerBased, moves, max_tries))
    }

    /// Task covering every move that shares one donor
    pub fn donor_based(
        batch_id: usize,
        task_id: usize,
        moves: Vec<PartitionMove>,
        max_tries: u32,
    ) -> Result<Self, TaskError> {
        let first = moves.first().ok_or(TaskError::NoMoves)?.donor_id();
        if let Some(other) = moves.iter().find(|m| m.donor_id() != first) {
            return Err(TaskError::MixedDonors(first, other.donor_id()));
        }
        Ok(Self::new(batch_id, task_id, TaskKind::DonorBased, moves, max_tries))
    }

    fn new(
        batch_id: usize,
        task_id: usize,
        kind: TaskKind,
        moves: Vec<PartitionMove>,
        max_tries: u32,
    ) -> Self {
        Self {
            batch_id,
            task_id,
            kind,
            moves,
            max_tries: max_tries.max(1),
            state: Mutex::new(TaskState::Pending),
        }
    }

    pub fn batch_id(&self) -> usize {
        self.batch_id
    }

    pub fn task_id(&self) -> usize {
        self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn moves(&self) -> &[PartitionMove] {
        &self.moves
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Stealer of a stealer-based task
    pub fn stealer_id(&self) -> Option<NodeId> {
        match self.kind {
            TaskKind::StealerBased => self.moves.first().map(|m| m.stealer_id()),
            TaskKind::DonorBased => None,
        }
    }

    /// Donor shared by every move of the task
    pub fn donor_id(&self) -> NodeId {
        // Constructors guarantee at least one move
        self.moves.first().map(|m| m.donor_id()).unwrap_or_default()
    }

    pub fn partition_store_count(&self) -> usize {
        self.moves.iter().map(|m| m.partition_store_count()).sum()
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().clone()
    }

    /// Cause of failure; `None` unless the task failed
    pub fn error(&self) -> Option<MigrationError> {
        match &*self.state.lock() {
            TaskState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().is_terminal()
    }

    pub fn to_failure(&self) -> Option<TaskFailure> {
        self.error().map(|error| TaskFailure {
            task_id: self.task_id,
            stealer_id: self.stealer_id(),
            donor_id: self.donor_id(),
            error,
        })
    }

    /// Move to `next`. Terminal states are final; returns false when refused.
    fn advance(&self, next: TaskState) -> bool {
        let mut state = self.state.lock();
        let allowed = match (&*state, &next) {
            (TaskState::Pending, TaskState::Running) => true,
            (TaskState::Pending | TaskState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            *state = next;
        } else {
            warn!(
                task_id = self.task_id,
                from = ?*state,
                to = ?next,
                "Refused task state change"
            );
        }
        allowed
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.advance(TaskState::Running)
    }

    pub(crate) fn finish(&self, outcome: Result<(), MigrationError>) -> bool {
        match outcome {
            Ok(()) => self.advance(TaskState::Succeeded),
            Err(e) => self.advance(TaskState::Failed(e)),
        }
    }
}

/// One single-permit semaphore per node, so a donor serves one task at a time
#[derive(Debug, Clone, Default)]
pub struct DonorPermits {
    permits: Arc<HashMap<NodeId, Arc<Semaphore>>>,
}

impl DonorPermits {
    pub fn for_cluster(cluster: &Cluster) -> Self {
        let permits = cluster
            .node_ids()
            .into_iter()
            .map(|id| (id, Arc::new(Semaphore::new(1))))
            .collect();
        Self {
            permits: Arc::new(permits),
        }
    }

    /// Wait for the donor's permit; `None` when the node is not tracked
    pub async fn acquire(&self, donor: NodeId) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.permits.get(&donor)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    /// Free permits for `donor` (0 or 1)
    pub fn available(&self, donor: NodeId) -> Option<usize> {
        self.permits.get(&donor).map(|s| s.available_permits())
    }
}

/// Runs tasks against the migrator
#[derive(Clone)]
pub struct TaskRunner {
    migrator: Arc<dyn PartitionMigrator>,
    permits: DonorPermits,
    retry_delay: Duration,
    progress: Option<BatchProgress>,
}

impl TaskRunner {
    pub fn new(
        migrator: Arc<dyn PartitionMigrator>,
        permits: DonorPermits,
        retry_delay: Duration,
    ) -> Self {
        Self {
            migrator,
            permits,
            retry_delay,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: BatchProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drive `task` to a terminal state
    #[instrument(
        skip(self, task),
        fields(batch_id = task.batch_id(), task_id = task.task_id(), kind = ?task.kind())
    )]
    pub async fn run(&self, task: Arc<RebalanceTask>) {
        let start = Instant::now();

        let permit = self.permits.acquire(task.donor_id()).await;
        if permit.is_none() {
            debug!(donor_id = task.donor_id(), "No donor permit tracked for node");
        }

        if !task.mark_running() {
            return;
        }

        let outcome = self.migrate_all(&task).await;
        let succeeded = outcome.is_ok();
        if let Err(e) = &outcome {
            warn!(error = %e, "Rebalance task failed");
        }
        task.finish(outcome);
        drop(permit);

        crate::metrics::record_task(succeeded, start.elapsed());
        if let Some(progress) = &self.progress {
            progress.task_finished(task.task_id(), succeeded);
        }
    }

    async fn migrate_all(&self, task: &RebalanceTask) -> Result<(), MigrationError> {
        for partition_move in task.moves() {
            self.migrate_with_retries(task, partition_move).await?;
            if let Some(progress) = &self.progress {
                progress.record_partition_stores(partition_move.partition_store_count());
            }
        }
        Ok(())
    }

    async fn migrate_with_retries(
        &self,
        task: &RebalanceTask,
        partition_move: &PartitionMove,
    ) -> Result<(), MigrationError> {
        let mut attempt = 1;
        loop {
            match self
                .migrator
                .migrate(task.batch_id(), task.task_id(), partition_move)
                .await
            {
                Ok(()) => {
                    info!(
                        stealer_id = partition_move.stealer_id(),
                        donor_id = partition_move.donor_id(),
                        attempt,
                        "Partition move complete"
                    );
                    return Ok(());
                }
                Err(e) if attempt < task.max_tries() => {
                    warn!(
                        stealer_id = partition_move.stealer_id(),
                        donor_id = partition_move.donor_id(),
                        attempt,
                        error = %e,
                        "Partition move failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
