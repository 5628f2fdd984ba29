//! Rebalancer error types
//!
//! Errors are layered: a single migration attempt fails with
//! [`MigrationError`], a batch fails with one of the [`BatchError`] kinds, and
//! `rebalance()` surfaces [`RebalanceError`].

use crate::admin::AdminError;
use crate::config::ConfigError;
use partkv_core::{CoreError, NodeId};
use std::fmt;
use thiserror::Error;

/// A single partition migration attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Timeout during transfer")]
    Timeout,
}

/// Invalid task construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Stealer-based task must carry exactly one move, got {0}")]
    InvalidMoveCount(usize),

    #[error("Donor-based task has no moves")]
    NoMoves,

    #[error("Donor-based task mixes donors {0} and {1}")]
    MixedDonors(NodeId, NodeId),
}

/// Worker pool refused a submission
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    Shutdown,

    #[error("Worker pool saturated at {0} tasks")]
    Saturated(usize),
}

/// A task that ended in the failed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: usize,
    pub stealer_id: Option<NodeId>,
    pub donor_id: NodeId,
    pub error: MigrationError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stealer_id {
            Some(stealer) => write!(
                f,
                "task {} (stealer {} <- donor {}): {}",
                self.task_id, stealer, self.donor_id, self.error
            ),
            None => write!(
                f,
                "task {} (donor {}): {}",
                self.task_id, self.donor_id, self.error
            ),
        }
    }
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a batch stopped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Invalid batch: {0}")]
    Validation(String),

    #[error("Metadata transition failed: {0}")]
    MetadataTransition(#[from] AdminError),

    #[error("Rebalance task terminated unsuccessfully on {} task(s): {}", .failures.len(), join_failures(.failures))]
    RebalancingFailure { failures: Vec<TaskFailure> },

    #[error("Rebalance tasks still incomplete: {task_ids:?}")]
    IncompleteTasks { task_ids: Vec<usize> },

    #[error("Rebalance task rejected by worker pool: {0}")]
    SchedulingRejected(#[from] PoolError),

    #[error("Invalid rebalance task: {0}")]
    InvalidTask(#[from] TaskError),
}

impl BatchError {
    /// Whether the failure came from dispatched tasks and warrants a metadata rollback
    pub fn is_rebalancing_failure(&self) -> bool {
        matches!(self, Self::RebalancingFailure { .. })
    }
}

/// Top-level rebalance error
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Invalid plan: {0}")]
    Validation(#[from] CoreError),

    #[error("Cluster not ready for rebalance: {0}")]
    ClusterNotReady(String),

    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rebalance failed on batch {batch_id}: {cause}")]
    Batch {
        batch_id: usize,
        #[source]
        cause: BatchError,
    },
}

impl RebalanceError {
    /// The batch-level cause, if the failure happened while executing a batch
    pub fn batch_cause(&self) -> Option<&BatchError> {
        match self {
            Self::Batch { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RebalanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalancing_failure_lists_tasks() {
        let err = BatchError::RebalancingFailure {
            failures: vec![TaskFailure {
                task_id: 3,
                stealer_id: Some(1),
                donor_id: 0,
                error: MigrationError::Timeout,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 task(s)"));
        assert!(msg.contains("task 3 (stealer 1 <- donor 0)"));
        assert!(err.is_rebalancing_failure());
    }

    #[test]
    fn test_batch_error_from_admin() {
        let err: BatchError = AdminError::Unreachable(4).into();
        assert!(matches!(err, BatchError::MetadataTransition(_)));
        assert!(!err.is_rebalancing_failure());
    }

    #[test]
    fn test_rebalance_error_batch_cause() {
        let err = RebalanceError::Batch {
            batch_id: 2,
            cause: BatchError::IncompleteTasks { task_ids: vec![1] },
        };
        assert!(err.to_string().starts_with("Rebalance failed on batch 2"));
        assert!(matches!(
            err.batch_cause(),
            Some(BatchError::IncompleteTasks { .. })
        ));
    }
}
