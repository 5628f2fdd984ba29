//! partkv Rebalancer Library
//!
//! This crate drives a pre-computed rebalance plan against a live partkv
//! cluster.
//!
//! For every batch of the plan the rebalancer:
//! - Commits cluster metadata in the right order (read-only stores first)
//! - Migrates partitions with a node-exclusive task scheduler
//! - Rolls metadata back when migration tasks fail
//! - Reports progress and an estimate of the time left

pub mod admin;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod progress;
pub mod scheduler;
pub mod task;

// Re-export main types
pub use admin::{
    AdminClient, AdminError, ServerState, StateTransition, StateTransitionRequest,
    TransitionToggles,
};
pub use config::{ConfigError, RebalanceConfig, RebalanceStrategy};
pub use controller::{Planner, RebalanceController};
pub use coordinator::ClusterStateCoordinator;
pub use error::{
    BatchError, MigrationError, PoolError, RebalanceError, Result, TaskError, TaskFailure,
};
pub use executor::{BatchExecutor, PauseInterrupter, SubBatchOutcome};
pub use pool::WorkerPool;
pub use progress::{
    estimate_remaining, BatchProgress, ProgressReporter, ProgressSnapshot, ProgressTracker,
    ProgressUpdate,
};
pub use scheduler::{SchedulerObserver, TaskDone, TaskScheduler};
pub use task::{DonorPermits, PartitionMigrator, RebalanceTask, TaskKind, TaskRunner, TaskState};
