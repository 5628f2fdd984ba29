//! Rebalance metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names as constants
pub mod names {
    // Batch metrics
    pub const BATCHES_COMPLETED: &str = "partkv_rebalance_batches_completed_total";
    pub const PARTITION_STORES_MOVED: &str = "partkv_rebalance_partition_stores_moved_total";

    // Task metrics
    pub const TASKS_TOTAL: &str = "partkv_rebalance_tasks_total";
    pub const TASK_DURATION: &str = "partkv_rebalance_task_duration_seconds";
    pub const TASKS_IN_FLIGHT: &str = "partkv_rebalance_tasks_in_flight";

    // Metadata metrics
    pub const TRANSITIONS_TOTAL: &str = "partkv_rebalance_transitions_total";
    pub const ROLLBACKS_TOTAL: &str = "partkv_rebalance_rollbacks_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::BATCHES_COMPLETED,
        "Number of rebalance batches completed"
    );
    describe_counter!(
        names::PARTITION_STORES_MOVED,
        "Number of partition-stores migrated"
    );

    describe_counter!(
        names::TASKS_TOTAL,
        "Rebalance tasks reaching a terminal state, by outcome"
    );
    describe_histogram!(
        names::TASK_DURATION,
        "Rebalance task duration in seconds"
    );
    describe_gauge!(
        names::TASKS_IN_FLIGHT,
        "Rebalance tasks currently dispatched"
    );

    describe_counter!(
        names::TRANSITIONS_TOTAL,
        "Cluster metadata transitions issued, by kind"
    );
    describe_counter!(
        names::ROLLBACKS_TOTAL,
        "Cluster metadata rollbacks issued"
    );
}

pub fn record_task(succeeded: bool, duration: Duration) {
    let outcome = if succeeded { "succeeded" } else { "failed" };
    counter!(names::TASKS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::TASK_DURATION).record(duration.as_secs_f64());
}

pub fn set_tasks_in_flight(count: usize) {
    gauge!(names::TASKS_IN_FLIGHT).set(count as f64);
}

pub fn record_transition(kind: &'static str, rollback: bool) {
    counter!(names::TRANSITIONS_TOTAL, "kind" => kind).increment(1);
    if rollback {
        counter!(names::ROLLBACKS_TOTAL).increment(1);
    }
}

pub fn record_batch(partition_stores: usize) {
    counter!(names::BATCHES_COMPLETED).increment(1);
    counter!(names::PARTITION_STORES_MOVED).increment(partition_stores as u64);
}
