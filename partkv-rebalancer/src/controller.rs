//! Rebalance controller
//!
//! Entry point for a rebalance. The controller is bound to the live cluster
//! at [`RebalanceController::connect`], asks a [`Planner`] for a plan, and
//! drives the plan batch by batch after validating both the plan and the
//! deployed cluster.

use crate::admin::{AdminClient, ServerState};
use crate::config::RebalanceConfig;
use crate::error::{RebalanceError, Result};
use crate::executor::{BatchExecutor, PauseInterrupter};
use crate::progress::{ProgressReporter, ProgressTracker, ProgressUpdate};
use crate::scheduler::SchedulerObserver;
use crate::task::PartitionMigrator;
use partkv_core::validation::{
    validate_cluster_stores, validate_current_final_cluster, validate_interim_final_cluster,
    validate_rebalance_stores,
};
use partkv_core::{filter_stores, Cluster, Plan, StoreDefinition, StoreKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Turns a current/final topology pair into an ordered plan
pub trait Planner: Send + Sync {
    fn plan(
        &self,
        current_cluster: &Cluster,
        current_stores: &[StoreDefinition],
        final_cluster: &Cluster,
        final_stores: &[StoreDefinition],
        batch_size: usize,
    ) -> partkv_core::Result<Plan>;
}

pub struct RebalanceController {
    admin: Arc<dyn AdminClient>,
    executor: BatchExecutor,
    reporter: ProgressReporter,
    current_cluster: Cluster,
    current_stores: Vec<StoreDefinition>,
}

impl RebalanceController {
    /// Bind to the live cluster, reading its topology and store definitions
    pub async fn connect(
        admin: Arc<dyn AdminClient>,
        migrator: Arc<dyn PartitionMigrator>,
        config: RebalanceConfig,
    ) -> Result<Self> {
        config.validate()?;
        crate::metrics::init_metrics();

        let (current_cluster, current_stores) = admin.fetch_cluster_state().await?;
        info!(
            cluster = current_cluster.name(),
            nodes = current_cluster.number_of_nodes(),
            stores = current_stores.len(),
            "Connected to cluster"
        );

        Ok(Self {
            executor: BatchExecutor::new(admin.clone(), migrator, config),
            admin,
            reporter: ProgressReporter::disabled(),
            current_cluster,
            current_stores,
        })
    }

    /// Stream progress updates to the returned receiver
    pub fn with_progress(mut self) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (reporter, rx) = ProgressReporter::channel(100);
        self.executor = self.executor.with_reporter(reporter.clone());
        self.reporter = reporter;
        (self, rx)
    }

    pub fn with_scheduler_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.executor = self.executor.with_scheduler_observer(observer);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.executor = self.executor.with_seed(seed);
        self
    }

    pub fn pause_interrupter(&self) -> PauseInterrupter {
        self.executor.pause_interrupter()
    }

    pub fn current_cluster(&self) -> &Cluster {
        &self.current_cluster
    }

    pub fn current_stores(&self) -> &[StoreDefinition] {
        &self.current_stores
    }

    pub fn config(&self) -> &RebalanceConfig {
        self.executor.config()
    }

    /// Plan a move from the connected cluster to `final_cluster`
    pub fn plan(
        &self,
        planner: &dyn Planner,
        final_cluster: &Cluster,
        final_stores: &[StoreDefinition],
        batch_size: usize,
    ) -> Result<Plan> {
        validate_cluster_stores(final_cluster, final_stores)?;
        // The connected cluster must already hold any new nodes, without partitions
        validate_interim_final_cluster(&self.current_cluster, final_cluster)?;

        let plan = planner.plan(
            &self.current_cluster,
            &self.current_stores,
            final_cluster,
            final_stores,
            batch_size,
        )?;
        info!(summary = %plan.summary(), "Rebalance plan ready");
        Ok(plan)
    }

    /// Plan a topology change that keeps the current store definitions
    pub fn plan_for_cluster(
        &self,
        planner: &dyn Planner,
        final_cluster: &Cluster,
        batch_size: usize,
    ) -> Result<Plan> {
        self.plan(planner, final_cluster, &self.current_stores, batch_size)
    }

    /// Validate the plan and the deployed cluster, then execute every batch
    #[instrument(skip(self, plan), fields(rebalance_id = %Uuid::new_v4(), batches = plan.number_of_batches()))]
    pub async fn rebalance(&self, plan: &Plan) -> Result<()> {
        self.validate_plan(plan)?;
        self.validate_cluster(plan).await?;
        self.execute_plan(plan).await
    }

    fn validate_plan(&self, plan: &Plan) -> Result<()> {
        info!("Validating rebalance plan");
        validate_cluster_stores(plan.current_cluster(), plan.current_stores())?;
        validate_cluster_stores(plan.final_cluster(), plan.final_stores())?;
        validate_current_final_cluster(plan.current_cluster(), plan.final_cluster())?;
        validate_rebalance_stores(plan.current_stores())?;
        validate_rebalance_stores(plan.final_stores())?;
        Ok(())
    }

    /// Every node must be serving normally and every read-only store must be
    /// at the expected on-disk format
    async fn validate_cluster(&self, plan: &Plan) -> Result<()> {
        info!("Validating deployed cluster is ready for rebalance");
        let final_cluster = plan.final_cluster();

        for node in final_cluster.nodes() {
            let state = self.admin.server_state(node).await?;
            if state != ServerState::Normal {
                return Err(RebalanceError::ClusterNotReady(format!(
                    "node {} is in {} state",
                    node.id, state
                )));
            }
        }

        let expected = self.config().read_only_format;
        for store in filter_stores(plan.final_stores(), StoreKind::ReadOnly) {
            for node in final_cluster.nodes() {
                let format = self.admin.read_only_format(node, &store.name).await?;
                if format != expected {
                    return Err(RebalanceError::ClusterNotReady(format!(
                        "read-only store {} on node {} is at format {}, expected {}",
                        store.name, node.id, format, expected
                    )));
                }
            }
        }
        Ok(())
    }

    async fn execute_plan(&self, plan: &Plan) -> Result<()> {
        let total_batches = plan.number_of_batches();
        let mut tracker = ProgressTracker::new(total_batches, plan.partition_stores_moved());

        info!(
            batches = total_batches,
            partition_stores = plan.partition_stores_moved(),
            "Starting to execute rebalance plan"
        );

        for (batch_id, batch) in plan.batches().iter().enumerate() {
            info!(
                batch_id,
                batch = batch_id + 1,
                of = total_batches,
                "Rebalancing batch"
            );
            debug!(batch_id, plan = %batch, "Batch plan");
            self.reporter.report(ProgressUpdate::BatchStarted {
                batch_id,
                total_batches,
                partition_stores: batch.partition_store_moves(),
            });

            let start = tokio::time::Instant::now();
            self.executor
                .execute_batch(batch_id, batch)
                .await
                .map_err(|cause| RebalanceError::Batch { batch_id, cause })?;

            let snapshot = tracker.record_batch(batch.partition_store_moves(), start.elapsed());
            crate::metrics::record_batch(batch.partition_store_moves());
            info!(
                batch_id,
                percent = snapshot.percent_complete(),
                estimated_remaining_secs = snapshot.estimated_remaining.as_secs(),
                summary = %snapshot.summary(),
                "Batch complete"
            );
            self.reporter.report(ProgressUpdate::BatchCompleted(snapshot));
        }

        info!("Rebalance plan complete");
        Ok(())
    }
}
