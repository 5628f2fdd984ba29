//! Cluster state coordinator
//!
//! Chooses and issues the metadata transition for each step of a batch. The
//! choice is a pure function of which store kinds the batch touches and
//! whether the read-only sub-phase has finished:
//!
//! | read-only | read-write | RO finished | transition            |
//! |-----------|------------|-------------|-----------------------|
//! | yes       | yes        | yes         | `CommitSwapAndMarker` |
//! | yes       | yes        | no          | `MarkerOnly`          |
//! | yes       | no         | yes         | `CommitAndSwap`       |
//! | yes       | no         | no          | `MarkerOnly`          |
//! | no        | yes        | yes         | `CommitAndMarker`     |
//! | no        | yes        | no          | none                  |
//! | no        | no         | either      | invalid batch         |
//!
//! Transition RPCs are never retried here.

use crate::admin::{AdminClient, StateTransition, StateTransitionRequest};
use crate::error::BatchError;
use partkv_core::{BatchPlan, PartitionMove};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ClusterStateCoordinator {
    admin: Arc<dyn AdminClient>,
}

impl ClusterStateCoordinator {
    pub fn new(admin: Arc<dyn AdminClient>) -> Self {
        Self { admin }
    }

    /// Forward transition for a batch step, `None` when the step needs none
    pub fn select(
        has_read_only: bool,
        has_read_write: bool,
        finished_read_only: bool,
    ) -> Result<Option<StateTransition>, BatchError> {
        match (has_read_only, has_read_write, finished_read_only) {
            (true, true, true) => Ok(Some(StateTransition::CommitSwapAndMarker)),
            (true, true, false) => Ok(Some(StateTransition::MarkerOnly)),
            (true, false, true) => Ok(Some(StateTransition::CommitAndSwap)),
            (true, false, false) => Ok(Some(StateTransition::MarkerOnly)),
            (false, true, true) => Ok(Some(StateTransition::CommitAndMarker)),
            (false, true, false) => Ok(None),
            (false, false, _) => Err(BatchError::Validation(
                "batch has neither read-only nor read-write stores".to_string(),
            )),
        }
    }

    /// Rollback undoing the forward transition of a failed sub-phase
    pub fn select_rollback(
        has_read_only: bool,
        has_read_write: bool,
        finished_read_only: bool,
    ) -> Option<StateTransition> {
        match (has_read_only, has_read_write, finished_read_only) {
            // The read-only step only raised the marker, which servers clear
            // when the sub-phase fails
            (_, _, false) => None,
            (true, true, true) => Some(StateTransition::RollbackCommitAndSwap),
            (false, true, true) => Some(StateTransition::RollbackCommit),
            (_, false, true) => None,
        }
    }

    /// Issue the forward transition for one step of `batch`
    pub async fn transition(
        &self,
        batch_id: usize,
        batch: &BatchPlan,
        has_read_only: bool,
        has_read_write: bool,
        finished_read_only: bool,
        moves: &[PartitionMove],
    ) -> Result<Option<StateTransition>, BatchError> {
        let Some(transition) = Self::select(has_read_only, has_read_write, finished_read_only)?
        else {
            info!(
                batch_id,
                has_read_only,
                has_read_write,
                finished_read_only,
                "No metadata transition needed for this step"
            );
            return Ok(None);
        };

        self.issue(batch_id, transition, forward_request(transition, batch, moves))
            .await?;
        Ok(Some(transition))
    }

    /// Advance the topology of a batch that moves no data
    pub async fn transition_cluster_only(
        &self,
        batch_id: usize,
        batch: &BatchPlan,
    ) -> Result<(), BatchError> {
        let transition = StateTransition::ClusterOnly;
        self.issue(batch_id, transition, forward_request(transition, batch, &[]))
            .await
    }

    /// Restore the pre-batch topology after a failed sub-phase. Returns the
    /// rollback issued, if any.
    pub async fn rollback(
        &self,
        batch_id: usize,
        batch: &BatchPlan,
        has_read_only: bool,
        has_read_write: bool,
        finished_read_only: bool,
    ) -> Result<Option<StateTransition>, BatchError> {
        let Some(transition) =
            Self::select_rollback(has_read_only, has_read_write, finished_read_only)
        else {
            warn!(
                batch_id,
                finished_read_only, "Sub-phase failed, no metadata to roll back"
            );
            return Ok(None);
        };

        let request = StateTransitionRequest {
            transition,
            cluster_before: None,
            cluster_after: batch.current_cluster().clone(),
            stores_before: None,
            stores_after: batch.current_stores().to_vec(),
            moves: Vec::new(),
        };
        warn!(batch_id, %transition, "Rolling back cluster metadata");
        self.issue(batch_id, transition, request).await?;
        Ok(Some(transition))
    }

    async fn issue(
        &self,
        batch_id: usize,
        transition: StateTransition,
        request: StateTransitionRequest,
    ) -> Result<(), BatchError> {
        info!(
            batch_id,
            %transition,
            moves = request.moves.len(),
            "Issuing cluster metadata transition"
        );

        match self.admin.transition_state(request).await {
            Ok(()) => {
                crate::metrics::record_transition(transition.as_str(), transition.is_rollback());
                Ok(())
            }
            Err(e) => {
                error!(batch_id, %transition, error = %e, "Cluster metadata transition failed");
                Err(BatchError::MetadataTransition(e))
            }
        }
    }
}

fn forward_request(
    transition: StateTransition,
    batch: &BatchPlan,
    moves: &[PartitionMove],
) -> StateTransitionRequest {
    StateTransitionRequest {
        transition,
        cluster_before: Some(batch.current_cluster().clone()),
        cluster_after: batch.final_cluster().clone(),
        stores_before: Some(batch.current_stores().to_vec()),
        stores_after: batch.final_stores().to_vec(),
        moves: moves.to_vec(),
    }
}
