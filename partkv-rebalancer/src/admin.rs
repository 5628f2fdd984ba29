//! Admin collaborator interface
//!
//! The rebalancer talks to the cluster through [`AdminClient`]: it reads the
//! deployed topology, probes node health before starting, and issues cluster
//! metadata transitions. The transport behind it is out of scope; every call
//! is treated as atomic-or-failed.

use partkv_core::{Cluster, Node, NodeId, PartitionMove, StoreDefinition};
use std::fmt;
use thiserror::Error;

/// Admin RPC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("Node {0} unreachable")]
    Unreachable(NodeId),

    #[error("Admin request failed: {0}")]
    Rpc(String),
}

/// Operating state reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Serving traffic, not rebalancing
    Normal,
    /// Still carrying a rebalancing marker from an earlier run
    Rebalancing,
    /// Up but refusing work
    Offline,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Rebalancing => write!(f, "rebalancing"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Toggles carried by one metadata transition RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionToggles {
    /// Swap read-only data pointers to the newly fetched version
    pub swap_read_only: bool,
    /// Commit the new cluster topology
    pub commit_cluster: bool,
    /// Enter or leave the rebalancing-in-progress marker
    pub rebalancing_marker: bool,
    /// Servers undo partial application themselves if any node fails
    pub rollback_on_failure: bool,
    /// Persist the change to durable metadata
    pub persist: bool,
}

/// The closed set of metadata transitions the rebalancer issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTransition {
    /// Advance the topology with no data movement (empty batch)
    ClusterOnly,
    /// Flip the rebalancing marker only (before read-only movement)
    MarkerOnly,
    /// Commit topology and swap read-only pointers
    CommitAndSwap,
    /// Commit topology, swap read-only pointers, flip the marker
    CommitSwapAndMarker,
    /// Commit topology and flip the marker
    CommitAndMarker,
    /// Restore the pre-batch topology and swap read-only pointers back
    RollbackCommitAndSwap,
    /// Restore the pre-batch topology
    RollbackCommit,
}

impl StateTransition {
    pub fn toggles(&self) -> TransitionToggles {
        let (swap_read_only, commit_cluster, rebalancing_marker, rollback_on_failure, persist) =
            match self {
                Self::ClusterOnly => (false, true, false, false, true),
                Self::MarkerOnly => (false, false, true, true, true),
                Self::CommitAndSwap => (true, true, false, true, true),
                Self::CommitSwapAndMarker => (true, true, true, true, true),
                Self::CommitAndMarker => (false, true, true, true, true),
                Self::RollbackCommitAndSwap => (true, true, false, false, false),
                Self::RollbackCommit => (false, true, false, false, false),
            };
        TransitionToggles {
            swap_read_only,
            commit_cluster,
            rebalancing_marker,
            rollback_on_failure,
            persist,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::RollbackCommitAndSwap | Self::RollbackCommit)
    }

    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterOnly => "cluster_only",
            Self::MarkerOnly => "marker_only",
            Self::CommitAndSwap => "commit_and_swap",
            Self::CommitSwapAndMarker => "commit_swap_and_marker",
            Self::CommitAndMarker => "commit_and_marker",
            Self::RollbackCommitAndSwap => "rollback_commit_and_swap",
            Self::RollbackCommit => "rollback_commit",
        }
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully described metadata transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionRequest {
    pub transition: StateTransition,
    /// Topology being left; `None` for rollbacks
    pub cluster_before: Option<Cluster>,
    pub cluster_after: Cluster,
    pub stores_before: Option<Vec<StoreDefinition>>,
    pub stores_after: Vec<StoreDefinition>,
    /// Moves the transition covers; empty for rollbacks
    pub moves: Vec<PartitionMove>,
}

impl StateTransitionRequest {
    pub fn toggles(&self) -> TransitionToggles {
        self.transition.toggles()
    }
}

/// Admin operations against the live cluster
#[async_trait::async_trait]
pub trait AdminClient: Send + Sync {
    /// Latest deployed topology and store definitions
    async fn fetch_cluster_state(
        &self,
    ) -> Result<(Cluster, Vec<StoreDefinition>), AdminError>;

    /// Operating state of a single node
    async fn server_state(&self, node: &Node) -> Result<ServerState, AdminError>;

    /// On-disk format version of a read-only store on a node
    async fn read_only_format(&self, node: &Node, store: &str) -> Result<u32, AdminError>;

    /// Apply a metadata transition on every affected node
    async fn transition_state(&self, request: StateTransitionRequest) -> Result<(), AdminError>;
}
