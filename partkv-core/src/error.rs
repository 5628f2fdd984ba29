//! Error types for partkv
//!
//! Provides the error type for cluster model and plan validation.

use crate::cluster::{NodeId, PartitionId};
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for the cluster model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // ===== Cluster Errors =====
    #[error("Cluster has no nodes")]
    EmptyCluster,

    #[error("Duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("Partition {partition} assigned to both node {first} and node {second}")]
    PartitionConflict {
        partition: PartitionId,
        first: NodeId,
        second: NodeId,
    },

    #[error("Node {0} not present in cluster")]
    UnknownNode(NodeId),

    #[error("Clusters differ in node membership: {0}")]
    NodeSetMismatch(String),

    #[error("Clusters differ in partition layout: {0}")]
    PartitionSetMismatch(String),

    // ===== Store Errors =====
    #[error("Duplicate store definition: {0}")]
    DuplicateStore(String),

    #[error("Store '{store}' needs replication factor {replication_factor} but cluster has {nodes} nodes")]
    ReplicationTooHigh {
        store: String,
        replication_factor: usize,
        nodes: usize,
    },

    #[error("Store '{store}' uses engine '{engine}' which cannot be rebalanced")]
    UnsupportedEngine { store: String, engine: String },

    #[error("Store '{0}' classification does not match its engine")]
    KindMismatch(String),

    // ===== Plan Errors =====
    #[error("Invalid partition move: {0}")]
    InvalidMove(String),

    #[error("Plan serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
