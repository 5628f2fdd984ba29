//! partkv Core Library
//!
//! Shared model for the partkv rebalancing control plane.
//! This crate provides:
//! - Immutable cluster snapshots (nodes and their partitions)
//! - Store definitions and their read-only / read-write classification
//! - The pre-computed rebalance plan: batches of partition moves
//! - Validation of clusters, stores and current/final topology pairs

pub mod cluster;
pub mod error;
pub mod plan;
pub mod store;
pub mod validation;

pub use cluster::{Cluster, Node, NodeId, PartitionId};
pub use error::{CoreError, Result};
pub use plan::{filter_moves_by_stores, group_moves_by_donor, BatchPlan, PartitionMove, Plan};
pub use store::{filter_stores, StoreDefinition, StoreKind};
