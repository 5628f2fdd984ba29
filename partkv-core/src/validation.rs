//! Plan and topology validation
//!
//! Pure checks run before any metadata is touched. A failure here means the
//! plan or the cluster description is inconsistent; nothing needs rolling back.

use crate::cluster::Cluster;
use crate::error::{CoreError, Result};
use crate::store::{StoreDefinition, StoreKind, READ_ONLY_ENGINE, REBALANCEABLE_ENGINES};
use std::collections::HashSet;

/// Check that `stores` can be hosted on `cluster`
pub fn validate_cluster_stores(cluster: &Cluster, stores: &[StoreDefinition]) -> Result<()> {
    if cluster.number_of_nodes() == 0 {
        return Err(CoreError::EmptyCluster);
    }
    cluster.check_partition_ownership()?;

    let mut seen = HashSet::new();
    for store in stores {
        if !seen.insert(store.name.as_str()) {
            return Err(CoreError::DuplicateStore(store.name.clone()));
        }
        if store.replication_factor > cluster.number_of_nodes() {
            return Err(CoreError::ReplicationTooHigh {
                store: store.name.clone(),
                replication_factor: store.replication_factor,
                nodes: cluster.number_of_nodes(),
            });
        }
    }
    Ok(())
}

/// Check that `current` and `target` describe the same nodes and partitions.
///
/// New nodes must already be present in `current`, possibly owning nothing,
/// so that a rebalance only ever moves partitions between known nodes.
pub fn validate_current_final_cluster(current: &Cluster, target: &Cluster) -> Result<()> {
    let current_nodes = current.node_ids();
    let target_nodes = target.node_ids();
    if current_nodes != target_nodes {
        let missing: Vec<_> = target_nodes.difference(&current_nodes).collect();
        let extra: Vec<_> = current_nodes.difference(&target_nodes).collect();
        return Err(CoreError::NodeSetMismatch(format!(
            "missing from current: {:?}, missing from final: {:?}",
            missing, extra
        )));
    }

    let current_partitions = current.partition_ids();
    let target_partitions = target.partition_ids();
    if current_partitions != target_partitions {
        return Err(CoreError::PartitionSetMismatch(format!(
            "current has {} partitions, final has {}",
            current_partitions.len(),
            target_partitions.len()
        )));
    }
    Ok(())
}

/// Same contract as [`validate_current_final_cluster`], applied when planning
/// from an interim cluster.
pub fn validate_interim_final_cluster(interim: &Cluster, target: &Cluster) -> Result<()> {
    validate_current_final_cluster(interim, target)
}

/// Check that every store uses an engine the rebalancer can move
pub fn validate_rebalance_stores(stores: &[StoreDefinition]) -> Result<()> {
    for store in stores {
        if !REBALANCEABLE_ENGINES.contains(&store.engine.as_str()) {
            return Err(CoreError::UnsupportedEngine {
                store: store.name.clone(),
                engine: store.engine.clone(),
            });
        }
        let engine_is_read_only = store.engine == READ_ONLY_ENGINE;
        if engine_is_read_only != (store.kind == StoreKind::ReadOnly) {
            return Err(CoreError::KindMismatch(store.name.clone()));
        }
    }
    Ok(())
}
