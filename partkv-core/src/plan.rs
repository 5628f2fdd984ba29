//! Rebalance plan
//!
//! A [`Plan`] is produced once by a planner and is read-only afterwards. It is
//! an ordered list of [`BatchPlan`]s; each batch carries the topology it starts
//! from, the topology it ends at, and the partition moves that get it there.
//! All execution state lives outside the plan.

use crate::cluster::{Cluster, NodeId, PartitionId};
use crate::error::{CoreError, Result};
use crate::store::StoreDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Partitions a stealer takes over from a single donor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionMove {
    stealer_id: NodeId,
    donor_id: NodeId,
    partitions: BTreeSet<PartitionId>,
    stores: BTreeSet<String>,
}

impl PartitionMove {
    pub fn new(
        stealer_id: NodeId,
        donor_id: NodeId,
        partitions: impl IntoIterator<Item = PartitionId>,
        stores: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        if stealer_id == donor_id {
            return Err(CoreError::InvalidMove(format!(
                "node {} cannot steal from itself",
                stealer_id
            )));
        }

        let partitions: BTreeSet<_> = partitions.into_iter().collect();
        let stores: BTreeSet<String> = stores.into_iter().map(Into::into).collect();

        if partitions.is_empty() {
            return Err(CoreError::InvalidMove(format!(
                "move {} <- {} has no partitions",
                stealer_id, donor_id
            )));
        }
        if stores.is_empty() {
            return Err(CoreError::InvalidMove(format!(
                "move {} <- {} has no stores",
                stealer_id, donor_id
            )));
        }

        Ok(Self {
            stealer_id,
            donor_id,
            partitions,
            stores,
        })
    }

    pub fn stealer_id(&self) -> NodeId {
        self.stealer_id
    }

    pub fn donor_id(&self) -> NodeId {
        self.donor_id
    }

    pub fn partitions(&self) -> &BTreeSet<PartitionId> {
        &self.partitions
    }

    pub fn stores(&self) -> &BTreeSet<String> {
        &self.stores
    }

    /// Number of (partition, store) pairs this move migrates
    pub fn partition_store_count(&self) -> usize {
        self.partitions.len() * self.stores.len()
    }

    /// This move limited to the given stores, `None` if no store remains
    pub fn restrict_to(&self, stores: &[StoreDefinition]) -> Option<PartitionMove> {
        let kept: BTreeSet<String> = self
            .stores
            .iter()
            .filter(|name| stores.iter().any(|s| &s.name == *name))
            .cloned()
            .collect();

        if kept.is_empty() {
            return None;
        }

        Some(PartitionMove {
            stealer_id: self.stealer_id,
            donor_id: self.donor_id,
            partitions: self.partitions.clone(),
            stores: kept,
        })
    }
}

impl fmt::Display for PartitionMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stealer {} <- donor {}: partitions {:?} for stores {:?}",
            self.stealer_id, self.donor_id, self.partitions, self.stores
        )
    }
}

/// Restrict every move to `stores`, dropping moves with nothing left
pub fn filter_moves_by_stores(
    moves: &[PartitionMove],
    stores: &[StoreDefinition],
) -> Vec<PartitionMove> {
    moves.iter().filter_map(|m| m.restrict_to(stores)).collect()
}

/// Group moves by donor node, keeping each group in plan order
pub fn group_moves_by_donor(moves: &[PartitionMove]) -> BTreeMap<NodeId, Vec<PartitionMove>> {
    let mut groups: BTreeMap<NodeId, Vec<PartitionMove>> = BTreeMap::new();
    for m in moves {
        groups.entry(m.donor_id).or_default().push(m.clone());
    }
    groups
}

/// One batch of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    current_cluster: Cluster,
    current_stores: Vec<StoreDefinition>,
    final_cluster: Cluster,
    final_stores: Vec<StoreDefinition>,
    moves: Vec<PartitionMove>,
}

impl BatchPlan {
    pub fn new(
        current_cluster: Cluster,
        current_stores: Vec<StoreDefinition>,
        final_cluster: Cluster,
        final_stores: Vec<StoreDefinition>,
        moves: Vec<PartitionMove>,
    ) -> Self {
        Self {
            current_cluster,
            current_stores,
            final_cluster,
            final_stores,
            moves,
        }
    }

    pub fn current_cluster(&self) -> &Cluster {
        &self.current_cluster
    }

    pub fn current_stores(&self) -> &[StoreDefinition] {
        &self.current_stores
    }

    pub fn final_cluster(&self) -> &Cluster {
        &self.final_cluster
    }

    pub fn final_stores(&self) -> &[StoreDefinition] {
        &self.final_stores
    }

    pub fn moves(&self) -> &[PartitionMove] {
        &self.moves
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Partition-stores migrated by this batch, used for progress accounting
    pub fn partition_store_moves(&self) -> usize {
        self.moves.iter().map(|m| m.partition_store_count()).sum()
    }
}

impl fmt::Display for BatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "batch: {} moves, {} partition-stores",
            self.moves.len(),
            self.partition_store_moves()
        )?;
        for m in &self.moves {
            writeln!(f, "  {}", m)?;
        }
        Ok(())
    }
}

/// The whole, ordered rebalance plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    current_cluster: Cluster,
    current_stores: Vec<StoreDefinition>,
    final_cluster: Cluster,
    final_stores: Vec<StoreDefinition>,
    batches: Vec<BatchPlan>,
}

impl Plan {
    pub fn new(
        current_cluster: Cluster,
        current_stores: Vec<StoreDefinition>,
        final_cluster: Cluster,
        final_stores: Vec<StoreDefinition>,
        batches: Vec<BatchPlan>,
    ) -> Self {
        Self {
            current_cluster,
            current_stores,
            final_cluster,
            final_stores,
            batches,
        }
    }

    pub fn current_cluster(&self) -> &Cluster {
        &self.current_cluster
    }

    pub fn current_stores(&self) -> &[StoreDefinition] {
        &self.current_stores
    }

    pub fn final_cluster(&self) -> &Cluster {
        &self.final_cluster
    }

    pub fn final_stores(&self) -> &[StoreDefinition] {
        &self.final_stores
    }

    pub fn batches(&self) -> &[BatchPlan] {
        &self.batches
    }

    pub fn number_of_batches(&self) -> usize {
        self.batches.len()
    }

    /// Total partition-stores the plan moves
    pub fn partition_stores_moved(&self) -> usize {
        self.batches.iter().map(|b| b.partition_store_moves()).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} batches, {} partition-stores to move, {} -> {}",
            self.batches.len(),
            self.partition_stores_moved(),
            self.current_cluster,
            self.final_cluster
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
