//! Cluster topology snapshots
//!
//! A [`Cluster`] is an immutable view of the nodes in the store and the
//! partitions each of them owns. Topology changes never mutate a snapshot;
//! the planner produces a new one instead.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Node identifier
pub type NodeId = u32;

/// Partition identifier
pub type PartitionId = u32;

/// A single storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub admin_port: u16,
    /// Partitions this node is primary for
    #[serde(default)]
    pub partitions: BTreeSet<PartitionId>,
}

impl Node {
    pub fn new(
        id: NodeId,
        host: impl Into<String>,
        admin_port: u16,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            admin_port,
            partitions: partitions.into_iter().collect(),
        }
    }

    /// Admin endpoint, `host:port`
    pub fn admin_address(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }

    pub fn has_partition(&self, partition: PartitionId) -> bool {
        self.partitions.contains(&partition)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({})", self.id, self.admin_address())
    }
}

/// Immutable cluster snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    name: String,
    nodes: BTreeMap<NodeId, Node>,
}

impl Cluster {
    /// Build a snapshot, rejecting duplicate node ids and doubly-owned partitions
    pub fn new(name: impl Into<String>, nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(CoreError::DuplicateNode(node.id));
            }
            by_id.insert(node.id, node);
        }

        let cluster = Self {
            name: name.into(),
            nodes: by_id,
        };
        cluster.check_partition_ownership()?;
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// All partition ids owned by some node
    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.nodes
            .values()
            .flat_map(|n| n.partitions.iter().copied())
            .collect()
    }

    pub fn number_of_partitions(&self) -> usize {
        self.nodes.values().map(|n| n.partitions.len()).sum()
    }

    /// Node currently owning `partition`
    pub fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.has_partition(partition))
            .map(|n| n.id)
    }

    /// Re-check the ownership invariant. Snapshots built through [`Cluster::new`]
    /// always pass; deserialized ones may not.
    pub fn check_partition_ownership(&self) -> Result<()> {
        let mut owners: BTreeMap<PartitionId, NodeId> = BTreeMap::new();
        for node in self.nodes.values() {
            for &partition in &node.partitions {
                if let Some(&first) = owners.get(&partition) {
                    return Err(CoreError::PartitionConflict {
                        partition,
                        first,
                        second: node.id,
                    });
                }
                owners.insert(partition, node.id);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster '{}' ({} nodes, {} partitions)",
            self.name,
            self.nodes.len(),
            self.number_of_partitions()
        )
    }
}
