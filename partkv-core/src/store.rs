//! Store definitions
//!
//! Read-only stores publish data by swapping a pre-built version into place;
//! read-write stores take live in-place writes. The two are migrated in
//! separate sub-phases of each batch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine name used by read-only stores
pub const READ_ONLY_ENGINE: &str = "read-only";

/// Engines whose data the rebalancer knows how to move
pub const REBALANCEABLE_ENGINES: &[&str] = &["bdb", "rocksdb", READ_ONLY_ENGINE];

/// Store classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Swap-based publication
    ReadOnly,
    /// Live in-place writes
    ReadWrite,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// A store hosted by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub name: String,
    pub kind: StoreKind,
    /// Storage engine backing the store
    pub engine: String,
    pub replication_factor: usize,
}

impl StoreDefinition {
    pub fn read_only(name: impl Into<String>, replication_factor: usize) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::ReadOnly,
            engine: READ_ONLY_ENGINE.to_string(),
            replication_factor,
        }
    }

    pub fn read_write(name: impl Into<String>, replication_factor: usize) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::ReadWrite,
            engine: "bdb".to_string(),
            replication_factor,
        }
    }

    /// Override the storage engine
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == StoreKind::ReadOnly
    }
}

/// Stores of the given kind, in definition order
pub fn filter_stores(stores: &[StoreDefinition], kind: StoreKind) -> Vec<StoreDefinition> {
    stores.iter().filter(|s| s.kind == kind).cloned().collect()
}
