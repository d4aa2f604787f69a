//! Shard routing seam between the COPY coordinator and the cluster's
//! distribution metadata.
//!
//! The coordinator never interprets shard ranges itself. It asks a
//! [`ShardRouter`] which shards own a partition-key value and, the first time a
//! shard is touched, which replicas host it. The placement comes back with a
//! [`ShardLease`] that keeps the replica list stable until it is dropped.

pub mod shard_map;

pub use shard_map::ShardMap;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shardcopy_common::datum::Datum;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{DataType, NodeEndpoint, QualifiedName, ShardId};

/// Inclusive key range owned by a shard. Opaque to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub min: i64,
    pub max: i64,
}

impl ShardRange {
    pub fn contains(&self, token: i64) -> bool {
        self.min <= token && token <= self.max
    }
}

/// Immutable description of one shard for the lifetime of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub id: ShardId,
    /// Name of the distributed (logical) table owning the shard.
    pub table: String,
    pub range: ShardRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: DataType,
}

/// Routing metadata for one distributed table.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub name: QualifiedName,
    /// All columns in table order.
    pub columns: Vec<ColumnMeta>,
    pub partition_column: String,
    pub shards: Vec<ShardDescriptor>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Shared lock on a shard's placement list.
///
/// While any lease is alive the router refuses to add or remove replicas of
/// that shard. Dropping the lease releases it.
#[derive(Debug)]
pub struct ShardLease {
    shard_id: ShardId,
    holders: Option<Arc<AtomicUsize>>,
}

impl ShardLease {
    pub fn acquire(shard_id: ShardId, holders: Arc<AtomicUsize>) -> Self {
        holders.fetch_add(1, Ordering::AcqRel);
        Self {
            shard_id,
            holders: Some(holders),
        }
    }

    /// Lease for routers whose placements can never change.
    pub fn unlocked(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            holders: None,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }
}

impl Drop for ShardLease {
    fn drop(&mut self) {
        if let Some(holders) = self.holders.take() {
            holders.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Replica endpoints of one shard, read under its lease.
#[derive(Debug)]
pub struct ReplicaPlacement {
    pub shard_id: ShardId,
    pub replicas: Vec<NodeEndpoint>,
    pub lease: ShardLease,
}

/// Distribution metadata lookups used by the COPY coordinator.
pub trait ShardRouter: Send + Sync {
    /// Columns, partition column and shard list of a distributed table.
    fn table_metadata(&self, table: &QualifiedName) -> CopyResult<TableMetadata>;

    /// Shards whose range contains `key`. The coordinator sorts the result
    /// by shard id, so any order is accepted.
    fn shards_for(&self, table: &TableMetadata, key: &Datum) -> CopyResult<Vec<ShardDescriptor>>;

    /// Replica placements of `shard`, locked until the returned lease drops.
    fn replicas_for(&self, shard: &ShardDescriptor) -> CopyResult<ReplicaPlacement>;
}

/// Resolve the target table or fail with `UnknownTable`.
pub(crate) fn unknown_table(table: &QualifiedName) -> CopyError {
    CopyError::UnknownTable(table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_counts_holders() {
        let holders = Arc::new(AtomicUsize::new(0));
        let a = ShardLease::acquire(ShardId(1), holders.clone());
        let b = ShardLease::acquire(ShardId(1), holders.clone());
        assert_eq!(holders.load(Ordering::Acquire), 2);
        drop(a);
        assert_eq!(holders.load(Ordering::Acquire), 1);
        drop(b);
        assert_eq!(holders.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_range_is_inclusive() {
        let r = ShardRange { min: -5, max: 5 };
        assert!(r.contains(-5));
        assert!(r.contains(5));
        assert!(!r.contains(6));
    }
}
