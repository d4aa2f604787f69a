use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use shardcopy_common::config::{PartitionMethod, TableConfig};
use shardcopy_common::datum::Datum;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{NodeEndpoint, QualifiedName, ShardId};

use super::{
    unknown_table, ColumnMeta, ReplicaPlacement, ShardDescriptor, ShardLease, ShardRange,
    ShardRouter, TableMetadata,
};

/// Hash token of a partition-key value: xxh3-64 over the type-tagged
/// encoding, reinterpreted as a signed 64-bit value.
pub fn hash_token(key: &Datum) -> i64 {
    let mut buf = Vec::with_capacity(16);
    key.encode_for_hash(&mut buf);
    xxh3_64(&buf) as i64
}

/// Split the full signed 64-bit token space into `n` contiguous ranges.
pub fn uniform_hash_ranges(n: u64) -> Vec<ShardRange> {
    if n == 0 {
        return Vec::new();
    }
    let span = (u64::MAX / n) as i128;
    (0..n)
        .map(|i| {
            let start = i64::MIN as i128 + span * i as i128;
            let end = if i == n - 1 {
                i64::MAX as i128
            } else {
                start + span - 1
            };
            ShardRange {
                min: start as i64,
                max: end as i64,
            }
        })
        .collect()
}

struct ShardEntry {
    descriptor: ShardDescriptor,
    replicas: RwLock<Vec<NodeEndpoint>>,
    holders: Arc<AtomicUsize>,
}

struct TableEntry {
    metadata: TableMetadata,
    method: PartitionMethod,
    shards: Vec<ShardEntry>,
}

/// Static shard map built from configuration.
///
/// Shards may own overlapping ranges; a key then routes to every shard whose
/// range contains it.
pub struct ShardMap {
    tables: Vec<TableEntry>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// Build a map from the `[[tables]]` sections of the config.
    pub fn from_config(tables: &[TableConfig]) -> CopyResult<Self> {
        let mut map = ShardMap::new();
        for table in tables {
            map.add_table(table)?;
        }
        Ok(map)
    }

    pub fn add_table(&mut self, table: &TableConfig) -> CopyResult<()> {
        let name = QualifiedName::new(table.schema.as_deref(), table.name.clone());
        if self.tables.iter().any(|t| t.metadata.name == name) {
            return Err(CopyError::Config(format!("table '{}' declared twice", name)));
        }
        let mut shards = Vec::with_capacity(table.shards.len());
        for shard in &table.shards {
            // Replica placements are looked up by shard id alone.
            if let Some(owner) = self.shard(ShardId(shard.id)) {
                return Err(CopyError::Config(format!(
                    "table '{}': shard id {} is already used by table '{}'",
                    name, shard.id, owner.descriptor.table
                )));
            }
            if shards.iter().any(|s: &ShardEntry| s.descriptor.id == ShardId(shard.id)) {
                return Err(CopyError::Config(format!(
                    "table '{}': duplicate shard id {}",
                    name, shard.id
                )));
            }
            let replicas = shard
                .replicas
                .iter()
                .map(|r| r.parse::<NodeEndpoint>().map_err(CopyError::Config))
                .collect::<CopyResult<Vec<_>>>()?;
            shards.push(ShardEntry {
                descriptor: ShardDescriptor {
                    id: ShardId(shard.id),
                    table: table.name.clone(),
                    range: ShardRange {
                        min: shard.min,
                        max: shard.max,
                    },
                },
                replicas: RwLock::new(replicas),
                holders: Arc::new(AtomicUsize::new(0)),
            });
        }
        shards.sort_by_key(|s| s.descriptor.id);
        let metadata = TableMetadata {
            name,
            columns: table
                .columns
                .iter()
                .map(|c| ColumnMeta {
                    name: c.name.clone(),
                    data_type: c.data_type,
                })
                .collect(),
            partition_column: table.partition_column.clone(),
            shards: shards.iter().map(|s| s.descriptor.clone()).collect(),
        };
        self.tables.push(TableEntry {
            metadata,
            method: table.partition_method,
            shards,
        });
        Ok(())
    }

    /// Resolve a table name. An unqualified name must match exactly one
    /// table unless one of the matches is itself unqualified.
    fn table(&self, table: &QualifiedName) -> CopyResult<&TableEntry> {
        if let Some(exact) = self.tables.iter().find(|t| t.metadata.name == *table) {
            return Ok(exact);
        }
        if table.schema.is_some() {
            return Err(unknown_table(table));
        }
        let mut matches = self.tables.iter().filter(|t| t.metadata.name.name == table.name);
        match (matches.next(), matches.next()) {
            (Some(only), None) => Ok(only),
            (None, _) => Err(unknown_table(table)),
            (Some(first), Some(second)) => Err(CopyError::InvalidRequest(format!(
                "table name \"{}\" is ambiguous: it matches {} and {}; qualify it with a schema",
                table.name, first.metadata.name, second.metadata.name
            ))),
        }
    }

    fn shard(&self, shard_id: ShardId) -> Option<&ShardEntry> {
        self.tables
            .iter()
            .flat_map(|t| t.shards.iter())
            .find(|s| s.descriptor.id == shard_id)
    }

    /// Add a replica placement. Fails while a COPY holds the shard's lease.
    pub fn add_replica(&self, shard_id: ShardId, endpoint: NodeEndpoint) -> CopyResult<()> {
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| CopyError::Config(format!("unknown shard {}", shard_id)))?;
        let mut replicas = shard.replicas.write();
        let holders = shard.holders.load(Ordering::Acquire);
        if holders > 0 {
            return Err(CopyError::ShardMetadataLocked { shard_id, holders });
        }
        if !replicas.contains(&endpoint) {
            tracing::info!("ShardMap: shard {} gains replica {}", shard_id, endpoint);
            replicas.push(endpoint);
        }
        Ok(())
    }

    /// Remove a replica placement. Fails while a COPY holds the shard's lease.
    pub fn remove_replica(&self, shard_id: ShardId, endpoint: &NodeEndpoint) -> CopyResult<bool> {
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| CopyError::Config(format!("unknown shard {}", shard_id)))?;
        let mut replicas = shard.replicas.write();
        let holders = shard.holders.load(Ordering::Acquire);
        if holders > 0 {
            return Err(CopyError::ShardMetadataLocked { shard_id, holders });
        }
        let before = replicas.len();
        replicas.retain(|r| r != endpoint);
        Ok(replicas.len() != before)
    }
}

impl Default for ShardMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardRouter for ShardMap {
    fn table_metadata(&self, table: &QualifiedName) -> CopyResult<TableMetadata> {
        self.table(table).map(|t| t.metadata.clone())
    }

    fn shards_for(&self, table: &TableMetadata, key: &Datum) -> CopyResult<Vec<ShardDescriptor>> {
        let entry = self.table(&table.name)?;
        let token = match entry.method {
            PartitionMethod::Hash => hash_token(key),
            PartitionMethod::Range => key.as_i64().ok_or_else(|| {
                CopyError::InvalidRequest(format!(
                    "range-partitioned table '{}' needs an integer partition key, got '{}'",
                    table.name, key
                ))
            })?,
        };
        Ok(entry
            .shards
            .iter()
            .filter(|s| s.descriptor.range.contains(token))
            .map(|s| s.descriptor.clone())
            .collect())
    }

    fn replicas_for(&self, shard: &ShardDescriptor) -> CopyResult<ReplicaPlacement> {
        let entry = self
            .shard(shard.id)
            .ok_or_else(|| CopyError::Internal(format!("shard {} vanished from map", shard.id)))?;
        // Lease first, then read: a placement change racing with us either
        // finished before the read or is refused.
        let lease = ShardLease::acquire(shard.id, entry.holders.clone());
        let replicas = entry.replicas.read().clone();
        Ok(ReplicaPlacement {
            shard_id: shard.id,
            replicas,
            lease,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcopy_common::config::{ColumnConfig, ShardConfig};
    use shardcopy_common::types::DataType;

    fn range_table() -> TableConfig {
        TableConfig {
            schema: None,
            name: "orders".into(),
            columns: vec![
                ColumnConfig {
                    name: "id".into(),
                    data_type: DataType::Int64,
                },
                ColumnConfig {
                    name: "note".into(),
                    data_type: DataType::Text,
                },
            ],
            partition_column: "id".into(),
            partition_method: PartitionMethod::Range,
            shards: vec![
                ShardConfig {
                    id: 3,
                    min: 100,
                    max: 199,
                    replicas: vec!["b:5432".into()],
                },
                ShardConfig {
                    id: 1,
                    min: 0,
                    max: 99,
                    replicas: vec!["a:5432".into(), "b:5432".into()],
                },
                ShardConfig {
                    id: 7,
                    min: 50,
                    max: 149,
                    replicas: vec!["c:5432".into()],
                },
            ],
        }
    }

    #[test]
    fn test_range_routing_with_overlap() {
        let map = ShardMap::from_config(&[range_table()]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("orders")).unwrap();
        let ids: Vec<u64> = map
            .shards_for(&meta, &Datum::Int64(120))
            .unwrap()
            .iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(ids, vec![3, 7]);
        assert!(map.shards_for(&meta, &Datum::Int64(500)).unwrap().is_empty());
    }

    #[test]
    fn test_range_routing_rejects_text_key() {
        let map = ShardMap::from_config(&[range_table()]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("orders")).unwrap();
        let err = map.shards_for(&meta, &Datum::Text("x".into())).unwrap_err();
        assert!(matches!(err, CopyError::InvalidRequest(_)));
    }

    #[test]
    fn test_hash_routing_is_stable_and_total() {
        let mut table = range_table();
        table.partition_method = PartitionMethod::Hash;
        table.shards = uniform_hash_ranges(4)
            .into_iter()
            .enumerate()
            .map(|(i, r)| ShardConfig {
                id: i as u64 + 10,
                min: r.min,
                max: r.max,
                replicas: vec!["a:5432".into()],
            })
            .collect();
        let map = ShardMap::from_config(&[table]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("orders")).unwrap();
        for key in 0..200i64 {
            let first = map.shards_for(&meta, &Datum::Int64(key)).unwrap();
            let second = map.shards_for(&meta, &Datum::Int64(key)).unwrap();
            assert_eq!(first.len(), 1, "every token is owned by exactly one shard");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_uniform_ranges_cover_token_space() {
        let ranges = uniform_hash_ranges(3);
        assert_eq!(ranges[0].min, i64::MIN);
        assert_eq!(ranges[2].max, i64::MAX);
        assert_eq!(ranges[0].max + 1, ranges[1].min);
        assert_eq!(ranges[1].max + 1, ranges[2].min);
    }

    #[test]
    fn test_unknown_table() {
        let map = ShardMap::from_config(&[range_table()]).unwrap();
        let err = map
            .table_metadata(&QualifiedName::parse("missing"))
            .unwrap_err();
        assert!(matches!(err, CopyError::UnknownTable(_)));
    }

    #[test]
    fn test_lease_blocks_placement_changes() {
        let map = ShardMap::from_config(&[range_table()]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("orders")).unwrap();
        let shard = meta.shards.iter().find(|s| s.id == ShardId(1)).unwrap().clone();

        let placement = map.replicas_for(&shard).unwrap();
        assert_eq!(placement.replicas.len(), 2);

        let err = map
            .add_replica(ShardId(1), NodeEndpoint::new("d", 5432))
            .unwrap_err();
        assert!(matches!(
            err,
            CopyError::ShardMetadataLocked { holders: 1, .. }
        ));

        drop(placement);
        map.add_replica(ShardId(1), NodeEndpoint::new("d", 5432)).unwrap();
        assert_eq!(map.replicas_for(&shard).unwrap().replicas.len(), 3);
        assert!(map
            .remove_replica(ShardId(1), &NodeEndpoint::new("a", 5432))
            .unwrap());
    }

    fn single_shard_table(schema: Option<&str>, name: &str, host: &str) -> TableConfig {
        TableConfig {
            schema: schema.map(str::to_string),
            name: name.into(),
            columns: vec![ColumnConfig {
                name: "id".into(),
                data_type: DataType::Int64,
            }],
            partition_column: "id".into(),
            partition_method: PartitionMethod::Range,
            shards: vec![ShardConfig {
                id: 1,
                min: 0,
                max: 99,
                replicas: vec![format!("{}:5432", host)],
            }],
        }
    }

    #[test]
    fn test_shard_id_shared_across_tables_rejected() {
        let err = ShardMap::from_config(&[
            single_shard_table(None, "a", "host-a"),
            single_shard_table(None, "b", "host-b"),
        ])
        .err()
        .unwrap();
        match err {
            CopyError::Config(msg) => assert!(msg.contains("shard id 1"), "{}", msg),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_replicas_resolved_within_owning_table() {
        let mut b = single_shard_table(None, "b", "host-b");
        b.shards[0].id = 2;
        let map = ShardMap::from_config(&[single_shard_table(None, "a", "host-a"), b]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("b")).unwrap();
        let shard = map.shards_for(&meta, &Datum::Int64(5)).unwrap().remove(0);
        let placement = map.replicas_for(&shard).unwrap();
        assert_eq!(placement.replicas, vec![NodeEndpoint::new("host-b", 5432)]);
    }

    #[test]
    fn test_ambiguous_unqualified_name_rejected() {
        let mut other = single_shard_table(Some("archive"), "events", "host-b");
        other.shards[0].id = 2;
        let map = ShardMap::from_config(&[
            single_shard_table(Some("app"), "events", "host-a"),
            other,
        ])
        .unwrap();

        let err = map
            .table_metadata(&QualifiedName::parse("events"))
            .unwrap_err();
        assert!(matches!(err, CopyError::InvalidRequest(ref m) if m.contains("ambiguous")));

        let meta = map
            .table_metadata(&QualifiedName::parse("archive.events"))
            .unwrap();
        assert_eq!(meta.shards[0].id, ShardId(2));
        assert!(matches!(
            map.table_metadata(&QualifiedName::parse("other.events")),
            Err(CopyError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_unqualified_name_prefers_unqualified_table() {
        let mut other = single_shard_table(Some("archive"), "events", "host-b");
        other.shards[0].id = 2;
        let map =
            ShardMap::from_config(&[single_shard_table(None, "events", "host-a"), other]).unwrap();
        let meta = map.table_metadata(&QualifiedName::parse("events")).unwrap();
        assert_eq!(meta.shards[0].id, ShardId(1));
    }
}
