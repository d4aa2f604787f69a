use std::collections::BTreeMap;

use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::ShardId;

use crate::registry::ConnectionRegistry;
use crate::routing::{ShardRouter, TableMetadata};
use crate::source::SourceRow;

/// Terminator appended to every record sent to a replica.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Routes each input row to the replicas of every shard that owns it.
pub struct ReplicationCoordinator<'a> {
    router: &'a dyn ShardRouter,
    table: TableMetadata,
    key_index: usize,
    column_count: usize,
    rows_seen: u64,
    rows_unrouted: u64,
    record: Vec<u8>,
}

impl<'a> ReplicationCoordinator<'a> {
    /// `key_index` is the position of the partition column among the copied
    /// columns.
    pub fn new(
        router: &'a dyn ShardRouter,
        table: TableMetadata,
        key_index: usize,
        column_count: usize,
    ) -> Self {
        Self {
            router,
            table,
            key_index,
            column_count,
            rows_seen: 0,
            rows_unrouted: 0,
            record: Vec::new(),
        }
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn rows_unrouted(&self) -> u64 {
        self.rows_unrouted
    }

    /// Stream one row to its owning shards.
    ///
    /// The partition key is checked before any connection is touched.
    pub async fn route(
        &mut self,
        registry: &mut ConnectionRegistry,
        row: SourceRow,
    ) -> CopyResult<()> {
        self.rows_seen += 1;
        let row_no = self.rows_seen;

        if row.values.len() != self.column_count {
            return Err(CopyError::Source {
                line: row_no,
                reason: format!(
                    "expected {} column(s), got {}",
                    self.column_count,
                    row.values.len()
                ),
            });
        }
        let key = &row.values[self.key_index];
        if key.is_null() {
            return Err(CopyError::NullPartitionKey {
                column: self.table.partition_column.clone(),
                row: row_no,
            });
        }

        let mut shards = self.router.shards_for(&self.table, key)?;
        shards.sort_by_key(|s| s.id);
        shards.dedup_by_key(|s| s.id);
        if shards.is_empty() {
            if self.rows_unrouted == 0 {
                tracing::warn!(
                    "row {} of '{}': no shard owns partition key {}; row skipped",
                    row_no,
                    self.table.name,
                    key
                );
            }
            self.rows_unrouted += 1;
            return Ok(());
        }

        self.record.clear();
        self.record.extend_from_slice(&row.line);
        self.record.push(RECORD_TERMINATOR);

        for shard in &shards {
            let set = registry.get_or_create(shard, self.router).await?;
            for conn in set.connections_mut() {
                if let Err(e) = conn.send(&self.record).await {
                    tracing::warn!(
                        "shard {}: write to {} failed at row {}: {}",
                        conn.shard_id(),
                        conn.endpoint(),
                        row_no,
                        e
                    );
                    shardcopy_observability::record_replica_failure("stream");
                    return Err(CopyError::StreamFailure {
                        shard_id: conn.shard_id(),
                        endpoint: conn.endpoint().clone(),
                        reason: e.to_string(),
                    });
                }
            }
            set.record_row();
        }
        Ok(())
    }

    /// Called once the row source is exhausted.
    pub fn finish(&self, registry: &ConnectionRegistry) -> BTreeMap<ShardId, u64> {
        let per_shard: BTreeMap<ShardId, u64> = registry
            .sets()
            .map(|s| (s.shard_id(), s.rows_routed()))
            .collect();
        tracing::info!(
            "'{}': {} row(s) read, {} shard(s) touched, {} replica connection(s)",
            self.table.name,
            self.rows_seen,
            per_shard.len(),
            registry.connection_count()
        );
        if self.rows_unrouted > 0 {
            tracing::warn!(
                "'{}': {} row(s) had no owning shard and were skipped",
                self.table.name,
                self.rows_unrouted
            );
        }
        for (shard_id, rows) in &per_shard {
            tracing::debug!("shard {}: {} row(s) streamed", shard_id, rows);
        }
        per_shard
    }
}
