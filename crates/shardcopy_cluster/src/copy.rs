//! Distributed COPY entry point.
//!
//! One [`DistributedCopy::run`] call is one operation: drain the row source
//! into per-shard replica streams, then drive the commit protocol over every
//! connection the rows opened. Any failure before the commit phase rolls
//! back every replica before the error is returned.

use std::sync::Arc;

use shardcopy_common::config::CopySettings;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{OperationId, ShardId};

use crate::connection::ReplicaConnector;
use crate::registry::ConnectionRegistry;
use crate::replication::ReplicationCoordinator;
use crate::routing::{ShardRouter, TableMetadata};
use crate::source::RowSource;
use crate::statement::{CopyDirection, CopyRequest, CopyStatementBuilder};
use crate::two_phase::{OperationPhase, TransactionCoordinator};
use crate::txn_manager;

/// Outcome of a COPY whose prepare phase succeeded.
#[derive(Debug)]
pub struct CopySummary {
    pub operation_id: OperationId,
    pub table: String,
    /// Rows streamed to at least one shard.
    pub rows_copied: u64,
    /// Rows no shard owned.
    pub rows_skipped: u64,
    /// Touched shards, ascending.
    pub shards: Vec<ShardId>,
    pub replicas_committed: usize,
    /// Whether the commit protocol could leave no partial commit behind.
    pub atomic_commit: bool,
    /// Commit-phase failures. Sibling replicas stay committed.
    pub commit_failures: Vec<CopyError>,
}

impl CopySummary {
    pub fn is_fully_committed(&self) -> bool {
        self.commit_failures.is_empty()
    }

    /// Turn the first commit-phase failure into an error.
    pub fn ensure_committed(mut self) -> CopyResult<Self> {
        if self.commit_failures.is_empty() {
            Ok(self)
        } else {
            Err(self.commit_failures.remove(0))
        }
    }
}

/// Owns the per-operation state from the first row to the terminal phase.
///
/// If the operation is dropped before it reaches a terminal phase (for
/// example its future is cancelled) the guard reports every connection left
/// open and the gid of each prepared one.
pub struct OperationGuard {
    operation_id: OperationId,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) coordinator: TransactionCoordinator,
}

impl OperationGuard {
    pub fn new(
        operation_id: OperationId,
        registry: ConnectionRegistry,
        coordinator: TransactionCoordinator,
    ) -> Self {
        Self {
            operation_id,
            registry,
            coordinator,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn phase(&self) -> OperationPhase {
        self.coordinator.phase()
    }

    /// Roll back everything and hand back `err`.
    async fn fail(&mut self, err: CopyError) -> CopyError {
        tracing::warn!("copy operation {} failed: {}", self.operation_id, err);
        self.coordinator.abort_all(&mut self.registry).await;
        err
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.coordinator.phase() == OperationPhase::Closed {
            return;
        }
        let open: Vec<_> = self.registry.open_connections().collect();
        if open.is_empty() {
            return;
        }
        tracing::error!(
            "copy operation {} dropped in phase {:?} with {} open replica connection(s)",
            self.operation_id,
            self.coordinator.phase(),
            open.len()
        );
        for conn in open {
            if conn.is_prepared() {
                tracing::error!(
                    "shard {}: prepared transaction '{}' left on {}; resolve with COMMIT PREPARED or ROLLBACK PREPARED",
                    conn.shard_id(),
                    self.coordinator.gid(conn.shard_id()),
                    conn.endpoint()
                );
            } else {
                tracing::warn!(
                    "shard {}: connection to {} dropped in state {:?}",
                    conn.shard_id(),
                    conn.endpoint(),
                    conn.state()
                );
            }
        }
    }
}

/// Validated shape of a COPY FROM request.
struct CopyPlan {
    table: TableMetadata,
    key_index: usize,
    column_count: usize,
}

/// Bulk-load coordinator for sharded, replicated tables.
pub struct DistributedCopy {
    router: Arc<dyn ShardRouter>,
    connector: Arc<dyn ReplicaConnector>,
    settings: CopySettings,
}

impl DistributedCopy {
    pub fn new(
        router: Arc<dyn ShardRouter>,
        connector: Arc<dyn ReplicaConnector>,
        settings: CopySettings,
    ) -> Self {
        Self {
            router,
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &CopySettings {
        &self.settings
    }

    fn plan(&self, request: &CopyRequest) -> CopyResult<CopyPlan> {
        if request.direction == CopyDirection::To {
            return Err(CopyError::InvalidRequest(
                "COPY TO is served by the distributed query path; rewrite it with export_statement"
                    .into(),
            ));
        }
        if request.is_binary() {
            return Err(CopyError::InvalidRequest(
                "COPY in binary format is not supported".into(),
            ));
        }

        let table = self.router.table_metadata(&request.table)?;
        if table.shards.is_empty() {
            return Err(CopyError::NoShardsForTable {
                table: table.name.to_string(),
            });
        }

        let columns: Vec<String> = if request.columns.is_empty() {
            table.column_names()
        } else {
            for (i, column) in request.columns.iter().enumerate() {
                if table.column(column).is_none() {
                    return Err(CopyError::InvalidRequest(format!(
                        "column \"{}\" of table \"{}\" does not exist",
                        column, table.name
                    )));
                }
                if request.columns[..i].contains(column) {
                    return Err(CopyError::InvalidRequest(format!(
                        "column \"{}\" specified more than once",
                        column
                    )));
                }
            }
            request.columns.clone()
        };

        let key_index = columns
            .iter()
            .position(|c| *c == table.partition_column)
            .ok_or_else(|| {
                CopyError::InvalidRequest(format!(
                    "partition column \"{}\" of table \"{}\" must be copied",
                    table.partition_column, table.name
                ))
            })?;

        Ok(CopyPlan {
            column_count: columns.len(),
            key_index,
            table,
        })
    }

    /// Run one COPY FROM operation to completion.
    ///
    /// Returns an error if anything failed before the commit phase, in which
    /// case no replica kept any row. Commit-phase failures are collected in
    /// the summary instead.
    pub async fn run(
        &self,
        request: &CopyRequest,
        source: &mut dyn RowSource,
    ) -> CopyResult<CopySummary> {
        let plan = self.plan(request)?;
        let table_name = plan.table.name.to_string();
        let operation_id = OperationId::generate();
        let manager = txn_manager::build(self.settings.txn_manager);
        let atomic_commit = manager.is_atomic();
        if !atomic_commit {
            tracing::warn!(
                "copy operation {} uses the {} transaction manager: a commit-phase failure can leave shards partially committed",
                operation_id,
                manager.name()
            );
        }

        let registry = ConnectionRegistry::new(
            self.connector.clone(),
            manager.clone(),
            CopyStatementBuilder::new(request)?,
        );
        let coordinator = TransactionCoordinator::new(
            manager,
            self.settings.clone(),
            plan.table.name.name.clone(),
            operation_id,
        );
        let mut guard = OperationGuard::new(operation_id, registry, coordinator);
        let mut replication = ReplicationCoordinator::new(
            self.router.as_ref(),
            plan.table,
            plan.key_index,
            plan.column_count,
        );

        tracing::info!("copy operation {} into '{}' started", operation_id, table_name);

        if let Err(e) = stream_rows(&mut replication, &mut guard.registry, source).await {
            let err = guard.fail(e).await;
            shardcopy_observability::record_copy_outcome(&table_name, "aborted");
            return Err(err);
        }
        replication.finish(&guard.registry);

        if let Err(e) = guard.coordinator.prepare_all(&mut guard.registry).await {
            let err = guard.fail(e).await;
            shardcopy_observability::record_copy_outcome(&table_name, "aborted");
            return Err(err);
        }

        let shards = guard.registry.shard_ids();
        let outcome = guard.coordinator.commit_all(&mut guard.registry).await;
        let rows_copied = replication.rows_seen() - replication.rows_unrouted();

        shardcopy_observability::record_copy_outcome(&table_name, "committed");
        shardcopy_observability::record_rows_streamed(&table_name, rows_copied);
        shardcopy_observability::record_shards_touched(shards.len());
        if outcome.failures.is_empty() {
            tracing::info!(
                "copy operation {} committed {} row(s) into '{}' across {} shard(s)",
                operation_id,
                rows_copied,
                table_name,
                shards.len()
            );
        } else {
            tracing::error!(
                "copy operation {} into '{}': {} replica(s) failed to commit",
                operation_id,
                table_name,
                outcome.failures.len()
            );
        }

        Ok(CopySummary {
            operation_id,
            table: table_name,
            rows_copied,
            rows_skipped: replication.rows_unrouted(),
            shards,
            replicas_committed: outcome.replicas_committed,
            atomic_commit,
            commit_failures: outcome.failures,
        })
    }
}

async fn stream_rows(
    replication: &mut ReplicationCoordinator<'_>,
    registry: &mut ConnectionRegistry,
    source: &mut dyn RowSource,
) -> CopyResult<()> {
    while let Some(row) = source.next_row()? {
        replication.route(registry, row).await?;
    }
    Ok(())
}
