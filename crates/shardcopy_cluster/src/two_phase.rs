//! Two-phase commit over every replica connection opened by an operation.
//!
//! Protocol:
//! 1. **Prepare**: shards in ascending id order; for each replica end the
//!    copy stream and PREPARE under the shard's global transaction id. The
//!    first failure stops the phase and records the shard.
//! 2. **Commit**: only once every connection is prepared. COMMIT PREPARED
//!    everywhere; a failure is reported per shard and does not undo the
//!    siblings that already committed.
//! 3. **Abort**: ROLLBACK PREPARED on prepared connections, cancel the copy
//!    and plain ROLLBACK on the rest. Also the recovery path for any failure
//!    while rows are still streaming.
//!
//! Every connection is closed exactly once, whichever way the operation ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shardcopy_common::config::CopySettings;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{OperationId, ShardId};

use crate::connection::{ReplicaConnection, ReplicaState};
use crate::registry::ConnectionRegistry;
use crate::txn_manager::{GlobalTxnId, TransactionManager};

/// Position of an operation in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Streaming,
    Preparing,
    Committing,
    Aborting,
    Closed,
}

/// Result of the commit phase.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub replicas_committed: usize,
    pub failures: Vec<CopyError>,
}

pub struct TransactionCoordinator {
    txn_manager: Arc<dyn TransactionManager>,
    settings: CopySettings,
    table: String,
    operation_id: OperationId,
    phase: OperationPhase,
    failed_shard: Option<ShardId>,
}

impl TransactionCoordinator {
    pub fn new(
        txn_manager: Arc<dyn TransactionManager>,
        settings: CopySettings,
        table: impl Into<String>,
        operation_id: OperationId,
    ) -> Self {
        Self {
            txn_manager,
            settings,
            table: table.into(),
            operation_id,
            phase: OperationPhase::Streaming,
            failed_shard: None,
        }
    }

    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    /// Shard that first failed to prepare, if any.
    pub fn failed_shard(&self) -> Option<ShardId> {
        self.failed_shard
    }

    pub fn gid(&self, shard_id: ShardId) -> GlobalTxnId {
        GlobalTxnId::new(
            &self.settings.gid_prefix,
            &self.table,
            shard_id,
            self.operation_id,
        )
    }

    /// End every copy stream and prepare every connection.
    ///
    /// On error the failing shard is recorded and the caller must run
    /// [`abort_all`](Self::abort_all). Returns the rows accepted per shard.
    pub async fn prepare_all(
        &mut self,
        registry: &mut ConnectionRegistry,
    ) -> CopyResult<Vec<(ShardId, u64)>> {
        self.phase = OperationPhase::Preparing;
        let start = Instant::now();
        let txn_manager = self.txn_manager.clone();
        let mut accepted = Vec::with_capacity(registry.len());

        for set in registry.sets_mut() {
            let shard_id = set.shard_id();
            let gid = self.gid(shard_id);
            let mut shard_rows: Option<u64> = None;

            for conn in set.connections_mut() {
                let rows = match conn.end_stream().await {
                    Ok(rows) => rows,
                    Err(e) => return Err(self.prepare_failed(conn, "ending copy", e)),
                };
                if let Err(e) = txn_manager.prepare(conn.link(), &gid).await {
                    return Err(self.prepare_failed(conn, "prepare", e));
                }
                conn.set_state(ReplicaState::Prepared);

                match shard_rows {
                    None => shard_rows = Some(rows),
                    Some(expected) if expected != rows => {
                        tracing::warn!(
                            "shard {}: replica {} accepted {} row(s), earlier replicas {}",
                            shard_id,
                            conn.endpoint(),
                            rows,
                            expected
                        );
                        self.failed_shard = Some(shard_id);
                        return Err(CopyError::OperationFailed { shard_id });
                    }
                    Some(_) => {}
                }
            }
            let rows = shard_rows.unwrap_or(0);
            tracing::debug!("shard {}: prepared as '{}' with {} row(s)", shard_id, gid, rows);
            accepted.push((shard_id, rows));
        }

        shardcopy_observability::record_prepare_duration(start.elapsed());
        tracing::info!(
            "prepared {} shard(s) for '{}' using {}",
            accepted.len(),
            self.table,
            txn_manager.name()
        );
        Ok(accepted)
    }

    fn prepare_failed(
        &mut self,
        conn: &ReplicaConnection,
        step: &str,
        cause: CopyError,
    ) -> CopyError {
        tracing::warn!(
            "shard {}: {} on {} failed: {}",
            conn.shard_id(),
            step,
            conn.endpoint(),
            cause
        );
        shardcopy_observability::record_replica_failure("prepare");
        self.failed_shard = Some(conn.shard_id());
        CopyError::PrepareFailure {
            shard_id: conn.shard_id(),
            endpoint: conn.endpoint().clone(),
            reason: cause.to_string(),
        }
    }

    /// Commit every prepared connection and close all of them.
    pub async fn commit_all(&mut self, registry: &mut ConnectionRegistry) -> CommitOutcome {
        self.phase = OperationPhase::Committing;
        let start = Instant::now();
        let txn_manager = self.txn_manager.clone();
        let mut outcome = CommitOutcome::default();

        for set in registry.sets_mut() {
            let gid = self.gid(set.shard_id());
            for conn in set.connections_mut() {
                if !conn.is_prepared() {
                    // Unreachable when prepare_all succeeded; keep the replica
                    // from holding an open transaction all the same.
                    tracing::error!(
                        "shard {}: replica {} reached commit in state {:?}; rolling back",
                        conn.shard_id(),
                        conn.endpoint(),
                        conn.state()
                    );
                    self.rollback_unprepared(txn_manager.as_ref(), conn).await;
                    outcome.failures.push(CopyError::Internal(format!(
                        "shard {} replica {} was not prepared at commit time",
                        conn.shard_id(),
                        conn.endpoint()
                    )));
                    conn.close().await;
                    continue;
                }
                match self.commit_with_retry(txn_manager.as_ref(), conn, &gid).await {
                    Ok(()) => outcome.replicas_committed += 1,
                    Err(e) => {
                        tracing::error!(
                            "shard {}: COMMIT PREPARED '{}' failed on {}: {}; \
                             the prepared transaction must be resolved manually",
                            conn.shard_id(),
                            gid,
                            conn.endpoint(),
                            e
                        );
                        shardcopy_observability::record_commit_failure();
                        outcome.failures.push(CopyError::CommitFailure {
                            shard_id: conn.shard_id(),
                            endpoint: conn.endpoint().clone(),
                            gid: gid.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
                conn.close().await;
            }
            set.release_lease();
        }

        shardcopy_observability::record_commit_duration(start.elapsed());
        self.phase = OperationPhase::Closed;
        outcome
    }

    async fn commit_with_retry(
        &self,
        txn_manager: &dyn TransactionManager,
        conn: &mut ReplicaConnection,
        gid: &GlobalTxnId,
    ) -> CopyResult<()> {
        let retry = &self.settings.commit_retry;
        let mut attempt = 0u32;
        loop {
            match txn_manager.commit_prepared(conn.link(), gid).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry.max_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        "shard {}: COMMIT PREPARED '{}' on {} failed (attempt {}/{}): {}",
                        conn.shard_id(),
                        gid,
                        conn.endpoint(),
                        attempt,
                        retry.max_attempts + 1,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Roll back every connection and close all of them. Errors are logged
    /// and never stop the sweep.
    pub async fn abort_all(&mut self, registry: &mut ConnectionRegistry) {
        self.phase = OperationPhase::Aborting;
        let txn_manager = self.txn_manager.clone();
        let mut rolled_back = 0usize;

        for set in registry.sets_mut() {
            let gid = self.gid(set.shard_id());
            for conn in set.connections_mut() {
                match conn.state() {
                    ReplicaState::Closed => continue,
                    ReplicaState::Prepared => {
                        if let Err(e) = txn_manager.rollback_prepared(conn.link(), &gid).await {
                            tracing::error!(
                                "shard {}: ROLLBACK PREPARED '{}' failed on {}: {}; \
                                 the prepared transaction must be resolved manually",
                                conn.shard_id(),
                                gid,
                                conn.endpoint(),
                                e
                            );
                        }
                    }
                    _ => self.rollback_unprepared(txn_manager.as_ref(), conn).await,
                }
                conn.close().await;
                rolled_back += 1;
            }
            set.release_lease();
        }

        tracing::info!(
            "aborted copy into '{}': rolled back {} replica connection(s){}",
            self.table,
            rolled_back,
            self.failed_shard
                .map(|s| format!(" after shard {} failed", s))
                .unwrap_or_default()
        );
        self.phase = OperationPhase::Closed;
    }

    async fn rollback_unprepared(
        &self,
        txn_manager: &dyn TransactionManager,
        conn: &mut ReplicaConnection,
    ) {
        if let Err(e) = conn.cancel_stream(&self.settings.abort_message).await {
            tracing::debug!(
                "shard {}: cancelling copy on {}: {}",
                conn.shard_id(),
                conn.endpoint(),
                e
            );
        }
        if let Err(e) = txn_manager.rollback(conn.link()).await {
            tracing::warn!(
                "shard {}: ROLLBACK on {} failed: {}",
                conn.shard_id(),
                conn.endpoint(),
                e
            );
        }
    }
}
