//! Commit-protocol strategies driven over a single replica link.
//!
//! The coordinator picks one strategy per operation and never talks
//! transaction control to a replica except through it.

use std::fmt;
use std::sync::Arc;

use shardcopy_common::config::TxnManagerKind;
use shardcopy_common::error::CopyResult;
use shardcopy_common::types::{OperationId, ShardId};

use crate::connection::ReplicaLink;
use crate::statement::quote_literal;

/// PostgreSQL rejects prepared-transaction names of 200 bytes or more.
pub const MAX_GID_LEN: usize = 199;

/// Name of the prepared transaction on every replica of one shard.
///
/// `<prefix>_<table>_<shard>_<operation>`; unique per (table, shard,
/// operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalTxnId(String);

impl GlobalTxnId {
    pub fn new(prefix: &str, table: &str, shard_id: ShardId, operation: OperationId) -> Self {
        let suffix = format!("_{}_{}", shard_id, operation);
        let head: String = prefix
            .chars()
            .chain(std::iter::once('_'))
            .chain(table.chars())
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        // Every char is ASCII at this point, so byte truncation is safe.
        let budget = MAX_GID_LEN.saturating_sub(suffix.len());
        let mut gid = head;
        gid.truncate(budget);
        gid.push_str(&suffix);
        GlobalTxnId(gid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction control over one replica link.
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a successful `prepare` makes the commit durable-on-demand.
    fn is_atomic(&self) -> bool;

    async fn begin(&self, link: &mut dyn ReplicaLink) -> CopyResult<()>;

    async fn prepare(&self, link: &mut dyn ReplicaLink, gid: &GlobalTxnId) -> CopyResult<()>;

    async fn commit_prepared(&self, link: &mut dyn ReplicaLink, gid: &GlobalTxnId)
        -> CopyResult<()>;

    async fn rollback(&self, link: &mut dyn ReplicaLink) -> CopyResult<()>;

    async fn rollback_prepared(
        &self,
        link: &mut dyn ReplicaLink,
        gid: &GlobalTxnId,
    ) -> CopyResult<()>;
}

/// PREPARE TRANSACTION / COMMIT PREPARED.
#[derive(Debug, Default)]
pub struct TwoPhaseManager;

#[async_trait::async_trait]
impl TransactionManager for TwoPhaseManager {
    fn name(&self) -> &'static str {
        "two_phase"
    }

    fn is_atomic(&self) -> bool {
        true
    }

    async fn begin(&self, link: &mut dyn ReplicaLink) -> CopyResult<()> {
        link.execute("BEGIN").await
    }

    async fn prepare(&self, link: &mut dyn ReplicaLink, gid: &GlobalTxnId) -> CopyResult<()> {
        link.execute(&format!("PREPARE TRANSACTION {}", quote_literal(gid.as_str())))
            .await
    }

    async fn commit_prepared(
        &self,
        link: &mut dyn ReplicaLink,
        gid: &GlobalTxnId,
    ) -> CopyResult<()> {
        link.execute(&format!("COMMIT PREPARED {}", quote_literal(gid.as_str())))
            .await
    }

    async fn rollback(&self, link: &mut dyn ReplicaLink) -> CopyResult<()> {
        link.execute("ROLLBACK").await
    }

    async fn rollback_prepared(
        &self,
        link: &mut dyn ReplicaLink,
        gid: &GlobalTxnId,
    ) -> CopyResult<()> {
        link.execute(&format!("ROLLBACK PREPARED {}", quote_literal(gid.as_str())))
            .await
    }
}

/// Plain COMMIT per replica for clusters without prepared transactions.
///
/// Prepare is a local vote only: the transaction stays open on the replica
/// until the commit phase. A failure during the commit phase leaves the
/// replicas that already committed in place.
#[derive(Debug, Default)]
pub struct OnePhaseManager;

#[async_trait::async_trait]
impl TransactionManager for OnePhaseManager {
    fn name(&self) -> &'static str {
        "one_phase"
    }

    fn is_atomic(&self) -> bool {
        false
    }

    async fn begin(&self, link: &mut dyn ReplicaLink) -> CopyResult<()> {
        link.execute("BEGIN").await
    }

    async fn prepare(&self, _link: &mut dyn ReplicaLink, _gid: &GlobalTxnId) -> CopyResult<()> {
        Ok(())
    }

    async fn commit_prepared(
        &self,
        link: &mut dyn ReplicaLink,
        _gid: &GlobalTxnId,
    ) -> CopyResult<()> {
        link.execute("COMMIT").await
    }

    async fn rollback(&self, link: &mut dyn ReplicaLink) -> CopyResult<()> {
        link.execute("ROLLBACK").await
    }

    async fn rollback_prepared(
        &self,
        link: &mut dyn ReplicaLink,
        _gid: &GlobalTxnId,
    ) -> CopyResult<()> {
        link.execute("ROLLBACK").await
    }
}

/// Instantiate the configured strategy.
pub fn build(kind: TxnManagerKind) -> Arc<dyn TransactionManager> {
    match kind {
        TxnManagerKind::TwoPhase => Arc::new(TwoPhaseManager),
        TxnManagerKind::OnePhase => Arc::new(OnePhaseManager),
    }
}
