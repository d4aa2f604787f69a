use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::ShardId;

use crate::connection::{ReplicaConnection, ReplicaConnector, ShardConnectionSet};
use crate::routing::{ShardDescriptor, ShardRouter};
use crate::statement::CopyStatementBuilder;
use crate::txn_manager::TransactionManager;

/// Shard id → replica connections opened during one operation.
///
/// Sets are created lazily on the first row routed to a shard and are never
/// removed before the operation ends. Iteration is in ascending shard id.
pub struct ConnectionRegistry {
    sets: BTreeMap<ShardId, ShardConnectionSet>,
    connector: Arc<dyn ReplicaConnector>,
    txn_manager: Arc<dyn TransactionManager>,
    statements: CopyStatementBuilder,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn ReplicaConnector>,
        txn_manager: Arc<dyn TransactionManager>,
        statements: CopyStatementBuilder,
    ) -> Self {
        Self {
            sets: BTreeMap::new(),
            connector,
            txn_manager,
            statements,
        }
    }

    /// Return the shard's connection set, opening it on first use.
    ///
    /// A new set is registered before its first connection is attempted, so
    /// replicas that did connect are rolled back by the abort path when a
    /// later replica of the same shard fails.
    pub async fn get_or_create(
        &mut self,
        shard: &ShardDescriptor,
        router: &dyn ShardRouter,
    ) -> CopyResult<&mut ShardConnectionSet> {
        let Self {
            sets,
            connector,
            txn_manager,
            statements,
        } = self;

        let vacant = match sets.entry(shard.id) {
            Entry::Occupied(entry) => return Ok(entry.into_mut()),
            Entry::Vacant(entry) => entry,
        };

        let placement = router.replicas_for(shard)?;
        if placement.replicas.is_empty() {
            return Err(CopyError::InvalidRequest(format!(
                "shard {} of table '{}' has no replica placements",
                shard.id, shard.table
            )));
        }
        let replicas = placement.replicas;
        let set = vacant.insert(ShardConnectionSet::new(shard.id, Some(placement.lease)));
        let statement = statements.build(shard.id);

        tracing::debug!(
            "opening shard {} on {} replica(s): {}",
            shard.id,
            replicas.len(),
            statement
        );

        for endpoint in replicas {
            let link = match connector.connect(&endpoint).await {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!("shard {}: connect to {} failed: {}", shard.id, endpoint, e);
                    shardcopy_observability::record_replica_failure("connect");
                    return Err(CopyError::ConnectionFailure {
                        shard_id: shard.id,
                        endpoint,
                        reason: e.to_string(),
                    });
                }
            };
            shardcopy_observability::record_replica_connection_opened();
            set.push(ReplicaConnection::new(shard.id, endpoint, link));

            let conn = match set.connections_mut().last_mut() {
                Some(conn) => conn,
                None => {
                    return Err(CopyError::Internal(format!(
                        "shard {} connection vanished after registration",
                        shard.id
                    )))
                }
            };
            let started = match txn_manager.begin(conn.link()).await {
                Ok(()) => conn.begin_copy(&statement).await,
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                tracing::warn!(
                    "shard {}: starting copy on {} failed: {}",
                    shard.id,
                    conn.endpoint(),
                    e
                );
                shardcopy_observability::record_replica_failure("begin_copy");
                return Err(CopyError::BeginCopyFailure {
                    shard_id: shard.id,
                    endpoint: conn.endpoint().clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(set)
    }

    pub fn get(&self, shard_id: ShardId) -> Option<&ShardConnectionSet> {
        self.sets.get(&shard_id)
    }

    pub fn sets(&self) -> impl Iterator<Item = &ShardConnectionSet> {
        self.sets.values()
    }

    pub(crate) fn sets_mut(&mut self) -> impl Iterator<Item = &mut ShardConnectionSet> {
        self.sets.values_mut()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.sets.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.sets.values().map(|s| s.len()).sum()
    }

    pub fn open_connections(&self) -> impl Iterator<Item = &ReplicaConnection> {
        self.sets
            .values()
            .flat_map(|s| s.connections().iter())
            .filter(|c| !c.is_closed())
    }
}
