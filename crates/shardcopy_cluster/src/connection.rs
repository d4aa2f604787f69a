//! Replica connection layer.
//!
//! [`ReplicaConnector`] and [`ReplicaLink`] are the network seam: the
//! PostgreSQL crate implements them over the wire, `in_process` implements
//! them in memory for tests. Everything above this module talks to replicas
//! only through [`ReplicaConnection`], which tracks where each connection is
//! in the copy and commit protocol.

use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{NodeEndpoint, ShardId};

use crate::routing::ShardLease;

/// Opens links to shard replicas.
#[async_trait::async_trait]
pub trait ReplicaConnector: Send + Sync {
    async fn connect(&self, endpoint: &NodeEndpoint) -> CopyResult<Box<dyn ReplicaLink>>;
}

/// One open session on a replica.
#[async_trait::async_trait]
pub trait ReplicaLink: Send {
    /// Run a command that returns no rows (`BEGIN`, `PREPARE TRANSACTION`, ...).
    async fn execute(&mut self, command: &str) -> CopyResult<()>;

    /// Issue a `COPY ... FROM STDIN` statement and enter copy-in mode.
    async fn begin_copy(&mut self, statement: &str) -> CopyResult<()>;

    /// Send one record, terminator included.
    async fn put_copy_data(&mut self, record: &[u8]) -> CopyResult<()>;

    /// End copy-in mode. `Some(reason)` cancels the copy instead of
    /// completing it. Returns the number of rows the replica accepted.
    async fn put_copy_end(&mut self, abort_reason: Option<&str>) -> CopyResult<u64>;

    /// Terminate the session. Never fails.
    async fn close(&mut self);
}

/// Protocol position of a single replica connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Session open, remote transaction begun.
    Connected,
    /// Copy-in mode; rows may be sent.
    Streaming,
    /// Copy completed; transaction still open.
    StreamEnded,
    /// Transaction prepared under the operation's gid.
    Prepared,
    Closed,
}

/// A link to one replica of one shard, owned by the registry for the
/// duration of an operation.
pub struct ReplicaConnection {
    shard_id: ShardId,
    endpoint: NodeEndpoint,
    state: ReplicaState,
    link: Box<dyn ReplicaLink>,
    rows_sent: u64,
}

impl std::fmt::Debug for ReplicaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaConnection")
            .field("shard_id", &self.shard_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("rows_sent", &self.rows_sent)
            .finish()
    }
}

impl ReplicaConnection {
    pub fn new(shard_id: ShardId, endpoint: NodeEndpoint, link: Box<dyn ReplicaLink>) -> Self {
        Self {
            shard_id,
            endpoint,
            state: ReplicaState::Connected,
            link,
            rows_sent: 0,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn is_prepared(&self) -> bool {
        self.state == ReplicaState::Prepared
    }

    pub fn is_closed(&self) -> bool {
        self.state == ReplicaState::Closed
    }

    pub fn rows_sent(&self) -> u64 {
        self.rows_sent
    }

    pub(crate) fn link(&mut self) -> &mut dyn ReplicaLink {
        self.link.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: ReplicaState) {
        self.state = state;
    }

    pub(crate) async fn begin_copy(&mut self, statement: &str) -> CopyResult<()> {
        self.link.begin_copy(statement).await?;
        self.state = ReplicaState::Streaming;
        Ok(())
    }

    /// Send one record. Only legal while streaming.
    pub(crate) async fn send(&mut self, record: &[u8]) -> CopyResult<()> {
        if self.state != ReplicaState::Streaming {
            return Err(CopyError::Internal(format!(
                "row sent to shard {} replica {} in state {:?}",
                self.shard_id, self.endpoint, self.state
            )));
        }
        self.link.put_copy_data(record).await?;
        self.rows_sent += 1;
        Ok(())
    }

    /// Complete the copy stream.
    pub(crate) async fn end_stream(&mut self) -> CopyResult<u64> {
        let rows = self.link.put_copy_end(None).await?;
        self.state = ReplicaState::StreamEnded;
        Ok(rows)
    }

    /// Cancel the copy stream if it is still open.
    pub(crate) async fn cancel_stream(&mut self, reason: &str) -> CopyResult<()> {
        if self.state == ReplicaState::Streaming {
            // The cancel always moves the link out of copy mode, even when
            // the replica reports it as an error.
            let result = self.link.put_copy_end(Some(reason)).await;
            self.state = ReplicaState::StreamEnded;
            result?;
        }
        Ok(())
    }

    /// Close the link. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.state != ReplicaState::Closed {
            self.link.close().await;
            self.state = ReplicaState::Closed;
        }
    }
}

/// Every replica connection of one touched shard, in placement order.
///
/// Holds the shard's placement lease until the set is dropped.
#[derive(Debug)]
pub struct ShardConnectionSet {
    shard_id: ShardId,
    connections: Vec<ReplicaConnection>,
    lease: Option<ShardLease>,
    rows_routed: u64,
}

impl ShardConnectionSet {
    pub fn new(shard_id: ShardId, lease: Option<ShardLease>) -> Self {
        Self {
            shard_id,
            connections: Vec::new(),
            lease,
            rows_routed: 0,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn connections(&self) -> &[ReplicaConnection] {
        &self.connections
    }

    pub(crate) fn connections_mut(&mut self) -> &mut [ReplicaConnection] {
        &mut self.connections
    }

    pub(crate) fn push(&mut self, conn: ReplicaConnection) {
        self.connections.push(conn);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn rows_routed(&self) -> u64 {
        self.rows_routed
    }

    pub(crate) fn record_row(&mut self) {
        self.rows_routed += 1;
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Drop the placement lease once every connection is closed.
    pub(crate) fn release_lease(&mut self) {
        if self.connections.iter().all(|c| c.is_closed()) {
            self.lease = None;
        }
    }
}
