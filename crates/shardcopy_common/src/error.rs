use thiserror::Error;

use crate::types::{NodeEndpoint, ShardId};

/// Convenience alias for `Result<T, CopyError>`.
pub type CopyResult<T> = Result<T, CopyError>;

/// Error classification for reporting and exit-code decisions.
///
/// - `UserError`  : bad request or bad input data (4xx equivalent)
/// - `Participant`: a shard replica refused or dropped out of the protocol
/// - `Transient`  : the replica set could not be reached; retrying the whole
///                   operation later may succeed
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Participant,
    Transient,
    InternalBug,
}

/// Every failure a distributed COPY can surface.
///
/// Participant errors always carry the shard id and, where a single replica
/// is at fault, its endpoint.
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("could not find any shards for table \"{table}\"")]
    NoShardsForTable { table: String },

    #[error("unknown distributed table \"{0}\"")]
    UnknownTable(String),

    #[error("cannot copy row with NULL value in partition column \"{column}\" (row {row})")]
    NullPartitionKey { column: String, row: u64 },

    #[error("failed to connect to node {endpoint} for shard {shard_id}: {reason}")]
    ConnectionFailure {
        shard_id: ShardId,
        endpoint: NodeEndpoint,
        reason: String,
    },

    #[error("failed to start copy on node {endpoint} for shard {shard_id}: {reason}")]
    BeginCopyFailure {
        shard_id: ShardId,
        endpoint: NodeEndpoint,
        reason: String,
    },

    #[error("failed to stream row to node {endpoint} for shard {shard_id}: {reason}")]
    StreamFailure {
        shard_id: ShardId,
        endpoint: NodeEndpoint,
        reason: String,
    },

    #[error("COPY failed for shard {shard_id}: node {endpoint} refused prepare: {reason}")]
    PrepareFailure {
        shard_id: ShardId,
        endpoint: NodeEndpoint,
        reason: String,
    },

    #[error("commit of prepared transaction '{gid}' failed for shard {shard_id} on node {endpoint}: {reason}")]
    CommitFailure {
        shard_id: ShardId,
        endpoint: NodeEndpoint,
        gid: String,
        reason: String,
    },

    #[error("COPY failed for shard {shard_id}")]
    OperationFailed { shard_id: ShardId },

    #[error("shard {shard_id} placement metadata is locked by {holders} in-flight operation(s)")]
    ShardMetadataLocked { shard_id: ShardId, holders: usize },

    #[error("invalid COPY request: {0}")]
    InvalidRequest(String),

    #[error("input error at line {line}: {reason}")]
    Source { line: u64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by a replica link outside of a shard-qualified context.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CopyError {
    /// Classify this error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CopyError::NoShardsForTable { .. }
            | CopyError::UnknownTable(_)
            | CopyError::NullPartitionKey { .. }
            | CopyError::InvalidRequest(_)
            | CopyError::Source { .. }
            | CopyError::Config(_) => ErrorKind::UserError,

            CopyError::PrepareFailure { .. }
            | CopyError::CommitFailure { .. }
            | CopyError::StreamFailure { .. }
            | CopyError::OperationFailed { .. }
            | CopyError::Remote(_) => ErrorKind::Participant,

            CopyError::ConnectionFailure { .. }
            | CopyError::BeginCopyFailure { .. }
            | CopyError::ShardMetadataLocked { .. } => ErrorKind::Transient,

            CopyError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Shard the error is attributed to, if any.
    pub fn shard_id(&self) -> Option<ShardId> {
        match self {
            CopyError::ConnectionFailure { shard_id, .. }
            | CopyError::BeginCopyFailure { shard_id, .. }
            | CopyError::StreamFailure { shard_id, .. }
            | CopyError::PrepareFailure { shard_id, .. }
            | CopyError::CommitFailure { shard_id, .. }
            | CopyError::OperationFailed { shard_id }
            | CopyError::ShardMetadataLocked { shard_id, .. } => Some(*shard_id),
            _ => None,
        }
    }

    /// Replica endpoint the error is attributed to, if any.
    pub fn endpoint(&self) -> Option<&NodeEndpoint> {
        match self {
            CopyError::ConnectionFailure { endpoint, .. }
            | CopyError::BeginCopyFailure { endpoint, .. }
            | CopyError::StreamFailure { endpoint, .. }
            | CopyError::PrepareFailure { endpoint, .. }
            | CopyError::CommitFailure { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Map to a PostgreSQL SQLSTATE code.
    pub fn pg_sqlstate(&self) -> &'static str {
        match self {
            CopyError::NoShardsForTable { .. } => "55000", // object_not_in_prerequisite_state
            CopyError::UnknownTable(_) => "42P01",         // undefined_table
            CopyError::NullPartitionKey { .. } => "22004", // null_value_not_allowed
            CopyError::InvalidRequest(_) => "0A000",       // feature_not_supported
            CopyError::Source { .. } => "22P04",           // bad_copy_file_format
            CopyError::ConnectionFailure { .. } => "08006", // connection_failure
            CopyError::BeginCopyFailure { .. } => "08006",
            CopyError::StreamFailure { .. } => "08006",
            CopyError::ShardMetadataLocked { .. } => "55P03", // lock_not_available
            CopyError::PrepareFailure { .. } => "40000",      // transaction_rollback
            CopyError::OperationFailed { .. } => "40000",
            CopyError::CommitFailure { .. } => "XX000",
            CopyError::Config(_) => "F0000", // config_file_error
            CopyError::Remote(_) => "XX000",
            CopyError::Internal(_) => "XX000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep() -> NodeEndpoint {
        NodeEndpoint::new("node-b", 5433)
    }

    #[test]
    fn test_prepare_failure_names_shard_and_node() {
        let e = CopyError::PrepareFailure {
            shard_id: ShardId(5),
            endpoint: ep(),
            reason: "max_prepared_transactions is zero".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("shard 5"), "{msg}");
        assert!(msg.contains("node-b:5433"), "{msg}");
        assert_eq!(e.shard_id(), Some(ShardId(5)));
        assert_eq!(e.endpoint(), Some(&ep()));
        assert_eq!(e.kind(), ErrorKind::Participant);
    }

    #[test]
    fn test_null_partition_key_is_user_error() {
        let e = CopyError::NullPartitionKey {
            column: "id".into(),
            row: 3,
        };
        assert!(e.is_user_error());
        assert_eq!(e.shard_id(), None);
        assert_eq!(e.pg_sqlstate(), "22004");
    }

    #[test]
    fn test_connection_failure_is_transient() {
        let e = CopyError::ConnectionFailure {
            shard_id: ShardId(2),
            endpoint: ep(),
            reason: "connection refused".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert_eq!(e.pg_sqlstate(), "08006");
    }
}
