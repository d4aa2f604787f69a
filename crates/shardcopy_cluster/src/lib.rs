//! Distributed bulk COPY into sharded, replicated tables.
//!
//! Rows are routed to the shards owning their partition key, streamed to
//! every replica of each owning shard, and committed atomically across all
//! touched replicas with two-phase commit.

pub mod connection;
pub mod copy;
pub mod in_process;
pub mod registry;
pub mod replication;
pub mod routing;
pub mod source;
pub mod statement;
pub mod two_phase;
pub mod txn_manager;

pub use connection::{ReplicaConnection, ReplicaConnector, ReplicaLink, ReplicaState, ShardConnectionSet};
pub use copy::{CopySummary, DistributedCopy, OperationGuard};
pub use in_process::{FaultPoint, InProcessCluster, ReplicaEvent};
pub use registry::ConnectionRegistry;
pub use replication::ReplicationCoordinator;
pub use routing::{
    ReplicaPlacement, ShardDescriptor, ShardLease, ShardMap, ShardRange, ShardRouter,
    TableMetadata,
};
pub use source::{RowSource, SourceRow, VecRowSource};
pub use statement::{export_statement, CopyDirection, CopyOption, CopyRequest, CopyStatementBuilder};
pub use two_phase::{OperationPhase, TransactionCoordinator};
pub use txn_manager::{GlobalTxnId, OnePhaseManager, TransactionManager, TwoPhaseManager};
