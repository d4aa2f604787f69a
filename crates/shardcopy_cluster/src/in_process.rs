//! In-process replica cluster for tests and dry runs.
//!
//! Each endpoint behaves like a PostgreSQL node that understands the handful
//! of commands the coordinator sends: BEGIN, COPY FROM STDIN, PREPARE
//! TRANSACTION, COMMIT / ROLLBACK PREPARED, COMMIT and ROLLBACK. Every command
//! is appended to a cluster-wide log so tests can assert on ordering across
//! replicas. Faults can be injected per endpoint and per protocol step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::NodeEndpoint;

use crate::connection::{ReplicaConnector, ReplicaLink};

/// Protocol step at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Connect,
    BeginCopy,
    CopyData,
    CopyEnd,
    Prepare,
    /// COMMIT PREPARED, or plain COMMIT for one-phase operations.
    Commit,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    /// Successful hits before the fault fires.
    skip: u64,
    /// How many times it fires; `None` = forever.
    times: Option<u32>,
}

/// One command observed by a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    Connected,
    Begin,
    CopyStatement(String),
    Data(Vec<u8>),
    CopyEnd,
    CopyAbort(String),
    Prepare(String),
    CommitPrepared(String),
    RollbackPrepared(String),
    Commit,
    Rollback,
    Closed,
}

/// Log entry: which endpoint and session saw which command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub endpoint: NodeEndpoint,
    pub session: u64,
    pub event: ReplicaEvent,
}

type Rows = Vec<Vec<u8>>;

#[derive(Debug, Default)]
struct NodeState {
    /// gid → (relation, rows)
    prepared: HashMap<String, (String, Rows)>,
    /// relation → durably committed rows
    committed: BTreeMap<String, Rows>,
}

#[derive(Default)]
struct ClusterState {
    nodes: HashMap<NodeEndpoint, NodeState>,
    faults: HashMap<(NodeEndpoint, FaultPoint), Fault>,
    hits: HashMap<(NodeEndpoint, FaultPoint), u64>,
    log: Vec<LogEntry>,
}

impl ClusterState {
    /// Count a hit on `point` and report whether an injected fault fires.
    fn trip(&mut self, endpoint: &NodeEndpoint, point: FaultPoint) -> bool {
        let key = (endpoint.clone(), point);
        let hits = self.hits.entry(key.clone()).or_insert(0);
        *hits += 1;
        let hit = *hits;
        match self.faults.get_mut(&key) {
            Some(fault) if hit > fault.skip => match fault.times.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            },
            _ => false,
        }
    }

    fn record(&mut self, endpoint: &NodeEndpoint, session: u64, event: ReplicaEvent) {
        self.log.push(LogEntry {
            endpoint: endpoint.clone(),
            session,
            event,
        });
    }
}

/// Shared in-memory cluster; cloning shares the same state.
#[derive(Clone, Default)]
pub struct InProcessCluster {
    state: Arc<Mutex<ClusterState>>,
    sessions: Arc<AtomicU64>,
}

impl InProcessCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `point` on `endpoint`.
    pub fn inject(&self, endpoint: &NodeEndpoint, point: FaultPoint) {
        self.inject_fault(endpoint, point, 0, None);
    }

    /// Fail `point` on `endpoint` once `skip` hits have succeeded.
    pub fn inject_after(&self, endpoint: &NodeEndpoint, point: FaultPoint, skip: u64) {
        self.inject_fault(endpoint, point, skip, None);
    }

    /// Fail the next `times` hits of `point` on `endpoint`, then recover.
    pub fn inject_times(&self, endpoint: &NodeEndpoint, point: FaultPoint, times: u32) {
        self.inject_fault(endpoint, point, 0, Some(times));
    }

    fn inject_fault(&self, endpoint: &NodeEndpoint, point: FaultPoint, skip: u64, times: Option<u32>) {
        let mut state = self.state.lock();
        let key = (endpoint.clone(), point);
        let already = state.hits.get(&key).copied().unwrap_or(0);
        state.faults.insert(
            key,
            Fault {
                skip: already + skip,
                times,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Every command seen by every replica, in arrival order.
    pub fn log(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    pub fn events(&self, endpoint: &NodeEndpoint) -> Vec<ReplicaEvent> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| &e.endpoint == endpoint)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Commands seen by the sessions on `endpoint` that copied into
    /// `relation`.
    pub fn session_events(&self, endpoint: &NodeEndpoint, relation: &str) -> Vec<ReplicaEvent> {
        let state = self.state.lock();
        let sessions: Vec<u64> = state
            .log
            .iter()
            .filter(|e| &e.endpoint == endpoint)
            .filter(|e| match &e.event {
                ReplicaEvent::CopyStatement(stmt) => copy_relation(stmt) == relation,
                _ => false,
            })
            .map(|e| e.session)
            .collect();
        state
            .log
            .iter()
            .filter(|e| &e.endpoint == endpoint && sessions.contains(&e.session))
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn committed_rows(&self, endpoint: &NodeEndpoint, relation: &str) -> Rows {
        self.state
            .lock()
            .nodes
            .get(endpoint)
            .and_then(|n| n.committed.get(relation).cloned())
            .unwrap_or_default()
    }

    pub fn committed_row_count(&self, endpoint: &NodeEndpoint) -> usize {
        self.state
            .lock()
            .nodes
            .get(endpoint)
            .map(|n| n.committed.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Total committed rows across the whole cluster.
    pub fn total_committed_rows(&self) -> usize {
        self.state
            .lock()
            .nodes
            .values()
            .flat_map(|n| n.committed.values())
            .map(Vec::len)
            .sum()
    }

    pub fn prepared_gids(&self, endpoint: &NodeEndpoint) -> Vec<String> {
        let state = self.state.lock();
        let mut gids: Vec<String> = state
            .nodes
            .get(endpoint)
            .map(|n| n.prepared.keys().cloned().collect())
            .unwrap_or_default();
        gids.sort();
        gids
    }

    pub fn connections_opened(&self) -> usize {
        self.count(|e| matches!(e, ReplicaEvent::Connected))
    }

    pub fn connections_closed(&self) -> usize {
        self.count(|e| matches!(e, ReplicaEvent::Closed))
    }

    fn count(&self, pred: impl Fn(&ReplicaEvent) -> bool) -> usize {
        self.state.lock().log.iter().filter(|e| pred(&e.event)).count()
    }
}

#[async_trait::async_trait]
impl ReplicaConnector for InProcessCluster {
    async fn connect(&self, endpoint: &NodeEndpoint) -> CopyResult<Box<dyn ReplicaLink>> {
        let mut state = self.state.lock();
        if state.trip(endpoint, FaultPoint::Connect) {
            return Err(CopyError::Remote(format!(
                "could not connect to server {}: Connection refused",
                endpoint
            )));
        }
        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        state.nodes.entry(endpoint.clone()).or_default();
        state.record(endpoint, session, ReplicaEvent::Connected);
        Ok(Box::new(InProcessLink {
            state: self.state.clone(),
            endpoint: endpoint.clone(),
            session,
            in_txn: false,
            copying: false,
            relation: None,
            staged: Vec::new(),
            copied: 0,
            closed: false,
        }))
    }
}

/// One session on an in-process replica.
struct InProcessLink {
    state: Arc<Mutex<ClusterState>>,
    endpoint: NodeEndpoint,
    session: u64,
    in_txn: bool,
    copying: bool,
    relation: Option<String>,
    staged: Rows,
    copied: u64,
    closed: bool,
}

impl InProcessLink {
    fn check_open(&self) -> CopyResult<()> {
        if self.closed {
            return Err(CopyError::Remote("connection is closed".into()));
        }
        Ok(())
    }

    fn discard_txn(&mut self) {
        self.in_txn = false;
        self.copying = false;
        self.staged.clear();
    }
}

/// Relation named by `COPY <relation> ...`.
fn copy_relation(statement: &str) -> &str {
    statement.split_whitespace().nth(1).unwrap_or("")
}

/// Parse the quoted gid argument of a prepared-transaction command.
fn quoted_arg(command: &str, prefix: &str) -> Option<String> {
    let rest = command.strip_prefix(prefix)?.trim();
    let inner = rest.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

#[async_trait::async_trait]
impl ReplicaLink for InProcessLink {
    async fn execute(&mut self, command: &str) -> CopyResult<()> {
        self.check_open()?;
        let shared = self.state.clone();
        let mut state = shared.lock();
        let endpoint = self.endpoint.clone();

        if command == "BEGIN" {
            state.record(&endpoint, self.session, ReplicaEvent::Begin);
            self.in_txn = true;
            return Ok(());
        }
        if command == "ROLLBACK" {
            state.record(&endpoint, self.session, ReplicaEvent::Rollback);
            self.discard_txn();
            return Ok(());
        }
        if command == "COMMIT" {
            state.record(&endpoint, self.session, ReplicaEvent::Commit);
            if state.trip(&endpoint, FaultPoint::Commit) {
                self.discard_txn();
                return Err(CopyError::Remote("could not commit: node failure".into()));
            }
            let relation = self.relation.clone().unwrap_or_default();
            let rows = std::mem::take(&mut self.staged);
            if let Some(node) = state.nodes.get_mut(&endpoint) {
                node.committed.entry(relation).or_default().extend(rows);
            }
            self.discard_txn();
            return Ok(());
        }
        if let Some(gid) = quoted_arg(command, "PREPARE TRANSACTION") {
            state.record(&endpoint, self.session, ReplicaEvent::Prepare(gid.clone()));
            if self.copying {
                return Err(CopyError::Remote("PREPARE issued while in COPY mode".into()));
            }
            if state.trip(&endpoint, FaultPoint::Prepare) {
                // A failed PREPARE ends the transaction.
                self.discard_txn();
                return Err(CopyError::Remote(
                    "prepared transactions are disabled".into(),
                ));
            }
            let relation = self.relation.clone().unwrap_or_default();
            let rows = std::mem::take(&mut self.staged);
            let node = state.nodes.entry(endpoint.clone()).or_default();
            if node.prepared.contains_key(&gid) {
                self.discard_txn();
                return Err(CopyError::Remote(format!(
                    "transaction identifier \"{}\" is already in use",
                    gid
                )));
            }
            node.prepared.insert(gid, (relation, rows));
            self.discard_txn();
            return Ok(());
        }
        if let Some(gid) = quoted_arg(command, "COMMIT PREPARED") {
            state.record(&endpoint, self.session, ReplicaEvent::CommitPrepared(gid.clone()));
            if state.trip(&endpoint, FaultPoint::Commit) {
                return Err(CopyError::Remote("could not commit prepared: node failure".into()));
            }
            let node = state.nodes.entry(endpoint.clone()).or_default();
            let (relation, rows) = node.prepared.remove(&gid).ok_or_else(|| {
                CopyError::Remote(format!("prepared transaction \"{}\" does not exist", gid))
            })?;
            node.committed.entry(relation).or_default().extend(rows);
            return Ok(());
        }
        if let Some(gid) = quoted_arg(command, "ROLLBACK PREPARED") {
            state.record(&endpoint, self.session, ReplicaEvent::RollbackPrepared(gid.clone()));
            let node = state.nodes.entry(endpoint.clone()).or_default();
            node.prepared.remove(&gid).ok_or_else(|| {
                CopyError::Remote(format!("prepared transaction \"{}\" does not exist", gid))
            })?;
            return Ok(());
        }
        Err(CopyError::Remote(format!(
            "unsupported command on in-process replica: {}",
            command
        )))
    }

    async fn begin_copy(&mut self, statement: &str) -> CopyResult<()> {
        self.check_open()?;
        let shared = self.state.clone();
        let mut state = shared.lock();
        state.record(
            &self.endpoint,
            self.session,
            ReplicaEvent::CopyStatement(statement.to_string()),
        );
        if state.trip(&self.endpoint, FaultPoint::BeginCopy) {
            return Err(CopyError::Remote(format!(
                "relation \"{}\" does not exist",
                copy_relation(statement)
            )));
        }
        if !self.in_txn {
            return Err(CopyError::Remote("COPY outside of a transaction".into()));
        }
        self.relation = Some(copy_relation(statement).to_string());
        self.copying = true;
        self.copied = 0;
        Ok(())
    }

    async fn put_copy_data(&mut self, record: &[u8]) -> CopyResult<()> {
        self.check_open()?;
        let shared = self.state.clone();
        let mut state = shared.lock();
        if !self.copying {
            return Err(CopyError::Remote("no COPY in progress".into()));
        }
        if state.trip(&self.endpoint, FaultPoint::CopyData) {
            return Err(CopyError::Remote("server closed the connection unexpectedly".into()));
        }
        state.record(&self.endpoint, self.session, ReplicaEvent::Data(record.to_vec()));
        let row = record.strip_suffix(b"\n").unwrap_or(record).to_vec();
        self.staged.push(row);
        self.copied += 1;
        Ok(())
    }

    async fn put_copy_end(&mut self, abort_reason: Option<&str>) -> CopyResult<u64> {
        self.check_open()?;
        let shared = self.state.clone();
        let mut state = shared.lock();
        if !self.copying {
            return Err(CopyError::Remote("no COPY in progress".into()));
        }
        self.copying = false;
        if let Some(reason) = abort_reason {
            state.record(
                &self.endpoint,
                self.session,
                ReplicaEvent::CopyAbort(reason.to_string()),
            );
            self.staged.clear();
            return Ok(0);
        }
        state.record(&self.endpoint, self.session, ReplicaEvent::CopyEnd);
        if state.trip(&self.endpoint, FaultPoint::CopyEnd) {
            self.discard_txn();
            return Err(CopyError::Remote("could not complete COPY: disk full".into()));
        }
        Ok(self.copied)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.discard_txn();
        self.state
            .lock()
            .record(&self.endpoint, self.session, ReplicaEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep() -> NodeEndpoint {
        NodeEndpoint::new("n1", 5432)
    }

    #[tokio::test]
    async fn test_prepare_then_commit_makes_rows_durable() {
        let cluster = InProcessCluster::new();
        let mut link = cluster.connect(&ep()).await.unwrap();
        link.execute("BEGIN").await.unwrap();
        link.begin_copy("COPY t_1 FROM STDIN").await.unwrap();
        link.put_copy_data(b"a\n").await.unwrap();
        link.put_copy_data(b"b\n").await.unwrap();
        assert_eq!(link.put_copy_end(None).await.unwrap(), 2);
        link.execute("PREPARE TRANSACTION 'g1'").await.unwrap();
        assert_eq!(cluster.prepared_gids(&ep()), vec!["g1".to_string()]);
        assert!(cluster.committed_rows(&ep(), "t_1").is_empty());

        link.execute("COMMIT PREPARED 'g1'").await.unwrap();
        link.close().await;
        assert_eq!(
            cluster.committed_rows(&ep(), "t_1"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert!(cluster.prepared_gids(&ep()).is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_unprepared_rows() {
        let cluster = InProcessCluster::new();
        let mut link = cluster.connect(&ep()).await.unwrap();
        link.execute("BEGIN").await.unwrap();
        link.begin_copy("COPY t_1 FROM STDIN").await.unwrap();
        link.put_copy_data(b"a\n").await.unwrap();
        link.close().await;
        link.close().await;
        assert_eq!(cluster.total_committed_rows(), 0);
        assert_eq!(cluster.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_fault_after_skip_and_times() {
        let cluster = InProcessCluster::new();
        cluster.inject_after(&ep(), FaultPoint::CopyData, 1);
        let mut link = cluster.connect(&ep()).await.unwrap();
        link.execute("BEGIN").await.unwrap();
        link.begin_copy("COPY t_1 FROM STDIN").await.unwrap();
        link.put_copy_data(b"a\n").await.unwrap();
        assert!(link.put_copy_data(b"b\n").await.is_err());

        cluster.clear_faults();
        cluster.inject_times(&ep(), FaultPoint::Connect, 1);
        assert!(cluster.connect(&ep()).await.is_err());
        assert!(cluster.connect(&ep()).await.is_ok());
    }

    #[test]
    fn test_quoted_arg() {
        assert_eq!(
            quoted_arg("COMMIT PREPARED 'a''b'", "COMMIT PREPARED"),
            Some("a'b".to_string())
        );
        assert_eq!(quoted_arg("COMMIT", "COMMIT PREPARED"), None);
    }
}
