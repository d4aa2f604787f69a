//! PostgreSQL implementation of the replica connection layer.
//!
//! Each link is one tokio-postgres session whose connection driver runs on
//! its own task. Transaction control goes through the simple-query protocol;
//! row streaming goes through a `COPY ... FROM STDIN` sink.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, CopyInSink, NoTls};
use tracing::{debug, warn};

use shardcopy_cluster::connection::{ReplicaConnector, ReplicaLink};
use shardcopy_common::config::ConnectionSettings;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::NodeEndpoint;

/// How long `close` waits for the connection driver to wind down.
const DRIVER_SHUTDOWN: Duration = Duration::from_secs(5);

/// Render a driver error with the server's message when there is one.
fn remote(endpoint: &NodeEndpoint, e: tokio_postgres::Error) -> CopyError {
    match e.as_db_error() {
        Some(db) => CopyError::Remote(format!(
            "{}: {} (SQLSTATE {})",
            endpoint,
            db.message(),
            db.code().code()
        )),
        None => CopyError::Remote(format!("{}: {}", endpoint, e)),
    }
}

/// Connection parameters for one replica.
pub fn pg_config(settings: &ConnectionSettings, endpoint: &NodeEndpoint) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&endpoint.host)
        .port(endpoint.port)
        .user(&settings.user)
        .dbname(&settings.dbname)
        .application_name(&settings.application_name);
    if let Some(password) = &settings.password {
        config.password(password);
    }
    if settings.connect_timeout_ms > 0 {
        config.connect_timeout(Duration::from_millis(settings.connect_timeout_ms));
    }
    config
}

/// Opens tokio-postgres sessions to shard replicas.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    settings: ConnectionSettings,
}

impl PgConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl ReplicaConnector for PgConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> CopyResult<Box<dyn ReplicaLink>> {
        debug!(
            "Connecting: host={} port={} user={} dbname={}",
            endpoint.host, endpoint.port, self.settings.user, self.settings.dbname
        );
        let (client, connection) = pg_config(&self.settings, endpoint)
            .connect(NoTls)
            .await
            .map_err(|e| remote(endpoint, e))?;

        let driver_endpoint = endpoint.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Connection error on {}: {}", driver_endpoint, e);
            }
        });

        Ok(Box::new(PgReplicaLink {
            endpoint: endpoint.clone(),
            client: Some(client),
            sink: None,
            driver: Some(driver),
        }))
    }
}

/// One replica session.
pub struct PgReplicaLink {
    endpoint: NodeEndpoint,
    client: Option<Client>,
    sink: Option<Pin<Box<CopyInSink<Bytes>>>>,
    driver: Option<JoinHandle<()>>,
}

impl PgReplicaLink {
    fn client(&self) -> CopyResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CopyError::Remote(format!("{}: connection is closed", self.endpoint)))
    }

    fn sink(&mut self) -> CopyResult<Pin<&mut CopyInSink<Bytes>>> {
        match self.sink.as_mut() {
            Some(sink) => Ok(sink.as_mut()),
            None => Err(CopyError::Remote(format!(
                "{}: no COPY in progress",
                self.endpoint
            ))),
        }
    }
}

#[async_trait::async_trait]
impl ReplicaLink for PgReplicaLink {
    async fn execute(&mut self, command: &str) -> CopyResult<()> {
        if self.sink.is_some() {
            return Err(CopyError::Remote(format!(
                "{}: '{}' issued while a COPY is in progress",
                self.endpoint, command
            )));
        }
        let client = self.client()?;
        client
            .batch_execute(command)
            .await
            .map_err(|e| remote(&self.endpoint, e))
    }

    async fn begin_copy(&mut self, statement: &str) -> CopyResult<()> {
        let client = self.client()?;
        let sink = client
            .copy_in::<_, Bytes>(statement)
            .await
            .map_err(|e| remote(&self.endpoint, e))?;
        self.sink = Some(Box::pin(sink));
        Ok(())
    }

    async fn put_copy_data(&mut self, record: &[u8]) -> CopyResult<()> {
        let endpoint = self.endpoint.clone();
        self.sink()?
            .feed(Bytes::copy_from_slice(record))
            .await
            .map_err(|e| remote(&endpoint, e))
    }

    async fn put_copy_end(&mut self, abort_reason: Option<&str>) -> CopyResult<u64> {
        let Some(mut sink) = self.sink.take() else {
            return Err(CopyError::Remote(format!(
                "{}: no COPY in progress",
                self.endpoint
            )));
        };
        match abort_reason {
            None => sink
                .as_mut()
                .finish()
                .await
                .map_err(|e| remote(&self.endpoint, e)),
            Some(reason) => {
                // Dropping an unfinished sink makes the driver send CopyFail.
                debug!("Cancelling COPY on {}: {}", self.endpoint, reason);
                drop(sink);
                Ok(0)
            }
        }
    }

    async fn close(&mut self) {
        self.sink = None;
        self.client = None;
        if let Some(driver) = self.driver.take() {
            if tokio::time::timeout(DRIVER_SHUTDOWN, driver).await.is_err() {
                warn!("Connection to {} did not shut down cleanly", self.endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::Host;

    #[test]
    fn test_pg_config_from_settings() {
        let settings = ConnectionSettings {
            user: "loader".into(),
            dbname: "app".into(),
            password: Some("secret".into()),
            connect_timeout_ms: 1500,
            application_name: "shardcopy-test".into(),
        };
        let config = pg_config(&settings, &NodeEndpoint::new("worker-3", 6432));
        assert_eq!(config.get_user(), Some("loader"));
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_ports(), &[6432]);
        assert_eq!(config.get_application_name(), Some("shardcopy-test"));
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_millis(1500)));
        assert_eq!(config.get_password(), Some(&b"secret"[..]));
        match &config.get_hosts()[0] {
            Host::Tcp(host) => assert_eq!(host, "worker-3"),
            #[allow(unreachable_patterns)]
            other => panic!("unexpected host {:?}", other),
        }
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let settings = ConnectionSettings {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        let config = pg_config(&settings, &NodeEndpoint::new("h", 5432));
        assert_eq!(config.get_connect_timeout(), None);
        assert_eq!(config.get_password(), None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let settings = ConnectionSettings {
            connect_timeout_ms: 500,
            ..Default::default()
        };
        let connector = PgConnector::new(settings);
        // Port 1 on localhost is never a PostgreSQL server.
        let err = match connector.connect(&NodeEndpoint::new("127.0.0.1", 1)).await {
            Ok(_) => panic!("connect to 127.0.0.1:1 unexpectedly succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, CopyError::Remote(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
