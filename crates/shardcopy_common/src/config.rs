use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CopyError, CopyResult};
use crate::types::DataType;

/// Top-level configuration, usually loaded from `shardcopy.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardCopyConfig {
    #[serde(default)]
    pub copy: CopySettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl ShardCopyConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> CopyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CopyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ShardCopyConfig = toml::from_str(&content).map_err(|e| {
            CopyError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> CopyResult<()> {
        let mut shard_owners: HashMap<u64, &str> = HashMap::new();
        for table in &self.tables {
            if !table.columns.iter().any(|c| c.name == table.partition_column) {
                return Err(CopyError::Config(format!(
                    "table '{}': partition column '{}' is not a declared column",
                    table.name, table.partition_column
                )));
            }
            for shard in &table.shards {
                // Shard ids name shard relations cluster-wide.
                match shard_owners.insert(shard.id, &table.name) {
                    Some(owner) if owner == table.name => {
                        return Err(CopyError::Config(format!(
                            "table '{}': duplicate shard id {}",
                            table.name, shard.id
                        )));
                    }
                    Some(owner) => {
                        return Err(CopyError::Config(format!(
                            "table '{}': shard id {} is already used by table '{}'",
                            table.name, shard.id, owner
                        )));
                    }
                    None => {}
                }
                if shard.min > shard.max {
                    return Err(CopyError::Config(format!(
                        "table '{}': shard {} has min {} > max {}",
                        table.name, shard.id, shard.min, shard.max
                    )));
                }
                if shard.replicas.is_empty() {
                    return Err(CopyError::Config(format!(
                        "table '{}': shard {} has no replicas",
                        table.name, shard.id
                    )));
                }
            }
        }
        if self.copy.gid_prefix.is_empty() {
            return Err(CopyError::Config("copy.gid_prefix must not be empty".into()));
        }
        Ok(())
    }
}

/// Which commit protocol is driven over each replica connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnManagerKind {
    /// PREPARE TRANSACTION / COMMIT PREPARED.
    #[default]
    TwoPhase,
    /// Plain COMMIT per replica; no atomicity across replicas.
    OnePhase,
}

/// Bounded retry of COMMIT PREPARED after a commit-phase failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitRetryConfig {
    /// Extra attempts after the first failure (0 = report immediately).
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds.
    pub backoff_ms: u64,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 50,
        }
    }
}

/// Coordinator behaviour for a single COPY operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopySettings {
    pub txn_manager: TxnManagerKind,
    /// Leading component of every prepared-transaction name.
    pub gid_prefix: String,
    /// Message sent when a replica's copy stream is cancelled.
    pub abort_message: String,
    pub commit_retry: CommitRetryConfig,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            txn_manager: TxnManagerKind::TwoPhase,
            gid_prefix: "shardcopy".into(),
            abort_message: "Aborted because of failure on some shard".into(),
            commit_retry: CommitRetryConfig::default(),
        }
    }
}

/// Credentials and options used for every replica connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub user: String,
    pub dbname: String,
    pub password: Option<String>,
    /// 0 = no timeout.
    pub connect_timeout_ms: u64,
    pub application_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            user: "postgres".into(),
            dbname: "postgres".into(),
            password: None,
            connect_timeout_ms: 10_000,
            application_name: "shardcopy".into(),
        }
    }
}

/// How partition-key values map onto shard ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMethod {
    /// xxh3 token of the key, compared against `[min, max]`.
    #[default]
    Hash,
    /// Integer key compared directly against `[min, max]`.
    Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: u64,
    pub min: i64,
    pub max: i64,
    /// `host:port` of every replica, in placement order.
    pub replicas: Vec<String>,
}

/// One distributed table and its shard placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnConfig>,
    pub partition_column: String,
    #[serde(default)]
    pub partition_method: PartitionMethod,
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[copy]
txn_manager = "two_phase"
gid_prefix = "bulk"

[copy.commit_retry]
max_attempts = 2

[connection]
user = "loader"
dbname = "app"

[[tables]]
name = "events"
partition_column = "id"
partition_method = "range"
columns = [
    { name = "id", type = "int64" },
    { name = "payload", type = "text" },
]

[[tables.shards]]
id = 1
min = 0
max = 99
replicas = ["10.0.0.1:5432", "10.0.0.2:5432"]
"#;

    #[test]
    fn test_load_sample_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ShardCopyConfig::load(file.path()).unwrap();
        assert_eq!(config.copy.gid_prefix, "bulk");
        assert_eq!(config.copy.commit_retry.max_attempts, 2);
        assert_eq!(config.copy.commit_retry.backoff_ms, 50);
        assert_eq!(config.connection.user, "loader");
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].partition_method, PartitionMethod::Range);
        assert_eq!(config.tables[0].columns[0].data_type, DataType::Int64);
        assert_eq!(config.tables[0].shards[0].replicas.len(), 2);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: ShardCopyConfig = toml::from_str("").unwrap();
        assert_eq!(config.copy.txn_manager, TxnManagerKind::TwoPhase);
        assert_eq!(config.copy.abort_message, "Aborted because of failure on some shard");
        assert!(config.tables.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_partition_column() {
        let mut config: ShardCopyConfig = toml::from_str(SAMPLE).unwrap();
        config.tables[0].partition_column = "missing".into();
        assert!(matches!(config.validate(), Err(CopyError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config: ShardCopyConfig = toml::from_str(SAMPLE).unwrap();
        config.tables[0].shards[0].min = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shard_id_reused_by_another_table() {
        let mut config: ShardCopyConfig = toml::from_str(SAMPLE).unwrap();
        let mut other = config.tables[0].clone();
        other.name = "clicks".into();
        other.shards[0].replicas = vec!["10.0.0.9:5432".into()];
        config.tables.push(other);
        match config.validate() {
            Err(CopyError::Config(msg)) => {
                assert!(msg.contains("already used by table 'events'"), "{}", msg)
            }
            other => panic!("expected config error, got {:?}", other),
        }

        config.tables[1].shards[0].id = 2;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_shard_in_table() {
        let mut config: ShardCopyConfig = toml::from_str(SAMPLE).unwrap();
        let dup = config.tables[0].shards[0].clone();
        config.tables[0].shards.push(dup);
        assert!(matches!(config.validate(), Err(CopyError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ShardCopyConfig::load("/nonexistent/shardcopy.toml").unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }
}
