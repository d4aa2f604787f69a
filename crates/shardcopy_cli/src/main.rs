mod args;
mod csv;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use shardcopy_cluster::connection::ReplicaConnector;
use shardcopy_cluster::routing::{ShardMap, ShardRouter};
use shardcopy_cluster::statement::{export_statement, CopyDirection};
use shardcopy_cluster::{CopySummary, DistributedCopy, InProcessCluster};
use shardcopy_common::config::ShardCopyConfig;
use shardcopy_common::types::DataType;
use shardcopy_pg::PgConnector;

use args::Cli;
use csv::DelimitedRowSource;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("shardcopy: error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml = toml::to_string_pretty(&ShardCopyConfig::default())
            .context("failed to serialize default config")?;
        println!("{}", toml);
        return Ok(());
    }

    shardcopy_observability::init_tracing();
    if let Some(addr) = &cli.metrics_addr {
        shardcopy_observability::init_metrics(addr)
            .map_err(|e| anyhow::anyhow!("failed to start metrics exporter on {}: {}", addr, e))?;
    }

    let config = ShardCopyConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    let opts = cli.row_options()?;
    let request = cli.copy_request(&opts)?;

    if cli.export {
        let statement = export_statement(&request.clone().with_direction(CopyDirection::To))?;
        println!("{}", statement);
        return Ok(());
    }

    let map = Arc::new(ShardMap::from_config(&config.tables)?);
    let table = map.table_metadata(&request.table)?;
    let column_types: Vec<DataType> = if request.columns.is_empty() {
        table.columns.iter().map(|c| c.data_type).collect()
    } else {
        request
            .columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| c.data_type)
                    .ok_or_else(|| anyhow::anyhow!("column \"{}\" of table \"{}\" does not exist", name, table.name))
            })
            .collect::<anyhow::Result<_>>()?
    };

    let reader: Box<dyn BufRead + Send> = match &cli.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut source = DelimitedRowSource::new(reader, column_types, opts);

    let connector: Arc<dyn ReplicaConnector> = if cli.dry_run {
        tracing::info!("dry run: streaming into an in-process cluster");
        Arc::new(InProcessCluster::new())
    } else {
        Arc::new(PgConnector::new(config.connection.clone()))
    };

    let copy = DistributedCopy::new(map, connector, config.copy.clone());
    let summary = copy
        .run(&request, &mut source)
        .await
        .with_context(|| {
            format!(
                "COPY into {} failed after {} input line(s)",
                request.table,
                source.lines_read()
            )
        })?;
    tracing::info!(
        "read {} input line(s) for operation {}",
        source.lines_read(),
        summary.operation_id
    );

    print_summary(&summary, cli.json);
    summary
        .ensure_committed()
        .context("COPY committed on some replicas only; see the log for prepared transactions to resolve")?;
    Ok(())
}

fn print_summary(summary: &CopySummary, json: bool) {
    if json {
        let value = serde_json::json!({
            "operation_id": summary.operation_id.to_string(),
            "table": summary.table,
            "rows_copied": summary.rows_copied,
            "rows_skipped": summary.rows_skipped,
            "shards": summary.shards.iter().map(|s| s.0).collect::<Vec<_>>(),
            "replicas_committed": summary.replicas_committed,
            "atomic_commit": summary.atomic_commit,
            "commit_failures": summary
                .commit_failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>(),
        });
        println!("{}", value);
        return;
    }
    println!("COPY {}", summary.rows_copied);
    if summary.rows_skipped > 0 {
        eprintln!(
            "shardcopy: {} row(s) skipped: no shard owns their partition key",
            summary.rows_skipped
        );
    }
}
