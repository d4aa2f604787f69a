//! Observability setup: structured logging and Prometheus metrics for the
//! COPY coordinator.

use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Logs go to stderr so that a
/// copy's output stream stays clean.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardcopy=debug"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record the terminal outcome of one COPY operation.
/// `outcome` is one of: "committed", "aborted".
pub fn record_copy_outcome(table: &str, outcome: &str) {
    metrics::counter!(
        "shardcopy_operations_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_rows_streamed(table: &str, rows: u64) {
    metrics::counter!("shardcopy_rows_streamed_total", "table" => table.to_string())
        .increment(rows);
}

pub fn record_replica_connection_opened() {
    metrics::counter!("shardcopy_replica_connections_total").increment(1);
}

pub fn record_replica_failure(phase: &str) {
    metrics::counter!("shardcopy_replica_failures_total", "phase" => phase.to_string())
        .increment(1);
}

pub fn record_prepare_duration(elapsed: Duration) {
    metrics::histogram!("shardcopy_prepare_duration_us").record(elapsed.as_micros() as f64);
}

pub fn record_commit_duration(elapsed: Duration) {
    metrics::histogram!("shardcopy_commit_duration_us").record(elapsed.as_micros() as f64);
}

/// A COMMIT PREPARED that never succeeded: the gid needs manual resolution.
pub fn record_commit_failure() {
    metrics::counter!("shardcopy_commit_failures_total").increment(1);
}

pub fn record_shards_touched(count: usize) {
    metrics::histogram!("shardcopy_shards_per_operation").record(count as f64);
}
