use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::SchedulerError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: scheduler operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "carebook_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "carebook_operation_duration_seconds";

/// Counter: booking attempts that lost the race for a slot.
pub const OCCUPANCY_CONFLICTS_TOTAL: &str = "carebook_occupancy_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: specialists with state loaded in memory.
pub const SPECIALISTS_ACTIVE: &str = "carebook_specialists_active";

/// Counter: slots written by materialization.
pub const MATERIALIZED_SLOTS_TOTAL: &str = "carebook_materialized_slots_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carebook_wal_flush_batch_size";

/// Counter: completed log compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "carebook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Count and time one public mutation. Reads are not recorded.
pub(crate) fn record_op<T>(op: &'static str, started: Instant, result: &Result<T, SchedulerError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
