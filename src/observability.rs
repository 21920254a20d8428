use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "corral_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "corral_http_request_duration_seconds";

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "corral_reservations_created_total";

/// Counter: reservation attempts rejected by an overlapping block.
pub const RESERVE_CONFLICTS_TOTAL: &str = "corral_reserve_conflicts_total";

/// Counter: feed exports served.
pub const FEED_EXPORTS_TOTAL: &str = "corral_feed_exports_total";

// ── Synchronizer metrics ────────────────────────────────────────

/// Counter: links synchronized successfully.
pub const SYNC_SUCCESS_TOTAL: &str = "corral_sync_success_total";

/// Counter: link syncs that failed to fetch or parse.
pub const SYNC_FAILURES_TOTAL: &str = "corral_sync_failures_total";

/// Counter: external events cached across all successful syncs.
pub const SYNC_EVENTS_TOTAL: &str = "corral_sync_events_total";

/// Histogram: wall-clock duration of a full sync batch in seconds.
pub const SYNC_BATCH_DURATION_SECONDS: &str = "corral_sync_batch_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "corral_tenants_active";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "corral_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "corral_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "corral_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
