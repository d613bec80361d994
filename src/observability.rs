use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings written to the ledger. Labels: kind.
pub const BOOKINGS_TOTAL: &str = "parkd_bookings_total";

/// Counter: booking attempts rejected with a slot conflict.
pub const BOOKING_CONFLICTS_TOTAL: &str = "parkd_booking_conflicts_total";

/// Counter: bookings cancelled. Labels: reason.
pub const CANCELLATIONS_TOTAL: &str = "parkd_cancellations_total";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: bookings auto-released by the sweeper.
pub const AUTO_RELEASED_TOTAL: &str = "parkd_auto_released_total";

/// Counter: bookings materialized by the recurrence expander.
pub const RECURRENCES_EXPANDED_TOTAL: &str = "parkd_recurrences_expanded_total";

/// Counter: waitlist notices emitted.
pub const WAITLIST_NOTICES_TOTAL: &str = "parkd_waitlist_notices_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "parkd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
