use std::net::SocketAddr;

use crate::notify::HoldSource;

// ── Hold propagation ────────────────────────────────────────────

/// Counter: signals published on the hold bus. Labels: source.
pub const SIGNALS_PUBLISHED_TOTAL: &str = "holdsync_signals_published_total";

/// Counter: bus handlers that panicked during delivery.
pub const HANDLER_PANICS_TOTAL: &str = "holdsync_handler_panics_total";

/// Gauge: identifiers currently held in the session registry.
pub const HOLDS_ACTIVE: &str = "holdsync_holds_active";

/// Counter: holds seeded from durable storage on mount.
pub const HOLDS_REHYDRATED_TOTAL: &str = "holdsync_holds_rehydrated_total";

// ── Availability polling ────────────────────────────────────────

/// Counter: snapshot fetches. Labels: status.
pub const FETCH_TOTAL: &str = "holdsync_fetch_total";

/// Histogram: snapshot fetch latency in seconds.
pub const FETCH_DURATION_SECONDS: &str = "holdsync_fetch_duration_seconds";

/// Counter: fetch results that arrived after their subscription was stopped.
pub const STALE_RESULTS_DISCARDED_TOTAL: &str = "holdsync_stale_results_discarded_total";

// ── Durable storage ─────────────────────────────────────────────

/// Counter: absorbed storage failures. Labels: op.
pub const STORE_ERRORS_TOTAL: &str = "holdsync_store_errors_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a signal source to a short label for metrics.
pub fn source_label(source: HoldSource) -> &'static str {
    match source {
        HoldSource::Cart => "cart",
        HoldSource::Paid => "paid",
        HoldSource::Book => "book",
        HoldSource::Cancel => "cancel",
    }
}
