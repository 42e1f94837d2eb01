//! Metrics collection and export for feedhub.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use feedhub_core::{Hub, HubStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "feedhub_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "feedhub_connections_active";
    pub const FEEDS_TOTAL: &str = "feedhub_feeds_total";
    pub const ERRORS_TOTAL: &str = "feedhub_errors_total";
    pub const HUB_CONNECTIONS: &str = "feedhub_hub_connections";
    pub const BROADCASTS_PROCESSED: &str = "feedhub_broadcasts_processed_total";
    pub const BROADCASTS_COALESCED: &str = "feedhub_broadcasts_coalesced_total";
    pub const BROADCASTS_DROPPED: &str = "feedhub_broadcasts_dropped_total";
    pub const DELIVERIES_QUEUED: &str = "feedhub_deliveries_queued_total";
    pub const DELIVERIES_TIMED_OUT: &str = "feedhub_deliveries_timed_out_total";
    pub const RENDER_FAILURES: &str = "feedhub_render_failures_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of feed-counter connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::FEEDS_TOTAL, "Total number of inserted feed items");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_gauge!(
        names::HUB_CONNECTIONS,
        "Connections registered with the hub"
    );
    metrics::describe_counter!(names::BROADCASTS_PROCESSED, "Fan-outs performed by the hub");
    metrics::describe_counter!(
        names::BROADCASTS_COALESCED,
        "Broadcast triggers folded into an earlier fan-out"
    );
    metrics::describe_counter!(
        names::BROADCASTS_DROPPED,
        "Broadcast triggers dropped on a full queue"
    );
    metrics::describe_counter!(names::DELIVERIES_QUEUED, "Counter payloads queued for writing");
    metrics::describe_counter!(
        names::DELIVERIES_TIMED_OUT,
        "Counter payloads dropped after the delivery timeout"
    );
    metrics::describe_counter!(names::RENDER_FAILURES, "Counter payloads that failed to render");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an inserted feed item.
pub fn record_feed(kind: &str) {
    counter!(names::FEEDS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Export a hub statistics snapshot.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::HUB_CONNECTIONS).set(stats.connections as f64);
    counter!(names::BROADCASTS_PROCESSED).absolute(stats.broadcasts_processed);
    counter!(names::BROADCASTS_COALESCED).absolute(stats.broadcasts_coalesced);
    counter!(names::BROADCASTS_DROPPED).absolute(stats.broadcasts_dropped);
    counter!(names::DELIVERIES_QUEUED).absolute(stats.deliveries_queued);
    counter!(names::DELIVERIES_TIMED_OUT).absolute(stats.deliveries_timed_out);
    counter!(names::RENDER_FAILURES).absolute(stats.render_failures);
}

/// Export hub statistics every `period` until the task is aborted.
pub fn spawn_stats_reporter(hub: Hub, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            record_hub_stats(&hub.stats());
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
