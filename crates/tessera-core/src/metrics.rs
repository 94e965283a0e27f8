//! Prometheus metrics helpers for tessera.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tessera_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("timeline_events_received_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`timeline_`, `ingest_`, `verifier_`, `profile_`, `cache_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly (`result`, `outcome`, `cache`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves `/metrics` on the given port from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

fn register_metrics() {
    // =========================================================================
    // Timeline consolidation
    // =========================================================================

    describe_counter!(
        "timeline_events_received_total",
        "Events handed to the consolidator (live and historical)"
    );
    describe_counter!(
        "timeline_events_duplicate_total",
        "Events dropped as duplicates or superseded versions"
    );
    describe_counter!(
        "timeline_events_filtered_total",
        "Events dropped by block/mute policy"
    );
    describe_counter!(
        "timeline_events_buffered_total",
        "Events buffered while the consumer was paused"
    );
    describe_counter!(
        "timeline_pending_overflow_total",
        "Times the pending buffer overflowed and stopped ingestion"
    );
    describe_counter!(
        "timeline_deliveries_total",
        "Snapshots delivered to the consumer"
    );
    describe_gauge!("timeline_length", "Events in the current timeline snapshot");
    describe_gauge!("timeline_pending", "Events waiting in the pending buffer");

    // =========================================================================
    // Ingest / verification / profiles
    // =========================================================================

    describe_counter!(
        "ingest_subscriptions_total",
        "Subscriptions opened against the transport"
    );
    describe_counter!(
        "ingest_closes_total",
        "Transport-reported subscription closes"
    );
    describe_counter!(
        "verifier_checks_total",
        "Signature checks performed (label: result)"
    );
    describe_counter!(
        "verifier_coalesced_total",
        "Verify requests coalesced onto an in-flight check"
    );
    describe_counter!(
        "profile_fetches_total",
        "Profile resolutions (label: outcome)"
    );

    // =========================================================================
    // Caches
    // =========================================================================

    describe_counter!("cache_hits_total", "Cache hits (label: cache, layer)");
    describe_counter!("cache_misses_total", "Cache misses (label: cache)");
    describe_counter!(
        "cache_evictions_total",
        "Entries evicted by the entry cap (label: cache)"
    );
    describe_counter!(
        "cache_store_errors_total",
        "Backing store operations that failed (label: cache)"
    );
}
