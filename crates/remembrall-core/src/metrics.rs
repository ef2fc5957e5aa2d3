//! Prometheus metrics helpers for the Remembrall runtime.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across the cache, subscription and batching layers.
//!
//! # Usage
//!
//! ```rust,ignore
//! use remembrall_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("store_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`store_`, `subs_`, `batch_`, `fetch_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly to avoid cardinality explosion

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. Spawns a background
/// task and returns immediately.
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
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for the metrics emitted across Remembrall.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Event Store Metrics
    // =========================================================================

    describe_counter!("store_events_total", "Events admitted into the store");
    describe_counter!(
        "store_events_rejected_total",
        "Events rejected at admission (label: reason)"
    );
    describe_counter!(
        "store_events_replaced_total",
        "Replaceable events evicted by a newer event for the same key"
    );
    describe_counter!("store_events_pruned_total", "Events removed by pruning");
    describe_gauge!("store_events", "Events currently held in the store");

    // =========================================================================
    // Subscription Manager Metrics
    // =========================================================================

    describe_counter!(
        "subs_opened_total",
        "Network subscriptions opened (novel fingerprints)"
    );
    describe_counter!(
        "subs_deduped_total",
        "Subscribe calls attached to an existing fingerprint"
    );
    describe_counter!("subs_closed_total", "Network subscriptions closed");
    describe_counter!(
        "subs_events_forwarded_total",
        "Events forwarded to subscription listeners"
    );
    describe_counter!(
        "subs_listener_lagged_total",
        "Events dropped because a listener channel was full"
    );
    describe_gauge!("subs_live", "Live network subscriptions");

    // =========================================================================
    // Batcher / Fetch Metrics
    // =========================================================================

    describe_counter!(
        "batch_keys_queued_total",
        "Keys added to batch queues (label: purpose)"
    );
    describe_counter!(
        "batch_flushes_total",
        "Batch queue flushes (label: purpose)"
    );
    describe_counter!("fetch_cache_hits_total", "Batched fetches served from the store");
    describe_counter!("fetch_not_found_total", "Batched fetches resolved as not found");

    // =========================================================================
    // Publish Metrics
    // =========================================================================

    describe_counter!("publish_attempts_total", "Events submitted for publishing");
    describe_counter!(
        "publish_relay_failures_total",
        "Per-relay publish rejections or failures"
    );
}
