//! Prometheus metrics for ingestion workers
//!
//! Metrics include:
//! - records appended per mode and source
//! - duplicates skipped by the novelty filter
//! - transport errors and stream reconnects
//! - rotations by outcome
//! - supervisor restarts and live worker count
//! - fetch latency (pull mode)

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

/// Worker modes, used as the `mode` label
pub const MODE_PUSH: &str = "push";
pub const MODE_PULL: &str = "pull";

static RECORDS_APPENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_records_appended_total",
        "Records durably appended to bucket files",
        &["mode", "source"]
    )
    .expect("Failed to create records_appended metric")
});

static DUPLICATES_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_duplicates_skipped_total",
        "Fetched records dropped as already seen",
        &["source"]
    )
    .expect("Failed to create duplicates_skipped metric")
});

static ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_errors_total",
        "Errors by mode and error kind",
        &["mode", "kind"]
    )
    .expect("Failed to create errors metric")
});

static STREAM_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_stream_reconnects_total",
        "Push-mode stream reconnect attempts",
        &["source"]
    )
    .expect("Failed to create stream_reconnects metric")
});

static ROTATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_rotations_total",
        "Period rotations by outcome",
        &["outcome"]
    )
    .expect("Failed to create rotations metric")
});

static WORKER_RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_worker_restarts_total",
        "Workers restarted by the supervisor after a crash",
        &["mode"]
    )
    .expect("Failed to create worker_restarts metric")
});

static ACTIVE_WORKERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ingestion_active_workers",
        "Workers currently running",
        &["mode"]
    )
    .expect("Failed to create active_workers metric")
});

static FETCH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "ingestion_fetch_latency_seconds",
            "Directory fetch latency in seconds"
        )
        .buckets(buckets),
        &["source"]
    )
    .expect("Failed to create fetch_latency metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_appended(mode: &str, source: &str, count: u64) {
    RECORDS_APPENDED.with_label_values(&[mode, source]).inc_by(count);
}

pub fn record_duplicates(source: &str, count: u64) {
    DUPLICATES_SKIPPED.with_label_values(&[source]).inc_by(count);
}

/// Records an error; `kind` is a lowercase error-kind label
pub fn record_error(mode: &str, kind: &str) {
    ERRORS.with_label_values(&[mode, kind]).inc();
}

pub fn record_reconnect(source: &str) {
    STREAM_RECONNECTS.with_label_values(&[source]).inc();
}

pub fn record_rotation(outcome: &str) {
    ROTATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_restart(mode: &str) {
    WORKER_RESTARTS.with_label_values(&[mode]).inc();
}

pub fn inc_active_workers(mode: &str) {
    ACTIVE_WORKERS.with_label_values(&[mode]).inc();
}

pub fn dec_active_workers(mode: &str) {
    ACTIVE_WORKERS.with_label_values(&[mode]).dec();
}

pub fn record_fetch_latency(source: &str, latency_secs: f64) {
    FETCH_LATENCY.with_label_values(&[source]).observe(latency_secs);
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Serves `/metrics` until the listener fails
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        record_appended(MODE_PULL, "example.social", 3);
        record_duplicates("example.social", 2);
        record_error(MODE_PUSH, "transport");
        record_rotation("archived");
        inc_active_workers(MODE_PUSH);
        dec_active_workers(MODE_PUSH);

        let metrics = gather_metrics();
        assert!(metrics.contains("ingestion_records_appended_total"));
        assert!(metrics.contains("ingestion_duplicates_skipped_total"));
        assert!(metrics.contains("ingestion_errors_total"));
        assert!(metrics.contains("ingestion_rotations_total"));
        assert!(metrics.contains("ingestion_active_workers"));
    }
}
