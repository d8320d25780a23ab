//! Thin wrapper around `prometheus` shared by the coordinator crate.
//!
//! Downstream code never depends on `prometheus` directly; it goes through
//! this crate so the registry and default buckets stay consistent.

pub use prometheus::{
    core, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Histogram,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use prometheus::{Encoder, TextEncoder};

/// Bucket boundaries (seconds) for latency histograms dominated by
/// sub-millisecond to multi-second waits, e.g. lock acquisition and
/// cancel-and-drain grace periods.
pub const WAIT_SECONDS_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Render the default registry in Prometheus text exposition format.
pub fn encode_default_registry() -> anyhow::Result<Vec<u8>> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}
