//! A thin sink interface for limiter metrics.
//!
//! Limiters and limit algorithms report through [`MetricSink`]. The default
//! sink discards everything; [`MetricsExporter`] forwards to the
//! [`metrics`](https://docs.rs/metrics) crate's global recorder, from where
//! any installed exporter can ship them.

use ::metrics::Label;

/// Gauge: the current concurrency limit.
pub const LIMIT: &str = "limit";
/// Gauge: the current number of jobs in flight.
pub const INFLIGHT: &str = "inflight";
/// Gauge: a partition's share of the limit. Tagged with `partition`.
pub const PARTITION_LIMIT: &str = "limit.partition";
/// Counter: one increment per finished acquisition. Tagged with `id` (the
/// limiter name) and `status` (`success`, `dropped`, `ignored`, `rejected` or
/// `bypassed`).
pub const CALL: &str = "call";
/// Distribution: the minimum observed round-trip time, in seconds.
pub const MIN_RTT: &str = "min_rtt";
/// Distribution: the candidate round-trip time of each rotated sample window,
/// in seconds.
pub const MIN_WINDOW_RTT: &str = "min_window_rtt";
/// Distribution: the estimated queue size used by delay-based algorithms.
pub const QUEUE_SIZE: &str = "queue_size";

/// Sink for the gauges, counters and distributions the limiters emit.
///
/// Gauges are pushed on change rather than polled.
pub trait MetricSink: Send + Sync + 'static {
    /// Increment a counter by one.
    fn incr_counter(&self, id: &'static str, tags: &[(&'static str, &str)]);

    /// Record the current value of a gauge.
    fn record_gauge(&self, id: &'static str, tags: &[(&'static str, &str)], value: f64);

    /// Record one observation of a distribution.
    fn record_distribution(&self, id: &'static str, tags: &[(&'static str, &str)], value: f64);
}

/// Discards all metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn incr_counter(&self, _id: &'static str, _tags: &[(&'static str, &str)]) {}

    fn record_gauge(&self, _id: &'static str, _tags: &[(&'static str, &str)], _value: f64) {}

    fn record_distribution(&self, _id: &'static str, _tags: &[(&'static str, &str)], _value: f64) {}
}

/// Forwards everything to the [`metrics`] crate's global recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsExporter;

impl MetricSink for MetricsExporter {
    fn incr_counter(&self, id: &'static str, tags: &[(&'static str, &str)]) {
        ::metrics::counter!(id, labels(tags)).increment(1);
    }

    fn record_gauge(&self, id: &'static str, tags: &[(&'static str, &str)], value: f64) {
        ::metrics::gauge!(id, labels(tags)).set(value);
    }

    fn record_distribution(&self, id: &'static str, tags: &[(&'static str, &str)], value: f64) {
        ::metrics::histogram!(id, labels(tags)).record(value);
    }
}

fn labels(tags: &[(&'static str, &str)]) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(*key, value.to_string()))
        .collect()
}
