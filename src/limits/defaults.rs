use std::time::Duration;

/// Samples with latencies below this are unreliable and are not fed to the
/// algorithms.
pub(crate) const MIN_SAMPLE_LATENCY: Duration = Duration::from_micros(1);

pub(crate) const DEFAULT_INITIAL_LIMIT: usize = 20;
pub(crate) const DEFAULT_MIN_LIMIT: usize = 1;
pub(crate) const DEFAULT_MAX_LIMIT: usize = 1000;
