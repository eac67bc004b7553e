//! Sample windows, aggregating request samples over a sampling cycle.

use std::time::Duration;

use crate::ConfigError;

/// An immutable aggregation of request samples within one sampling window.
///
/// Adding a sample returns a new window, so a window can be expanded but only
/// contracted again by starting from [`Default`].
///
/// Dropped (overloaded) samples contribute to the in-flight maximum and the
/// sticky drop flag only; they never influence the latency aggregates.
pub trait SampleWindow: Default {
    /// Fold in a successful sample.
    #[must_use]
    fn add_sample(&self, latency: Duration, in_flight: usize) -> Self;

    /// Fold in a dropped sample.
    #[must_use]
    fn add_dropped_sample(&self, in_flight: usize) -> Self;

    /// An empty window with the same configuration, for starting the next
    /// sampling cycle.
    #[must_use]
    fn fresh(&self) -> Self {
        Self::default()
    }

    /// The minimum latency observed in this window, `None` when no
    /// successful sample has been added.
    fn candidate_rtt(&self) -> Option<Duration>;

    /// The latency aggregate the window is tracking (minimum, average or
    /// percentile, depending on the implementation).
    fn tracked_rtt(&self) -> Option<Duration>;

    /// The maximum number of jobs in flight seen at any sample in the window.
    fn max_in_flight(&self) -> usize;

    /// Number of successful samples folded in.
    fn sample_count(&self) -> usize;

    /// Whether any sample in the window was dropped.
    fn did_drop(&self) -> bool;
}

/// Tracks the minimum latency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinWindow {
    min_rtt: Option<Duration>,
    max_in_flight: usize,
    sample_count: usize,
    did_drop: bool,
}

impl SampleWindow for MinWindow {
    fn add_sample(&self, latency: Duration, in_flight: usize) -> Self {
        Self {
            min_rtt: Some(self.min_rtt.map_or(latency, |min| min.min(latency))),
            max_in_flight: self.max_in_flight.max(in_flight),
            sample_count: self.sample_count + 1,
            did_drop: self.did_drop,
        }
    }

    fn add_dropped_sample(&self, in_flight: usize) -> Self {
        Self {
            max_in_flight: self.max_in_flight.max(in_flight),
            did_drop: true,
            ..self.clone()
        }
    }

    fn candidate_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    fn tracked_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn did_drop(&self) -> bool {
        self.did_drop
    }
}

/// Tracks the minimum and average latency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AverageWindow {
    min_rtt: Option<Duration>,
    sum: Duration,
    max_in_flight: usize,
    sample_count: usize,
    did_drop: bool,
}

impl SampleWindow for AverageWindow {
    fn add_sample(&self, latency: Duration, in_flight: usize) -> Self {
        Self {
            min_rtt: Some(self.min_rtt.map_or(latency, |min| min.min(latency))),
            sum: self.sum + latency,
            max_in_flight: self.max_in_flight.max(in_flight),
            sample_count: self.sample_count + 1,
            did_drop: self.did_drop,
        }
    }

    fn add_dropped_sample(&self, in_flight: usize) -> Self {
        Self {
            max_in_flight: self.max_in_flight.max(in_flight),
            did_drop: true,
            ..self.clone()
        }
    }

    fn candidate_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    fn tracked_rtt(&self) -> Option<Duration> {
        if self.sample_count == 0 {
            return None;
        }
        Some(self.sum.div_f64(self.sample_count as f64))
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn did_drop(&self) -> bool {
        self.did_drop
    }
}

/// Tracks the minimum and a percentile of latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercentileWindow {
    /// Stored in hundredths of a percent so the window stays `Eq` and the
    /// percentile survives reset.
    percentile_hundredths: u32,
    latencies: Vec<Duration>,
    max_in_flight: usize,
    did_drop: bool,
}

impl PercentileWindow {
    /// A window tracking the given latency percentile.
    ///
    /// `percentile` must be in `(0, 1)` exclusive.
    pub fn new(percentile: f64) -> Result<Self, ConfigError> {
        if !(percentile > 0.0 && percentile < 1.0) {
            return Err(ConfigError::PercentileOutOfRange(percentile));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(Self {
            percentile_hundredths: (percentile * 10_000.0).round() as u32,
            ..Self::default()
        })
    }

    fn percentile(&self) -> f64 {
        f64::from(self.percentile_hundredths) / 10_000.0
    }
}

impl Default for PercentileWindow {
    /// P50.
    fn default() -> Self {
        Self {
            percentile_hundredths: 5_000,
            latencies: Vec::new(),
            max_in_flight: 0,
            did_drop: false,
        }
    }
}

impl SampleWindow for PercentileWindow {
    fn fresh(&self) -> Self {
        Self {
            percentile_hundredths: self.percentile_hundredths,
            ..Self::default()
        }
    }

    fn add_sample(&self, latency: Duration, in_flight: usize) -> Self {
        let mut next = self.clone();
        next.latencies.push(latency);
        next.max_in_flight = next.max_in_flight.max(in_flight);
        next
    }

    fn add_dropped_sample(&self, in_flight: usize) -> Self {
        let mut next = self.clone();
        next.max_in_flight = next.max_in_flight.max(in_flight);
        next.did_drop = true;
        next
    }

    fn candidate_rtt(&self) -> Option<Duration> {
        self.latencies.iter().min().copied()
    }

    fn tracked_rtt(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = (sorted.len() as f64 * self.percentile()).ceil() as usize;
        Some(sorted[index.max(1) - 1])
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn sample_count(&self) -> usize {
        self.latencies.len()
    }

    fn did_drop(&self) -> bool {
        self.did_drop
    }
}
