use std::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use async_trait::async_trait;
use conv::ConvAsUtil;
use tokio::sync::Mutex;

use crate::measurements::{ExpAvg, Measurement};
use crate::metrics::{self, MetricSink, NoopMetricSink};

use super::defaults::{
    DEFAULT_INITIAL_LIMIT, DEFAULT_MAX_LIMIT, DEFAULT_MIN_LIMIT, MIN_SAMPLE_LATENCY,
};
use super::functions::square_root;
use super::{ChangeNotifier, LimitAlgorithm, Sample};

/// Delay-gradient congestion avoidance.
///
/// Compares a short exponential average of latency against a long one. When
/// recent latency inflates relative to the long-term view, the gradient
/// (`long / short`, clamped to `[0.5, 1.0]`) scales the limit down; at parity
/// a small queueing allowance (`⌈√limit⌉` by default) lets the limit probe
/// upwards. A load-based error halves the limit outright.
///
/// Unlike [`Vegas`](super::Vegas), no absolute minimum latency is tracked, so
/// the estimate cannot be poisoned by a baseline observed before a permanent
/// slowdown. Two corrections keep the long window honest:
///
/// - when latency returns to normal after a prolonged period of excessive
///   load, the long window is reduced faster than its smoothing would allow
/// - when the short window stays above the long window for a sustained run of
///   samples, the long window is nudged upwards, so a chronically slowed
///   service is not starved forever
///
/// Inspired by TCP congestion control algorithms using delay gradients.
///
/// - [Revisiting TCP Congestion Control Using Delay Gradients](https://hal.science/hal-01597987/)
pub struct Gradient2 {
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    tolerance: f64,
    drift_limit: u32,

    /// Queueing allowance, as a function of the current limit.
    queue_size: Box<dyn (Fn(usize) -> f64) + Send + Sync>,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
    notifier: ChangeNotifier,

    sink: Arc<dyn MetricSink>,
}

#[derive(Debug)]
struct Inner {
    short_rtt: ExpAvg,
    long_rtt: ExpAvg,

    /// The limit estimate, kept fractional so smoothing can accumulate.
    estimated: f64,

    /// Consecutive samples with the short window above the long window.
    drift_count: u32,
}

impl Gradient2 {
    const DEFAULT_SHORT_WINDOW: u32 = 60;
    const DEFAULT_LONG_WINDOW: u32 = 600;
    const WARMUP_SAMPLES: u32 = 10;

    const DEFAULT_SMOOTHING: f64 = 0.2;
    const DEFAULT_TOLERANCE: f64 = 1.0;

    /// Consecutive drifting samples before the long window is nudged.
    const DEFAULT_DRIFT_LIMIT: u32 = 30;

    #[allow(missing_docs)]
    pub fn new_with_initial_limit(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        Self {
            min_limit: DEFAULT_MIN_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            smoothing: Self::DEFAULT_SMOOTHING,
            tolerance: Self::DEFAULT_TOLERANCE,
            drift_limit: Self::DEFAULT_DRIFT_LIMIT,

            queue_size: Box::new(|limit| square_root(limit).ceil()),

            limit: AtomicUsize::new(initial_limit),
            inner: Mutex::new(Inner {
                short_rtt: ExpAvg::new(Self::DEFAULT_SHORT_WINDOW, Self::WARMUP_SAMPLES),
                long_rtt: ExpAvg::new(Self::DEFAULT_LONG_WINDOW, Self::WARMUP_SAMPLES),
                estimated: initial_limit as f64,
                drift_count: 0,
            }),
            notifier: ChangeNotifier::new(),

            sink: Arc::new(NoopMetricSink),
        }
    }

    /// Window size (in samples) of the short latency average.
    pub fn with_short_window(mut self, k: u32) -> Self {
        self.inner.get_mut().short_rtt = ExpAvg::new(k, Self::WARMUP_SAMPLES);
        self
    }

    /// Window size (in samples) of the long latency average.
    ///
    /// Typically around 10x the short window.
    pub fn with_long_window(mut self, k: u32) -> Self {
        self.inner.get_mut().long_rtt = ExpAvg::new(k, Self::WARMUP_SAMPLES);
        self
    }

    #[allow(missing_docs)]
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min > 0);
        Self {
            min_limit: min,
            ..self
        }
    }

    #[allow(missing_docs)]
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_limit: max,
            ..self
        }
    }

    /// Weighting for the newly estimated limit on each update.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!(smoothing > 0.0 && smoothing <= 1.0);
        Self { smoothing, ..self }
    }

    /// Multiplier on the latency ratio, tolerating short-window latency up to
    /// this factor above the long window before shrinking the limit.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        assert!(tolerance >= 1.0);
        Self { tolerance, ..self }
    }

    /// Consecutive samples with the short window above the long window before
    /// the long window is nudged upwards.
    pub fn with_drift_limit(self, samples: u32) -> Self {
        assert!(samples > 0);
        Self {
            drift_limit: samples,
            ..self
        }
    }

    /// Replace the queueing allowance function.
    pub fn with_queue_size(self, f: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            queue_size: Box::new(f),
            ..self
        }
    }

    /// Report the queueing allowance as a
    /// [`queue_size`](crate::metrics::QUEUE_SIZE) distribution.
    pub fn with_metric_sink(self, sink: impl MetricSink) -> Self {
        Self {
            sink: Arc::new(sink),
            ..self
        }
    }
}

impl Default for Gradient2 {
    fn default() -> Self {
        Self::new_with_initial_limit(DEFAULT_INITIAL_LIMIT)
    }
}

#[async_trait]
impl LimitAlgorithm for Gradient2 {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < MIN_SAMPLE_LATENCY {
            return self.limit.load(Ordering::Acquire);
        }

        let mut inner = self.inner.lock().await;

        let rtt = sample.latency.as_secs_f64();

        let short = inner.short_rtt.add(rtt);
        let long = inner.long_rtt.add(rtt);

        // Latency returning to normal after a prolonged period of excessive
        // load: bring the long window down faster than its smoothing would.
        if long / short > 2.0 {
            inner.long_rtt.update(|value| value * 0.95);
        }

        // Chronically slowed service: let the long window catch up so the
        // gradient does not pin the limit at its floor forever.
        if short > long {
            inner.drift_count += 1;
            if inner.drift_count >= self.drift_limit {
                inner.long_rtt.update(|value| value * 1.05);
                inner.drift_count = 0;
            }
        } else {
            inner.drift_count = 0;
        }

        let estimated = inner.estimated;
        let level: usize = estimated
            .round()
            .approx()
            .expect("estimate is clamped within usize bounds");

        let new_estimated = if sample.did_drop() {
            // Halve outright, no smoothing.
            estimated / 2.0
        } else if (sample.in_flight as f64) * 2.0 < estimated {
            // Not enough utilisation to judge.
            estimated
        } else {
            let gradient = (self.tolerance * long / short).clamp(0.5, 1.0);
            let queue_size = (self.queue_size)(level);
            self.sink
                .record_distribution(metrics::QUEUE_SIZE, &[], queue_size);

            let target = estimated * gradient + queue_size;
            estimated * (1.0 - self.smoothing) + target * self.smoothing
        };

        inner.estimated = new_estimated.clamp(self.min_limit as f64, self.max_limit as f64);

        let new_limit: usize = inner
            .estimated
            .round()
            .approx()
            .expect("estimate is clamped within usize bounds");

        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);
        self.notifier.notify_if_changed(old_limit, new_limit);
        new_limit
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.notifier.subscribe(listener);
    }
}

impl Debug for Gradient2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gradient2")
            .field("limit", &self.limit)
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .field("smoothing", &self.smoothing)
            .field("tolerance", &self.tolerance)
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::Outcome;

    use super::*;

    fn success(latency_ms: u64, in_flight: usize) -> Sample {
        Sample::new(
            Duration::from_millis(latency_ms),
            in_flight,
            Outcome::Success,
        )
    }

    #[tokio::test]
    async fn grows_on_steady_latency_at_high_utilisation() {
        let gradient = Gradient2::new_with_initial_limit(10);

        for _ in 0..20 {
            let in_flight = gradient.limit();
            gradient.update(success(25, in_flight)).await;
        }

        assert!(
            gradient.limit() > 10,
            "steady latency + high utilisation: increase, got {}",
            gradient.limit()
        );
    }

    #[tokio::test]
    async fn shrinks_when_latency_inflates() {
        let gradient = Gradient2::new_with_initial_limit(10).with_short_window(1);

        // Establish a baseline without letting the limit move (low
        // utilisation).
        for _ in 0..15 {
            gradient.update(success(25, 2)).await;
        }
        assert_eq!(gradient.limit(), 10);

        for _ in 0..10 {
            gradient.update(success(250, 10)).await;
        }

        assert!(
            gradient.limit() < 10,
            "inflated latency: decrease, got {}",
            gradient.limit()
        );
    }

    #[tokio::test]
    async fn halves_on_overload() {
        let gradient = Gradient2::new_with_initial_limit(10);

        let limit = gradient
            .update(Sample::new(
                Duration::from_millis(25),
                5,
                Outcome::Overload,
            ))
            .await;

        assert_eq!(limit, 5);
    }

    #[tokio::test]
    async fn does_not_grow_while_underutilised() {
        let gradient = Gradient2::new_with_initial_limit(10);

        for _ in 0..20 {
            gradient.update(success(25, 2)).await;
        }

        assert_eq!(gradient.limit(), 10);
    }

    #[tokio::test]
    async fn recovers_from_chronic_slowdown() {
        let gradient = Gradient2::new_with_initial_limit(10)
            .with_short_window(1)
            .with_drift_limit(2);

        for _ in 0..15 {
            gradient.update(success(10, 2)).await;
        }

        // A permanent latency shift. The gradient pins the limit low at
        // first, then the long window catches up and growth resumes.
        let mut lowest = gradient.limit();
        for _ in 0..200 {
            let in_flight = gradient.limit();
            gradient.update(success(20, in_flight)).await;
            lowest = lowest.min(gradient.limit());
        }

        assert!(
            gradient.limit() > lowest,
            "limit should recover once the long window catches up: lowest {lowest}, now {}",
            gradient.limit()
        );
    }

    #[tokio::test]
    async fn stays_within_bounds() {
        let gradient = Gradient2::new_with_initial_limit(10)
            .with_min_limit(5)
            .with_max_limit(15);

        for _ in 0..50 {
            gradient
                .update(Sample::new(Duration::from_millis(25), 0, Outcome::Overload))
                .await;
        }
        assert_eq!(gradient.limit(), 5);

        for _ in 0..100 {
            let in_flight = gradient.limit();
            gradient.update(success(25, in_flight)).await;
        }
        assert_eq!(gradient.limit(), 15);
    }
}
