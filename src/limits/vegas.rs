use std::{fmt::Debug, sync::atomic::{AtomicUsize, Ordering}, sync::Arc};

use async_trait::async_trait;
use conv::ConvAsUtil;
use tokio::sync::Mutex;

use crate::measurements::{Measurement, Minimum};
use crate::metrics::{self, MetricSink, NoopMetricSink};

use super::defaults::{DEFAULT_INITIAL_LIMIT, MIN_SAMPLE_LATENCY};
use super::functions::log10_root;
use super::{ChangeNotifier, LimitAlgorithm, Sample};

/// Delay-based congestion avoidance.
///
/// Estimates queueing by comparing each latency sample against the minimum
/// observed latency. Queueing below a lower threshold grows the limit,
/// queueing above an upper threshold shrinks it, and a load-based error
/// halves it. The thresholds scale with `log10` of the current limit, so
/// larger limits tolerate proportionally more queueing and move in larger
/// steps.
///
/// A sample faster than the recorded baseline becomes the new baseline, so
/// the estimate tracks a service which gets faster over time.
///
/// For greater stability consider wrapping with [`Windowed`](super::Windowed)
/// over a percentile window, so that the comparison is between percentiles
/// rather than individual samples.
///
/// Inspired by TCP Vegas.
///
/// - [TCP Vegas: End to End Congestion Avoidance on a Global
///   Internet](https://www.cs.princeton.edu/courses/archive/fall06/cos561/papers/vegas.pdf)
/// - [Understanding TCP Vegas: Theory and
///   Practice](https://www.cs.princeton.edu/research/techreps/TR-628-00)
pub struct Vegas {
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,

    /// Lower queueing threshold, as a function of the current limit.
    alpha: Box<dyn (Fn(usize) -> f64) + Send + Sync>,
    /// Upper queueing threshold, as a function of the current limit.
    beta: Box<dyn (Fn(usize) -> f64) + Send + Sync>,
    /// Queueing below this is considered noise and triggers an aggressive
    /// increase.
    threshold: Box<dyn (Fn(usize) -> f64) + Send + Sync>,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
    notifier: ChangeNotifier,

    sink: Arc<dyn MetricSink>,
}

#[derive(Debug)]
struct Inner {
    /// The minimum observed latency in seconds, used as a baseline.
    ///
    /// This is the latency we would expect to see with no queueing.
    min_rtt: Minimum,

    /// The limit estimate, kept fractional so smoothing can accumulate.
    estimated: f64,
}

impl Vegas {
    const DEFAULT_MAX_LIMIT: usize = 20;
    const DEFAULT_MIN_LIMIT: usize = 1;

    const DEFAULT_ALPHA_MULTIPLIER: f64 = 3.0;
    const DEFAULT_BETA_MULTIPLIER: f64 = 6.0;

    const DEFAULT_SMOOTHING: f64 = 1.0;

    #[allow(missing_docs)]
    pub fn new_with_initial_limit(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        Self {
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit: Self::DEFAULT_MAX_LIMIT,
            smoothing: Self::DEFAULT_SMOOTHING,

            alpha: Box::new(|limit| Self::DEFAULT_ALPHA_MULTIPLIER * log10_root(limit)),
            beta: Box::new(|limit| Self::DEFAULT_BETA_MULTIPLIER * log10_root(limit)),
            threshold: Box::new(log10_root),

            limit: AtomicUsize::new(initial_limit),
            inner: Mutex::new(Inner {
                min_rtt: Minimum::new(),
                estimated: initial_limit as f64,
            }),
            notifier: ChangeNotifier::new(),

            sink: Arc::new(NoopMetricSink),
        }
    }

    /// Lower queueing threshold: `alpha * log10(limit)`.
    pub fn with_alpha(self, multiplier: f64) -> Self {
        assert!(multiplier > 0.0);
        Self {
            alpha: Box::new(move |limit| multiplier * log10_root(limit)),
            ..self
        }
    }

    /// Upper queueing threshold: `beta * log10(limit)`.
    pub fn with_beta(self, multiplier: f64) -> Self {
        assert!(multiplier > 0.0);
        Self {
            beta: Box::new(move |limit| multiplier * log10_root(limit)),
            ..self
        }
    }

    /// Weighting for the newly estimated limit on each update. `1.0` (the
    /// default) replaces the previous estimate entirely.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!(smoothing > 0.0 && smoothing <= 1.0);
        Self { smoothing, ..self }
    }

    #[allow(missing_docs)]
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_limit: max,
            ..self
        }
    }

    /// Report the observed minimum latency as a
    /// [`min_rtt`](crate::metrics::MIN_RTT) distribution.
    pub fn with_metric_sink(self, sink: impl MetricSink) -> Self {
        Self {
            sink: Arc::new(sink),
            ..self
        }
    }
}

impl Default for Vegas {
    fn default() -> Self {
        Self::new_with_initial_limit(DEFAULT_INITIAL_LIMIT)
    }
}

#[async_trait]
impl LimitAlgorithm for Vegas {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Vegas algorithm, applied per sample (or per aggregated window sample).
    ///
    /// ```text
    /// BASE_D = minimum observed latency (no queueing)
    /// D      = sample latency
    /// L      = current limit estimate
    ///
    /// Q = ⌈L * (1 - BASE_D / D)⌉ = estimated queue size
    ///
    /// L' = L / 2            on overload
    ///      L + beta(L)      if Q <= threshold(L) (no queueing: probe hard)
    ///      L + threshold(L) if Q < alpha(L)      (little queueing)
    ///      L - beta(L)      if Q > beta(L)       (too much queueing)
    ///      L                otherwise
    /// ```
    ///
    /// The result is clamped and smoothed into the running estimate.
    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < MIN_SAMPLE_LATENCY {
            return self.limit.load(Ordering::Acquire);
        }

        let mut inner = self.inner.lock().await;

        let rtt = sample.latency.as_secs_f64();

        if !sample.did_drop() && (inner.min_rtt.is_empty() || rtt < inner.min_rtt.get()) {
            // Record a new baseline "no load" latency and keep the limit.
            inner.min_rtt.add(rtt);
            self.sink.record_distribution(metrics::MIN_RTT, &[], rtt);
            return self.limit.load(Ordering::Acquire);
        }

        let estimated = inner.estimated;
        let level: usize = estimated
            .round()
            .approx()
            .expect("estimate is clamped within usize bounds");

        let queue_size = (estimated * (1.0 - inner.min_rtt.get() / rtt)).ceil();

        let new_estimated = if sample.did_drop() {
            // Limit too big: overload.
            estimated / 2.0
        } else if (sample.in_flight as f64) * 2.0 < estimated {
            // Not enough utilisation to judge; prevents upward drift while
            // mostly idle.
            estimated
        } else {
            let alpha = (self.alpha)(level);
            let beta = (self.beta)(level);
            let threshold = (self.threshold)(level);

            if queue_size <= threshold {
                estimated + beta
            } else if queue_size < alpha {
                estimated + threshold
            } else if queue_size > beta {
                estimated - beta
            } else {
                // Perfect porridge.
                estimated
            }
        };

        let clamped = new_estimated.clamp(self.min_limit as f64, self.max_limit as f64);
        inner.estimated = self.smoothing * clamped + (1.0 - self.smoothing) * estimated;

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

impl Debug for Vegas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vegas")
            .field("limit", &self.limit)
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .field("smoothing", &self.smoothing)
            .field("alpha(10)", &(self.alpha)(10))
            .field("beta(10)", &(self.beta)(10))
            .field("inner", &self.inner)
            .finish()
    }
}
