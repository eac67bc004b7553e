use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::aggregation::SampleWindow;
use crate::metrics::{self, MetricSink, NoopMetricSink};
use crate::Outcome;

use super::defaults::MIN_SAMPLE_LATENCY;
use super::{LimitAlgorithm, Sample};

/// Aggregates samples over a sampling window before forwarding them.
///
/// The wrapped algorithm sees exactly one synthesized sample per window
/// rotation, built from the window's tracked latency and maximum in-flight
/// count. A window rotates once it is at least `min_window` old and holds at
/// least `min_samples` samples, or unconditionally at `max_window`.
///
/// Smooths out noisy per-job latencies, at the cost of slower reactions.
pub struct Windowed<L, W> {
    min_window: Duration,
    max_window: Duration,
    min_samples: usize,
    min_latency: Duration,

    inner: L,
    window: Mutex<WindowState<W>>,

    sink: Arc<dyn MetricSink>,
}

struct WindowState<W> {
    window: W,
    start: Instant,
}

impl<L: LimitAlgorithm, W: SampleWindow> Windowed<L, W> {
    const DEFAULT_MIN_WINDOW: Duration = Duration::from_secs(1);
    const DEFAULT_MAX_WINDOW: Duration = Duration::from_secs(10);
    const DEFAULT_MIN_SAMPLES: usize = 10;

    #[allow(missing_docs)]
    pub fn new(inner: L, window: W) -> Self {
        Self {
            min_window: Self::DEFAULT_MIN_WINDOW,
            max_window: Self::DEFAULT_MAX_WINDOW,
            min_samples: Self::DEFAULT_MIN_SAMPLES,
            min_latency: MIN_SAMPLE_LATENCY,

            inner,
            window: Mutex::new(WindowState {
                window,
                start: Instant::now(),
            }),

            sink: Arc::new(NoopMetricSink),
        }
    }

    #[allow(missing_docs)]
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        assert!(samples > 0, "at least one sample required per window");
        self.min_samples = samples;
        self
    }

    #[allow(missing_docs)]
    pub fn with_min_window(mut self, min: Duration) -> Self {
        self.min_window = min;
        self
    }

    #[allow(missing_docs)]
    pub fn with_max_window(mut self, max: Duration) -> Self {
        self.max_window = max;
        self
    }

    /// Report each rotated window's candidate latency as a
    /// [`min_window_rtt`](crate::metrics::MIN_WINDOW_RTT) distribution.
    pub fn with_metric_sink(mut self, sink: impl MetricSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }
}

#[async_trait]
impl<L, W> LimitAlgorithm for Windowed<L, W>
where
    L: LimitAlgorithm,
    W: SampleWindow + Send + Sync,
{
    fn limit(&self) -> usize {
        self.inner.limit()
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < self.min_latency {
            return self.inner.limit();
        }

        let mut state = self.window.lock().await;

        state.window = match sample.outcome {
            Outcome::Overload => state.window.add_dropped_sample(sample.in_flight),
            Outcome::Success => state.window.add_sample(sample.latency, sample.in_flight),
        };

        let elapsed = state.start.elapsed();
        let ready = (elapsed >= self.min_window
            && state.window.sample_count() >= self.min_samples)
            || elapsed >= self.max_window;

        if !ready {
            return self.inner.limit();
        }

        let outcome = if state.window.did_drop() {
            Outcome::Overload
        } else {
            Outcome::Success
        };
        // A window holding only drops has no tracked latency; the window age
        // stands in for the stalled round-trips.
        let latency = state.window.tracked_rtt().unwrap_or(elapsed);

        if let Some(candidate) = state.window.candidate_rtt() {
            self.sink
                .record_distribution(metrics::MIN_WINDOW_RTT, &[], candidate.as_secs_f64());
        }

        let aggregated = Sample::new(latency, state.window.max_in_flight(), outcome);
        tracing::trace!(
            samples = state.window.sample_count(),
            ?elapsed,
            "sample window rotated"
        );

        state.window = state.window.fresh();
        state.start = Instant::now();

        self.inner.update(aggregated).await
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.inner.notify_on_change(listener);
    }
}
