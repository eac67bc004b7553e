use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;

use crate::limits::{LimitAlgorithm, Sample};
use crate::metrics::{self, MetricSink, NoopMetricSink};

use super::{next_limiter_name, Limiter, LimiterState, Outcome, Rejected, Token};

/// The standard, unpartitioned limiter.
///
/// Tracks jobs in flight with an atomic counter and rejects once the counter
/// reaches the algorithm's current limit. Never waits; wrap with
/// [`BlockingLimiter`](super::BlockingLimiter) or
/// [`LifoBlockingLimiter`](super::LifoBlockingLimiter) for waiting semantics.
///
/// An optional bypass predicate over the context short-circuits matching
/// acquisitions to a no-cost token which is neither counted nor sampled.
pub struct DefaultLimiter<L, C = ()> {
    name: String,
    limit_algo: L,
    in_flight: Arc<AtomicUsize>,

    bypass: Option<Box<dyn Fn(&C) -> bool + Send + Sync>>,

    sink: Arc<dyn MetricSink>,
}

impl<L: LimitAlgorithm> DefaultLimiter<L> {
    /// A limiter with a context type of `()`.
    pub fn new(limit_algo: L) -> Self {
        Self::new_with_context(limit_algo)
    }
}

impl<L: LimitAlgorithm, C> DefaultLimiter<L, C> {
    /// A limiter consulted with a caller-supplied context type, for use with
    /// [`with_bypass`](Self::with_bypass).
    pub fn new_with_context(limit_algo: L) -> Self {
        Self {
            name: next_limiter_name(),
            limit_algo,
            in_flight: Arc::new(AtomicUsize::new(0)),
            bypass: None,
            sink: Arc::new(NoopMetricSink),
        }
    }

    /// Name used to tag this limiter's metrics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Short-circuit matching acquisitions past the limit entirely.
    ///
    /// Bypassed jobs are not counted in flight and produce no samples.
    pub fn with_bypass(mut self, predicate: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.bypass = Some(Box::new(predicate));
        self
    }

    #[allow(missing_docs)]
    pub fn with_metric_sink(mut self, sink: impl MetricSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    fn bypass_requested(&self, ctx: &C) -> bool {
        let Some(predicate) = &self.bypass else {
            return false;
        };
        // A panicking predicate must not leak capacity accounting; treat it
        // as "no bypass".
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| predicate(ctx))).unwrap_or_else(
            |_| {
                tracing::warn!(limiter = %self.name, "bypass predicate panicked");
                false
            },
        )
    }

    fn count_call(&self, status: &'static str) {
        self.sink
            .incr_counter(metrics::CALL, &[("id", &self.name), ("status", status)]);
    }
}

#[async_trait]
impl<L, C> Limiter<C> for DefaultLimiter<L, C>
where
    L: LimitAlgorithm,
    C: Send + Sync,
{
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected> {
        if self.bypass_requested(ctx) {
            self.count_call("bypassed");
            return Ok(Token::bypassed());
        }

        let limit = self.limit_algo.limit();
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                self.count_call("rejected");
                return Err(Rejected::LimitReached);
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Token::new(self.in_flight.clone(), current + 1)),
                Err(actual) => current = actual,
            }
        }
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        if token.is_bypassed() {
            return self.limit_algo.limit();
        }

        let latency = token.latency();
        let in_flight_at_acquire = token.in_flight_at_acquire();

        // Free the capacity before running the algorithm, so the decrement is
        // observable as soon as possible.
        drop(token);

        let new_limit = match outcome {
            Some(outcome) => {
                self.count_call(match outcome {
                    Outcome::Success => "success",
                    Outcome::Overload => "dropped",
                });
                self.limit_algo
                    .update(Sample::new(latency, in_flight_at_acquire, outcome))
                    .await
            }
            None => {
                self.count_call("ignored");
                self.limit_algo.limit()
            }
        };

        self.sink
            .record_gauge(metrics::LIMIT, &[("id", &self.name)], new_limit as f64);
        self.sink.record_gauge(
            metrics::INFLIGHT,
            &[("id", &self.name)],
            self.in_flight.load(Ordering::SeqCst) as f64,
        );

        new_limit
    }

    fn limit(&self) -> usize {
        self.limit_algo.limit()
    }

    fn state(&self) -> LimiterState {
        LimiterState::new(self.limit_algo.limit(), self.in_flight.load(Ordering::SeqCst))
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.limit_algo.notify_on_change(listener);
    }
}

impl<L: std::fmt::Debug, C> std::fmt::Debug for DefaultLimiter<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultLimiter")
            .field("name", &self.name)
            .field("limit_algo", &self.limit_algo)
            .field("in_flight", &self.in_flight)
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}
