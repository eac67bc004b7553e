use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{limits::Sample, Outcome};

use super::defaults::{DEFAULT_INITIAL_LIMIT, DEFAULT_MAX_LIMIT, DEFAULT_MIN_LIMIT};
use super::{ChangeNotifier, LimitAlgorithm};

/// Loss-based congestion avoidance.
///
/// Additive-increase, multiplicative decrease.
///
/// Adds available concurrency one unit at a time while jobs complete without
/// load-based errors and latency stays below the timeout threshold, provided
/// the current limit is well utilised.
///
/// Reduces available concurrency by a factor when a load-based error is
/// observed or latency exceeds the timeout threshold.
pub struct Aimd {
    min_limit: usize,
    max_limit: usize,
    backoff_ratio: f64,
    increase_by: usize,
    timeout_threshold: Duration,

    limit: AtomicUsize,
    notifier: ChangeNotifier,
}

impl Aimd {
    const DEFAULT_BACKOFF_RATIO: f64 = 0.9;
    const DEFAULT_INCREASE: usize = 1;
    const DEFAULT_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(5);

    #[allow(missing_docs)]
    pub fn new_with_initial_limit(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        Self {
            min_limit: DEFAULT_MIN_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            backoff_ratio: Self::DEFAULT_BACKOFF_RATIO,
            increase_by: Self::DEFAULT_INCREASE,
            timeout_threshold: Self::DEFAULT_TIMEOUT_THRESHOLD,

            limit: AtomicUsize::new(initial_limit),
            notifier: ChangeNotifier::new(),
        }
    }

    /// The factor applied to the limit on overload. 0 < `ratio` < 1.
    pub fn with_backoff_ratio(self, ratio: f64) -> Self {
        assert!(ratio > 0.0 && ratio < 1.0);
        Self {
            backoff_ratio: ratio,
            ..self
        }
    }

    #[allow(missing_docs)]
    pub fn with_increase_by(self, increase: usize) -> Self {
        assert!(increase > 0);
        Self {
            increase_by: increase,
            ..self
        }
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

    /// Latencies above this threshold are treated like load-based errors.
    pub fn with_timeout_threshold(self, threshold: Duration) -> Self {
        Self {
            timeout_threshold: threshold,
            ..self
        }
    }
}

impl Default for Aimd {
    fn default() -> Self {
        Self::new_with_initial_limit(DEFAULT_INITIAL_LIMIT)
    }
}

#[async_trait]
impl LimitAlgorithm for Aimd {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn update(&self, sample: Sample) -> usize {
        let overloaded =
            sample.outcome == Outcome::Overload || sample.latency > self.timeout_threshold;

        let old_limit = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |limit| {
                if overloaded {
                    Some(multiplicative_decrease(limit, self.backoff_ratio).max(self.min_limit))
                } else if sample.in_flight * 2 >= limit {
                    // Only grow when the limit is well utilised, to prevent
                    // upward drift while mostly idle.
                    Some((limit + self.increase_by).clamp(self.min_limit, self.max_limit))
                } else {
                    Some(limit)
                }
            })
            .expect("we always return Some(limit)");

        let new_limit = self.limit.load(Ordering::SeqCst);
        self.notifier.notify_if_changed(old_limit, new_limit);
        new_limit
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.notifier.subscribe(listener);
    }
}

fn multiplicative_decrease(limit: usize, backoff_ratio: f64) -> usize {
    let limit = limit as f64 * backoff_ratio;

    // Floor instead of round, so the limit reduces even with small numbers.
    // E.g. round(2 * 0.9) = 2, but floor(2 * 0.9) = 1
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        limit.floor() as usize
    }
}
