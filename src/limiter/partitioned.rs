use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use conv::ConvAsUtil;

use crate::limits::{LimitAlgorithm, Sample};
use crate::metrics::{self, MetricSink, NoopMetricSink};
use crate::ConfigError;

use super::{next_limiter_name, Limiter, LimiterState, Outcome, Rejected, Token};

/// A named fraction of the total concurrency limit.
///
/// A partition is guaranteed `max(1, ⌈total * percent⌉)` concurrent jobs once
/// the total limit is saturated, and may borrow beyond that while other
/// partitions leave capacity unused.
#[derive(Debug)]
pub struct Partition {
    name: String,
    percent: f64,
    limit: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

impl Partition {
    fn new(name: String, percent: f64, total_limit: usize) -> Self {
        Self {
            name,
            percent,
            limit: AtomicUsize::new(fractional_limit(total_limit, percent)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// This partition's guaranteed share of the total limit.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Jobs currently admitted on this partition.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn is_exceeded(&self) -> bool {
        self.in_flight() >= self.limit()
    }

    fn resize(&self, total_limit: usize) {
        self.limit
            .store(fractional_limit(total_limit, self.percent), Ordering::SeqCst);
    }
}

/// A limiter which divides its limit among named partitions.
///
/// A resolver maps each caller's context to a partition. Admission is
/// granted while the total limit has spare capacity (borrowing), and past
/// that point only to partitions still under their own share, so a busy
/// partition cannot starve the others. The sum of in-flight jobs can
/// therefore exceed the total limit by up to one share per partition.
///
/// Per-partition counters are kept with relaxed consistency relative to the
/// total; the guarantees are approximate under contention, which is
/// acceptable because admission decisions are re-made on every call.
pub struct PartitionedLimiter<L, C> {
    name: String,
    limit_algo: L,
    total_in_flight: Arc<AtomicUsize>,

    partitions: Arc<Vec<Arc<Partition>>>,
    by_name: HashMap<String, usize>,

    resolver: Box<dyn Fn(&C) -> Option<&'static str> + Send + Sync>,
    bypass: Option<Box<dyn Fn(&C) -> bool + Send + Sync>>,

    sink: Arc<dyn MetricSink>,
}

impl<L: LimitAlgorithm, C> PartitionedLimiter<L, C> {
    /// A limiter divided into the given `(name, percent)` partitions, with a
    /// resolver mapping contexts to partition names. The partition set is
    /// closed at construction, hence the static names.
    ///
    /// Contexts resolving to `None` (or to an unknown name) are admitted
    /// against the total limit only, with no partition guarantee.
    ///
    /// Fails fast when a percent is outside `[0, 1]`, the percents sum to
    /// more than `1.0`, or a name is repeated.
    pub fn new_with_context(
        limit_algo: L,
        partitions: impl IntoIterator<Item = (impl Into<String>, f64)>,
        resolver: impl Fn(&C) -> Option<&'static str> + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        let total_limit = limit_algo.limit();

        let mut built: Vec<Arc<Partition>> = Vec::new();
        let mut by_name = HashMap::new();
        let mut percent_sum = 0.0;

        for (name, percent) in partitions {
            let name = name.into();
            if !(0.0..=1.0).contains(&percent) {
                return Err(ConfigError::PercentOutOfRange(percent));
            }
            percent_sum += percent;
            if by_name.insert(name.clone(), built.len()).is_some() {
                return Err(ConfigError::DuplicatePartition(name));
            }
            built.push(Arc::new(Partition::new(name, percent, total_limit)));
        }

        if percent_sum > 1.0 + f64::EPSILON {
            return Err(ConfigError::PartitionPercentsExceedTotal(percent_sum));
        }

        let partitions = Arc::new(built);

        // Keep the shares in step with the adaptive total.
        let partitions_on_change = Arc::clone(&partitions);
        limit_algo.notify_on_change(Box::new(move |total_limit| {
            for partition in partitions_on_change.iter() {
                partition.resize(total_limit);
            }
        }));

        Ok(Self {
            name: next_limiter_name(),
            limit_algo,
            total_in_flight: Arc::new(AtomicUsize::new(0)),
            partitions,
            by_name,
            resolver: Box::new(resolver),
            bypass: None,
            sink: Arc::new(NoopMetricSink),
        })
    }

    /// Name used to tag this limiter's metrics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Short-circuit matching acquisitions past the limit entirely.
    pub fn with_bypass(mut self, predicate: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.bypass = Some(Box::new(predicate));
        self
    }

    #[allow(missing_docs)]
    pub fn with_metric_sink(mut self, sink: impl MetricSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Look up a partition by name.
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.by_name
            .get(name)
            .map(|&index| self.partitions[index].as_ref())
    }

    fn resolve(&self, ctx: &C) -> Option<&Arc<Partition>> {
        let name =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.resolver)(ctx)))
                .unwrap_or_else(|_| {
                    tracing::warn!(limiter = %self.name, "partition resolver panicked");
                    None
                })?;

        let partition = self.by_name.get(name);
        if partition.is_none() {
            tracing::trace!(limiter = %self.name, partition = name, "unknown partition");
        }
        partition.map(|&index| &self.partitions[index])
    }

    fn bypass_requested(&self, ctx: &C) -> bool {
        let Some(predicate) = &self.bypass else {
            return false;
        };
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

    fn record_partition_gauges(&self) {
        for partition in self.partitions.iter() {
            let tags = &[("id", self.name.as_str()), ("partition", partition.name())];
            self.sink
                .record_gauge(metrics::PARTITION_LIMIT, tags, partition.limit() as f64);
            self.sink
                .record_gauge(metrics::INFLIGHT, tags, partition.in_flight() as f64);
        }
    }
}

#[async_trait]
impl<L, C> Limiter<C> for PartitionedLimiter<L, C>
where
    L: LimitAlgorithm,
    C: Send + Sync,
{
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected> {
        if self.bypass_requested(ctx) {
            self.count_call("bypassed");
            return Ok(Token::bypassed());
        }

        let total_limit = self.limit_algo.limit();
        let total_in_flight = self.total_in_flight.load(Ordering::SeqCst);
        let partition = self.resolve(ctx);

        // Borrow from unused capacity until the total is reached, then fall
        // back to the partition's own guarantee.
        let admitted = match partition {
            Some(partition) => total_in_flight < total_limit || !partition.is_exceeded(),
            None => total_in_flight < total_limit,
        };

        if !admitted {
            self.count_call("rejected");
            return Err(match partition {
                Some(_) => Rejected::PartitionExhausted,
                None => Rejected::LimitReached,
            });
        }

        let snapshot = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Token::new(self.total_in_flight.clone(), snapshot);

        Ok(match partition {
            Some(partition) => {
                partition.in_flight.fetch_add(1, Ordering::SeqCst);
                token.for_partition(partition.in_flight.clone())
            }
            None => token,
        })
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        if token.is_bypassed() {
            return self.limit_algo.limit();
        }

        let latency = token.latency();
        let in_flight_at_acquire = token.in_flight_at_acquire();
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
            self.total_in_flight.load(Ordering::SeqCst) as f64,
        );
        self.record_partition_gauges();

        new_limit
    }

    fn limit(&self) -> usize {
        self.limit_algo.limit()
    }

    fn state(&self) -> LimiterState {
        LimiterState::new(
            self.limit_algo.limit(),
            self.total_in_flight.load(Ordering::SeqCst),
        )
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.limit_algo.notify_on_change(listener);
    }
}

impl<L: std::fmt::Debug, C> std::fmt::Debug for PartitionedLimiter<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedLimiter")
            .field("name", &self.name)
            .field("limit_algo", &self.limit_algo)
            .field("total_in_flight", &self.total_in_flight)
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// `max(1, ⌈limit * percent⌉)`.
fn fractional_limit(limit: usize, percent: f64) -> usize {
    let fractional = limit as f64 * percent;

    let limit: usize = fractional
        .ceil()
        .approx()
        .expect("should be clamped within usize bounds");
    limit.max(1)
}

#[cfg(test)]
mod tests {
    use crate::limits::{Aimd, Settable};

    use super::*;

    fn resolve_by_ctx(ctx: &&'static str) -> Option<&'static str> {
        Some(ctx)
    }

    fn by_name<L: LimitAlgorithm>(
        limit_algo: L,
        partitions: Vec<(&'static str, f64)>,
    ) -> PartitionedLimiter<L, &'static str> {
        PartitionedLimiter::new_with_context(limit_algo, partitions, resolve_by_ctx).unwrap()
    }

    #[tokio::test]
    async fn partitions_divide_the_limit() {
        let limiter = by_name(Settable::new(10), vec![("batch", 0.3), ("live", 0.7)]);

        assert_eq!(limiter.partition("batch").unwrap().limit(), 3);
        assert_eq!(limiter.partition("live").unwrap().limit(), 7);
    }

    #[tokio::test]
    async fn shares_follow_limit_changes() {
        let limiter: PartitionedLimiter<Settable, &'static str> =
            by_name(Settable::new(10), vec![("batch", 0.3), ("live", 0.7)]);

        limiter.limit_algo.set_limit(20);

        assert_eq!(limiter.partition("batch").unwrap().limit(), 6);
        assert_eq!(limiter.partition("live").unwrap().limit(), 14);
    }

    #[tokio::test]
    async fn borrows_until_total_then_enforces_guarantees() {
        let limiter = by_name(Settable::new(10), vec![("batch", 0.3), ("live", 0.7)]);

        // Batch can borrow all the way up to the total limit.
        let mut batch_tokens = Vec::new();
        for n in 0..10 {
            batch_tokens.push(
                limiter
                    .try_acquire(&"batch")
                    .await
                    .unwrap_or_else(|_| panic!("batch acquire {n} should borrow")),
            );
        }
        assert!(
            matches!(
                limiter.try_acquire(&"batch").await,
                Err(Rejected::PartitionExhausted)
            ),
            "batch is over its share and the total is spent"
        );

        // Live still gets its guaranteed share.
        let mut live_tokens = Vec::new();
        for n in 0..7 {
            live_tokens.push(
                limiter
                    .try_acquire(&"live")
                    .await
                    .unwrap_or_else(|_| panic!("live acquire {n} is guaranteed")),
            );
        }
        assert!(matches!(
            limiter.try_acquire(&"live").await,
            Err(Rejected::PartitionExhausted)
        ));

        assert_eq!(
            limiter.state().in_flight(),
            17,
            "guarantees overshoot the total by design"
        );
    }

    #[tokio::test]
    async fn unresolved_contexts_use_the_total_only() {
        let limiter: PartitionedLimiter<Settable, &'static str> =
            PartitionedLimiter::new_with_context(Settable::new(2), vec![("known", 1.0)], |_| None)
                .unwrap();

        let _first = limiter.try_acquire(&"anything").await.unwrap();
        let _second = limiter.try_acquire(&"anything").await.unwrap();

        assert!(matches!(
            limiter.try_acquire(&"anything").await,
            Err(Rejected::LimitReached)
        ));
    }

    #[tokio::test]
    async fn every_partition_gets_at_least_one_slot() {
        let limiter = by_name(Settable::new(1), vec![("a", 0.5), ("b", 0.5)]);

        assert_eq!(limiter.partition("a").unwrap().limit(), 1);
        assert_eq!(limiter.partition("b").unwrap().limit(), 1);

        let _a = limiter.try_acquire(&"a").await.unwrap();
        let _b = limiter.try_acquire(&"b").await.unwrap();
    }

    #[tokio::test]
    async fn release_feeds_the_algorithm() {
        let limiter = by_name(Aimd::new_with_initial_limit(2), vec![("all", 1.0)]);

        let _first = limiter.try_acquire(&"all").await.unwrap();
        let second = limiter.try_acquire(&"all").await.unwrap();

        let new_limit = limiter.release(second, Some(Outcome::Success)).await;

        assert_eq!(new_limit, 3);
        assert_eq!(
            limiter.partition("all").unwrap().limit(),
            3,
            "share resized on change"
        );
        assert_eq!(limiter.partition("all").unwrap().in_flight(), 1);
    }

    #[test]
    fn validates_percent_sum() {
        let result = PartitionedLimiter::<_, ()>::new_with_context(
            Settable::new(10),
            vec![("a", 0.6), ("b", 0.6)],
            |_| None,
        );

        assert!(matches!(
            result,
            Err(ConfigError::PartitionPercentsExceedTotal(_))
        ));
    }

    #[test]
    fn validates_percent_range() {
        let result = PartitionedLimiter::<_, ()>::new_with_context(
            Settable::new(10),
            vec![("a", 1.5)],
            |_| None,
        );

        assert!(matches!(result, Err(ConfigError::PercentOutOfRange(_))));
    }

    #[test]
    fn rejects_duplicate_names() {
        let result = PartitionedLimiter::<_, ()>::new_with_context(
            Settable::new(10),
            vec![("a", 0.2), ("a", 0.2)],
            |_| None,
        );

        assert!(matches!(result, Err(ConfigError::DuplicatePartition(_))));
    }
}
