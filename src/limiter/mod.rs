//! Limiters: the admission gate in front of a limit algorithm.

mod blocking;
mod default;
mod partitioned;
mod token;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

pub use blocking::{BlockingLimiter, LifoBlockingLimiter};
pub use default::DefaultLimiter;
pub use partitioned::{Partition, PartitionedLimiter};
pub use token::Token;

/// Whether a job succeeded or failed because of load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job completed normally.
    Success,

    /// The job failed in a way indicative of overload, e.g. a timeout or a
    /// load-based rejection.
    Overload,
}

/// Why an acquisition was refused.
///
/// Rejections are normal outcomes under load, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    /// The concurrency limit is fully in use.
    #[error("concurrency limit reached")]
    LimitReached,

    /// Both the total limit and the caller's partition are fully in use.
    #[error("partition and total limits reached")]
    PartitionExhausted,

    /// The waiter backlog is full.
    #[error("waiter backlog full")]
    QueueFull,

    /// Timed out waiting for capacity.
    #[error("timed out waiting for capacity")]
    Timeout,
}

/// A point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    limit: usize,
    in_flight: usize,
}

impl LimiterState {
    pub(crate) fn new(limit: usize, in_flight: usize) -> Self {
        Self { limit, in_flight }
    }

    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The number of jobs currently admitted.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Remaining capacity.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight)
    }
}

/// An admission gate bounding the number of concurrent jobs.
///
/// A successful acquisition returns a [Token]; release it with the job's
/// [Outcome] (or `None` when the job's latency is not meaningful) so the
/// underlying [limit algorithm](crate::limits::LimitAlgorithm) can adapt.
///
/// The context type `C` is opaque to the limiter core; it is consulted only
/// by bypass predicates and partition resolvers.
#[async_trait]
pub trait Limiter<C = ()>: Send + Sync {
    /// Try to acquire a concurrency token, without waiting.
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected>;

    /// Return a token, feeding the job's result to the limit algorithm.
    ///
    /// `None` releases the capacity without influencing the algorithm.
    ///
    /// Returns the (possibly updated) limit.
    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize;

    /// The current concurrency limit.
    fn limit(&self) -> usize;

    /// A snapshot of the current limit and in-flight count.
    fn state(&self) -> LimiterState;

    /// Register a listener called whenever the limit changes.
    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>);
}

/// Synthesizes default limiter names: `limiter-0`, `limiter-1`, ...
pub(crate) fn next_limiter_name() -> String {
    static NAMES: AtomicUsize = AtomicUsize::new(0);
    format!("limiter-{}", NAMES.fetch_add(1, Ordering::Relaxed))
}
