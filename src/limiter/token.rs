use std::sync::{
    atomic::{self, AtomicUsize},
    Arc,
};

#[cfg(test)]
use std::time::Duration;

use tokio::time::Instant;

/// A concurrency token, required to run a job.
///
/// Release the token back to the [Limiter](crate::Limiter) with the job's
/// outcome after the job is complete. Dropping a token without releasing it
/// frees the capacity but feeds nothing to the limit algorithm.
///
/// A token is a single-use capability: releasing consumes it, so an outcome
/// can be delivered at most once.
#[derive(Debug)]
pub struct Token {
    inner: Option<TokenInner>,

    in_flight_at_acquire: usize,
    start: Instant,
    #[cfg(test)]
    latency: Duration,
}

/// Owns one unit of each attached in-flight counter, paying them back on
/// drop. The counters are incremented by the limiter during admission.
#[derive(Debug)]
struct TokenInner {
    in_flight: Arc<AtomicUsize>,
    partition_in_flight: Option<Arc<AtomicUsize>>,
}

impl Token {
    pub(crate) fn new(in_flight: Arc<AtomicUsize>, in_flight_at_acquire: usize) -> Self {
        Self {
            inner: Some(TokenInner {
                in_flight,
                partition_in_flight: None,
            }),
            in_flight_at_acquire,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    /// A token which holds no capacity; it satisfies a bypassed acquisition
    /// and its release is a no-op.
    pub(crate) fn bypassed() -> Self {
        Self {
            inner: None,
            in_flight_at_acquire: 0,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    /// Attach one unit of a partition's in-flight counter.
    pub(crate) fn for_partition(mut self, partition_in_flight: Arc<AtomicUsize>) -> Self {
        if let Some(inner) = &mut self.inner {
            inner.partition_in_flight = Some(partition_in_flight);
        }
        self
    }

    pub(crate) fn is_bypassed(&self) -> bool {
        self.inner.is_none()
    }

    /// Jobs in flight at the moment this token was issued, including the
    /// token's own job.
    pub(crate) fn in_flight_at_acquire(&self) -> usize {
        self.in_flight_at_acquire
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&mut self, latency: Duration) {
        use std::ops::Sub;

        self.start = Instant::now().sub(latency);
        self.latency = latency;
    }

    #[cfg(test)]
    pub(crate) fn latency(&self) -> Duration {
        self.latency
    }

    #[cfg(not(test))]
    pub(crate) fn latency(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
        if let Some(partition_in_flight) = &self.partition_in_flight {
            partition_in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
        }
    }
}
