//! Adaptive concurrency limits for protecting services from overload.
//!
//! Bounds the number of in-flight jobs and continuously re-estimates that
//! bound from observed latencies and load-based errors, the way TCP
//! congestion control estimates a window from round-trip times and loss.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod aggregation;
mod bulkhead;
mod limiter;
pub mod limits;
pub mod measurements;
pub mod metrics;

pub use bulkhead::{Bulkhead, BulkheadError, KeyedBulkhead};
pub use limiter::{
    BlockingLimiter, DefaultLimiter, LifoBlockingLimiter, Limiter, LimiterState, Outcome,
    Partition, PartitionedLimiter, Rejected, Token,
};

/// Invalid configuration, rejected at construction time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Percentiles must be strictly between 0 and 1.
    #[error("percentile must be in (0, 1), got {0}")]
    PercentileOutOfRange(f64),

    /// Each partition percent must be within `[0, 1]`.
    #[error("partition percent must be in [0, 1], got {0}")]
    PercentOutOfRange(f64),

    /// Partition percents must sum to at most 1.0.
    #[error("partition percents must sum to <= 1.0, got {0}")]
    PartitionPercentsExceedTotal(f64),

    /// Partition names must be unique.
    #[error("duplicate partition name: {0}")]
    DuplicatePartition(String),
}
