//! Algorithms for controlling concurrency limits.

mod aimd;
mod defaults;
mod fixed;
pub mod functions;
mod gradient2;
mod vegas;
mod windowed;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::Outcome;

pub use aimd::Aimd;
pub use fixed::{Fixed, Settable};
pub use gradient2::Gradient2;
pub use vegas::Vegas;
pub use windowed::Windowed;

/// An algorithm for controlling a concurrency limit.
///
/// [`update`](LimitAlgorithm::update) calls are serialized: an algorithm sees
/// samples one at a time, in submission order.
#[async_trait]
pub trait LimitAlgorithm: Send + Sync {
    /// The current limit.
    fn limit(&self) -> usize;

    /// Update the concurrency limit in response to a new job completion.
    async fn update(&self, sample: Sample) -> usize;

    /// Register a listener called with the new limit whenever the integer
    /// limit changes.
    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>);
}

/// Shared limit algorithms stay usable as algorithms, e.g. so a caller can
/// keep hold of a [`Settable`] handed to a limiter.
#[async_trait]
impl<L: LimitAlgorithm + ?Sized> LimitAlgorithm for Arc<L> {
    fn limit(&self) -> usize {
        (**self).limit()
    }

    async fn update(&self, sample: Sample) -> usize {
        (**self).update(sample).await
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        (**self).notify_on_change(listener);
    }
}

/// The result of a job, including the [Outcome] (loss) and latency (delay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Jobs in flight when the job was admitted.
    pub(crate) in_flight: usize,
    pub(crate) outcome: Outcome,
}

impl Sample {
    pub(crate) fn new(latency: Duration, in_flight: usize, outcome: Outcome) -> Self {
        Self {
            latency,
            in_flight,
            outcome,
        }
    }

    /// The job's latency, from admission to completion.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Jobs in flight when the job was admitted.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[allow(missing_docs)]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub(crate) fn did_drop(&self) -> bool {
        self.outcome == Outcome::Overload
    }
}

type ChangeFn = dyn Fn(usize) + Send + Sync;

/// Broadcasts limit changes to registered listeners.
///
/// Changes are rare (at most once per sample or sampling window), so
/// listeners are snapshotted copy-on-write rather than visited under a held
/// lock.
#[derive(Default)]
pub(crate) struct ChangeNotifier {
    listeners: RwLock<Vec<Arc<ChangeFn>>>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, listener: Box<ChangeFn>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener.into());
    }

    /// Notify listeners iff the integer limit actually changed.
    pub(crate) fn notify_if_changed(&self, old_limit: usize, new_limit: usize) {
        if old_limit == new_limit {
            return;
        }
        tracing::debug!(old_limit, new_limit, "limit changed");

        let snapshot = self
            .listeners
            .read()
            .expect("listener lock poisoned")
            .clone();
        for listener in snapshot {
            listener(new_limit);
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or(0);
        f.debug_struct("ChangeNotifier")
            .field("listeners", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn notifier_fires_only_on_change() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_by_listener = seen.clone();
        notifier.subscribe(Box::new(move |limit| {
            seen_by_listener.store(limit, Ordering::SeqCst);
        }));

        notifier.notify_if_changed(10, 10);
        assert_eq!(seen.load(Ordering::SeqCst), 0, "no change, no event");

        notifier.notify_if_changed(10, 12);
        assert_eq!(seen.load(Ordering::SeqCst), 12);
    }
}
