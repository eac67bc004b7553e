use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{ChangeNotifier, LimitAlgorithm, Sample};

/// A simple, fixed concurrency limit.
#[derive(Debug)]
pub struct Fixed(usize);

impl Fixed {
    #[allow(missing_docs)]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);

        Self(limit)
    }
}

#[async_trait]
impl LimitAlgorithm for Fixed {
    fn limit(&self) -> usize {
        self.0
    }

    async fn update(&self, _sample: Sample) -> usize {
        self.0
    }

    fn notify_on_change(&self, _listener: Box<dyn Fn(usize) + Send + Sync>) {
        // The limit never changes.
    }
}

/// A concurrency limit controlled externally through
/// [`set_limit`](Settable::set_limit), e.g. from a config source.
///
/// Samples are ignored.
#[derive(Debug)]
pub struct Settable {
    limit: AtomicUsize,
    notifier: ChangeNotifier,
}

impl Settable {
    #[allow(missing_docs)]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);

        Self {
            limit: AtomicUsize::new(limit),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Replace the limit, notifying any change listeners.
    pub fn set_limit(&self, limit: usize) {
        assert!(limit > 0);

        let old_limit = self.limit.swap(limit, Ordering::SeqCst);
        self.notifier.notify_if_changed(old_limit, limit);
    }
}

#[async_trait]
impl LimitAlgorithm for Settable {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn update(&self, _sample: Sample) -> usize {
        self.limit()
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.notifier.subscribe(listener);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::Outcome;

    use super::*;

    #[tokio::test]
    async fn fixed_ignores_samples() {
        let fixed = Fixed::new(10);

        let limit = fixed
            .update(Sample::new(Duration::from_millis(5), 10, Outcome::Overload))
            .await;

        assert_eq!(limit, 10);
    }

    #[tokio::test]
    async fn settable_notifies_on_change() {
        let settable = Settable::new(10);
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_by_listener = seen.clone();
        settable.notify_on_change(Box::new(move |limit| {
            seen_by_listener.store(limit, Ordering::SeqCst);
        }));

        settable.set_limit(10);
        assert_eq!(seen.load(Ordering::SeqCst), 0, "same value, no event");

        settable.set_limit(25);
        assert_eq!(settable.limit(), 25);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
    }
}
