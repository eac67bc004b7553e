//! Bulkheads: buffered, non-blocking admission in front of a limiter.

mod keyed;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tokio::sync::oneshot;

use crate::{Limiter, Outcome, Token};

pub use keyed::KeyedBulkhead;

/// Why a bulkhead task's completion failed.
#[derive(Debug, thiserror::Error)]
pub enum BulkheadError<E> {
    /// The backlog was full (or, with a zero-size backlog, no capacity was
    /// immediately available).
    #[error("bulkhead backlog full, task rejected")]
    Rejected,

    /// The task was cancelled before it completed.
    #[error("bulkhead task cancelled")]
    Cancelled,

    /// The task ran and failed with its own error.
    #[error("bulkhead task failed")]
    Job(E),
}

enum Backlog {
    Bounded(usize),
    Unbounded,
}

type TaskFuture = Pin<Box<dyn Future<Output = Option<Outcome>> + Send>>;
type QueuedWork = Box<dyn FnOnce() -> TaskFuture + Send>;

/// A non-blocking frontend which buffers asynchronous tasks and dispatches
/// them under a limiter's capacity.
///
/// Tasks are accepted into a bounded backlog and started in enqueue order as
/// tokens become available; the enqueuing caller is never suspended beyond
/// awaiting its own task's completion. Each dispatched task is bound to the
/// token that admitted it: completion releases the token with an outcome
/// derived from the task's result via the error classifier.
///
/// All tasks share one fixed context value; `C = ()` gives a plain FIFO
/// bulkhead whose tasks may run in parallel. Use [`KeyedBulkhead`] for
/// per-key FIFO ordering.
///
/// Construct, configure, then wrap in an [`Arc`]:
///
/// ```ignore
/// let bulkhead = Arc::new(Bulkhead::new(limiter).with_backlog(64));
/// ```
pub struct Bulkhead<C, E> {
    context: C,
    limiter: Arc<dyn Limiter<C>>,

    backlog: Mutex<VecDeque<QueuedWork>>,
    capacity: Backlog,

    classifier: Arc<dyn Fn(&E) -> Option<Outcome> + Send + Sync>,

    max_dispatch_per_call: usize,
    draining: AtomicBool,
}

impl<E: Send + 'static> Bulkhead<(), E> {
    /// A bulkhead with a context type of `()`.
    pub fn new(limiter: Arc<dyn Limiter<()>>) -> Self {
        Self::new_with_context(limiter, ())
    }
}

impl<C, E> Bulkhead<C, E>
where
    C: Send + Sync + 'static,
    E: Send + 'static,
{
    const DEFAULT_BACKLOG: usize = 100;
    const DEFAULT_MAX_DISPATCH: usize = 128;

    /// A bulkhead pinned to one context value, shared by all of its tasks.
    pub fn new_with_context(limiter: Arc<dyn Limiter<C>>, context: C) -> Self {
        Self {
            context,
            limiter,
            backlog: Mutex::new(VecDeque::new()),
            capacity: Backlog::Bounded(Self::DEFAULT_BACKLOG),
            classifier: Arc::new(|_| None),
            max_dispatch_per_call: Self::DEFAULT_MAX_DISPATCH,
            draining: AtomicBool::new(false),
        }
    }

    /// Maximum number of queued tasks.
    ///
    /// A size of zero means synchronous handoff: tasks are rejected unless a
    /// token is immediately available.
    pub fn with_backlog(mut self, size: usize) -> Self {
        self.capacity = Backlog::Bounded(size);
        self
    }

    /// Queue without bound. Prefer a bounded backlog; an unbounded one turns
    /// overload into unbounded memory growth and latency.
    pub fn with_unbounded_backlog(mut self) -> Self {
        self.capacity = Backlog::Unbounded;
        self
    }

    /// Classify task errors into limiter outcomes.
    ///
    /// `Some(Outcome::Overload)` feeds the algorithm's backoff,
    /// `Some(Outcome::Success)` counts the latency as a healthy sample and
    /// `None` releases the token without sampling. The default classifier
    /// ignores all errors.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&E) -> Option<Outcome> + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Bound on tasks dispatched per drain pass.
    pub fn with_max_dispatch_per_call(mut self, max: usize) -> Self {
        assert!(max > 0);
        self.max_dispatch_per_call = max;
        self
    }

    /// Submit a task.
    ///
    /// The returned future resolves when the task completes, fails, is
    /// rejected by the backlog, or is cancelled. Dropping the future before
    /// the task is dispatched cancels it; a token reserved for a cancelled
    /// task is released without a sample.
    pub async fn execute<T, F, Fut>(self: &Arc<Self>, work: F) -> Result<T, BulkheadError<E>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel::<Result<T, E>>();
        let classifier = Arc::clone(&self.classifier);

        let job: QueuedWork = Box::new(move || {
            if sender.is_closed() {
                // Cancelled while queued; nothing to run.
                return Box::pin(std::future::ready(None)) as TaskFuture;
            }
            Box::pin(async move {
                let result = work().await;
                let outcome = match &result {
                    Ok(_) => Some(Outcome::Success),
                    Err(error) => classify(classifier.as_ref(), error),
                };
                let _ = sender.send(result);
                outcome
            })
        });

        match self.capacity {
            Backlog::Bounded(0) => {
                // Synchronous handoff.
                let Ok(token) = self.limiter.try_acquire(&self.context).await else {
                    return Err(BulkheadError::Rejected);
                };
                self.dispatch(job, token);
            }
            Backlog::Bounded(capacity) => {
                {
                    let mut backlog = self.backlog.lock().expect("backlog lock poisoned");
                    if backlog.len() >= capacity {
                        return Err(BulkheadError::Rejected);
                    }
                    backlog.push_back(job);
                }
                self.drain().await;
            }
            Backlog::Unbounded => {
                self.backlog
                    .lock()
                    .expect("backlog lock poisoned")
                    .push_back(job);
                self.drain().await;
            }
        }

        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(BulkheadError::Job(error)),
            Err(_recv) => Err(BulkheadError::Cancelled),
        }
    }

    fn has_backlog(&self) -> bool {
        !self.backlog.lock().expect("backlog lock poisoned").is_empty()
    }

    /// Pump the backlog while tokens are available.
    ///
    /// A single drainer is elected via the `draining` flag; losers return
    /// immediately. After finishing, the winner re-checks the backlog so
    /// tasks enqueued during the handover are not stranded.
    async fn drain(self: &Arc<Self>) {
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }

            let mut dispatched = 0;
            let mut out_of_tokens = false;

            while dispatched < self.max_dispatch_per_call {
                if self.backlog.lock().expect("backlog lock poisoned").is_empty() {
                    break;
                }

                let token = match self.limiter.try_acquire(&self.context).await {
                    Ok(token) => token,
                    Err(_) => {
                        out_of_tokens = true;
                        break;
                    }
                };

                let job = self
                    .backlog
                    .lock()
                    .expect("backlog lock poisoned")
                    .pop_front();
                match job {
                    Some(job) => {
                        self.dispatch(job, token);
                        dispatched += 1;
                    }
                    None => {
                        // Lost the job to a racing drainer.
                        self.limiter.release(token, None).await;
                        break;
                    }
                }
            }

            if dispatched > 0 {
                tracing::trace!(dispatched, "bulkhead drained");
            }

            self.draining.store(false, Ordering::SeqCst);

            let backlog_remaining =
                !self.backlog.lock().expect("backlog lock poisoned").is_empty();
            if out_of_tokens || !backlog_remaining {
                return;
            }
        }
    }

    /// Run a job bound to its token; completion releases the token and kicks
    /// the drain loop to refill the freed capacity.
    fn dispatch(self: &Arc<Self>, job: QueuedWork, token: Token) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Run the job on its own task so a panic is contained and the
            // token still comes back.
            let worker = tokio::spawn(job());
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    tracing::warn!(%join_error, "bulkhead task panicked");
                    None
                }
            };
            this.limiter.release(token, outcome).await;
            this.drain().await;
        });
    }
}

/// A panicking classifier must not leak the token's sample; treat the error
/// as ignored.
fn classify<E>(classifier: &(dyn Fn(&E) -> Option<Outcome> + Send + Sync), error: &E) -> Option<Outcome> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| classifier(error))).unwrap_or_else(
        |_| {
            tracing::warn!("bulkhead error classifier panicked");
            None
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::limits::{Aimd, Fixed};
    use crate::DefaultLimiter;

    use super::*;

    type TestBulkhead = Bulkhead<(), &'static str>;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_backlog_rejects_new_tasks() {
        let limiter = Arc::new(DefaultLimiter::new(Fixed::new(1)));
        let bulkhead: Arc<TestBulkhead> = Arc::new(Bulkhead::new(limiter).with_backlog(1));

        let gate = Arc::new(Notify::new());

        let first = {
            let bulkhead = Arc::clone(&bulkhead);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(1)
                    })
                    .await
            })
        };
        settle().await;

        let second = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.execute(|| async { Ok::<_, &'static str>(2) }).await })
        };
        settle().await;

        let third = bulkhead.execute(|| async { Ok::<_, &'static str>(3) }).await;
        assert!(
            matches!(third, Err(BulkheadError::Rejected)),
            "one running, one queued, the third overflows"
        );

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(
            second.await.unwrap().unwrap(),
            2,
            "queued task dispatches once capacity frees up"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_backlog_hands_off_synchronously() {
        let limiter = Arc::new(DefaultLimiter::new(Fixed::new(1)));
        let bulkhead: Arc<TestBulkhead> = Arc::new(Bulkhead::new(limiter).with_backlog(0));

        let gate = Arc::new(Notify::new());

        let first = {
            let bulkhead = Arc::clone(&bulkhead);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(1)
                    })
                    .await
            })
        };
        settle().await;

        let rejected = bulkhead.execute(|| async { Ok::<_, &'static str>(2) }).await;
        assert!(matches!(rejected, Err(BulkheadError::Rejected)));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        settle().await;

        let accepted = bulkhead.execute(|| async { Ok::<_, &'static str>(3) }).await;
        assert_eq!(accepted.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_tasks_never_exceed_the_limit() {
        let limiter = Arc::new(DefaultLimiter::new(Fixed::new(3)));
        let bulkhead: Arc<TestBulkhead> =
            Arc::new(Bulkhead::new(limiter).with_unbounded_backlog());

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut completions = Vec::new();
        for _ in 0..20 {
            let bulkhead = Arc::clone(&bulkhead);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            completions.push(tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, &'static str>(())
                    })
                    .await
            }));
        }
        for completion in completions {
            completion.await.unwrap().unwrap();
        }

        assert!(
            peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency {} exceeded the limit",
            peak.load(Ordering::SeqCst)
        );
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn classified_failures_feed_the_limiter() {
        let limiter = Arc::new(DefaultLimiter::new(Aimd::new_with_initial_limit(10)));
        let bulkhead: Arc<TestBulkhead> = Arc::new(
            Bulkhead::new(Arc::clone(&limiter) as Arc<dyn Limiter<()>>).with_classifier(
                |error| {
                    if *error == "unavailable" {
                        Some(Outcome::Overload)
                    } else {
                        None
                    }
                },
            ),
        );

        let result = bulkhead
            .execute(|| async { Err::<(), _>("unavailable") })
            .await;
        assert!(matches!(result, Err(BulkheadError::Job("unavailable"))));

        settle().await;
        assert_eq!(limiter.limit(), 9, "overload classification backs off");

        let result = bulkhead
            .execute(|| async { Err::<(), _>("bad request") })
            .await;
        assert!(matches!(result, Err(BulkheadError::Job("bad request"))));

        settle().await;
        assert_eq!(limiter.limit(), 9, "unclassified errors are ignored");
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_classifier_is_treated_as_ignore() {
        let limiter = Arc::new(DefaultLimiter::new(Aimd::new_with_initial_limit(10)));
        let bulkhead: Arc<TestBulkhead> = Arc::new(
            Bulkhead::new(Arc::clone(&limiter) as Arc<dyn Limiter<()>>)
                .with_classifier(|_| panic!("boom")),
        );

        let result = bulkhead.execute(|| async { Err::<(), _>("oops") }).await;
        assert!(matches!(result, Err(BulkheadError::Job("oops"))));

        settle().await;
        assert_eq!(limiter.limit(), 10);
        assert_eq!(limiter.state().in_flight(), 0, "no leaked capacity");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_release_their_reserved_capacity() {
        let limiter = Arc::new(DefaultLimiter::new(Fixed::new(1)));
        let bulkhead: Arc<TestBulkhead> =
            Arc::new(Bulkhead::new(Arc::clone(&limiter) as Arc<dyn Limiter<()>>).with_backlog(5));

        let gate = Arc::new(Notify::new());

        let first = {
            let bulkhead = Arc::clone(&bulkhead);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(1)
                    })
                    .await
            })
        };
        settle().await;

        let cancelled = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.execute(|| async { Ok::<_, &'static str>(2) }).await })
        };
        settle().await;
        cancelled.abort();
        settle().await;

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        settle().await;

        assert_eq!(limiter.state().in_flight(), 0, "nothing leaked");
        let after = bulkhead.execute(|| async { Ok::<_, &'static str>(3) }).await;
        assert_eq!(after.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_start_in_enqueue_order() {
        let limiter = Arc::new(DefaultLimiter::new(Fixed::new(1)));
        let bulkhead: Arc<TestBulkhead> = Arc::new(Bulkhead::new(limiter).with_backlog(10));

        let gate = Arc::new(Notify::new());
        let starts = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let bulkhead = Arc::clone(&bulkhead);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(0)
                    })
                    .await
            })
        };
        settle().await;

        let mut queued = Vec::new();
        for i in 1..=3 {
            let bulkhead = Arc::clone(&bulkhead);
            let starts = Arc::clone(&starts);
            queued.push(tokio::spawn(async move {
                bulkhead
                    .execute(move || async move {
                        starts.lock().unwrap().push(i);
                        Ok::<_, &'static str>(i)
                    })
                    .await
            }));
            settle().await;
        }

        gate.notify_one();
        first.await.unwrap().unwrap();
        for handle in queued {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*starts.lock().unwrap(), vec![1, 2, 3]);
    }
}
