use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use super::{Limiter, LimiterState, Outcome, Rejected, Token};

/// A wrapper which makes acquisition wait for capacity.
///
/// [`acquire`](BlockingLimiter::acquire) suspends the caller until a token is
/// available, woken by releases and by limit increases. Waiters race for
/// freed capacity with no ordering guarantee; use
/// [`LifoBlockingLimiter`] when ordering matters.
pub struct BlockingLimiter<L> {
    inner: L,
    released: Arc<Notify>,
}

impl<L> BlockingLimiter<L> {
    #[allow(missing_docs)]
    pub fn new<C>(inner: L) -> Self
    where
        L: Limiter<C>,
        C: Send + Sync,
    {
        let released = Arc::new(Notify::new());

        // Externally driven limit increases (e.g. Settable) free capacity
        // without any release happening.
        let on_change = Arc::clone(&released);
        inner.notify_on_change(Box::new(move |_limit| on_change.notify_waiters()));

        Self { inner, released }
    }

    /// Wait until a token is available.
    pub async fn acquire<C>(&self, ctx: &C) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        self.wait_for_token(ctx).await
    }

    /// Wait until a token is available or the timeout expires.
    pub async fn acquire_timeout<C>(&self, ctx: &C, duration: Duration) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        match timeout(duration, self.wait_for_token(ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Rejected::Timeout),
        }
    }

    async fn wait_for_token<C>(&self, ctx: &C) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        loop {
            // Register interest before checking, so a release between the
            // check and the await is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.try_acquire(ctx).await {
                Ok(token) => return Ok(token),
                Err(Rejected::LimitReached | Rejected::PartitionExhausted) => {}
                Err(other) => return Err(other),
            }

            notified.await;
        }
    }
}

#[async_trait]
impl<L, C> Limiter<C> for BlockingLimiter<L>
where
    L: Limiter<C>,
    C: Send + Sync,
{
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected> {
        self.inner.try_acquire(ctx).await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        let limit = self.inner.release(token, outcome).await;
        self.released.notify_waiters();
        limit
    }

    fn limit(&self) -> usize {
        self.inner.limit()
    }

    fn state(&self) -> LimiterState {
        self.inner.state()
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.inner.notify_on_change(listener);
    }
}

/// A blocking wrapper which serves waiters newest-first.
///
/// The most recent caller is the most likely to still have a client waiting
/// on the other end, so under sustained overload it is the one worth
/// serving; the oldest waiters time out instead. Waiters beyond the backlog
/// size are rejected immediately.
pub struct LifoBlockingLimiter<L> {
    inner: L,
    waiters: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
    backlog_limit: usize,
    backlog_timeout: Duration,
}

impl<L> LifoBlockingLimiter<L> {
    const DEFAULT_BACKLOG: usize = 100;
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    #[allow(missing_docs)]
    pub fn new<C>(inner: L) -> Self
    where
        L: Limiter<C>,
        C: Send + Sync,
    {
        let waiters: Arc<Mutex<Vec<oneshot::Sender<()>>>> = Arc::default();

        let on_change = Arc::clone(&waiters);
        inner.notify_on_change(Box::new(move |_limit| wake_newest(&on_change)));

        Self {
            inner,
            waiters,
            backlog_limit: Self::DEFAULT_BACKLOG,
            backlog_timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Maximum number of queued waiters before immediate rejection.
    pub fn with_backlog(mut self, size: usize) -> Self {
        assert!(size > 0);
        self.backlog_limit = size;
        self
    }

    /// How long [`acquire`](Self::acquire) waits before giving up.
    pub fn with_backlog_timeout(mut self, duration: Duration) -> Self {
        self.backlog_timeout = duration;
        self
    }

    /// Wait for a token, up to the configured backlog timeout.
    pub async fn acquire<C>(&self, ctx: &C) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        self.acquire_timeout(ctx, self.backlog_timeout).await
    }

    /// Wait for a token, up to the given timeout.
    pub async fn acquire_timeout<C>(&self, ctx: &C, duration: Duration) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        if let Ok(token) = self.inner.try_acquire(ctx).await {
            return Ok(token);
        }

        match timeout(duration, self.wait_for_token(ctx)).await {
            Ok(result) => result,
            // The dangling waiter slot is pruned lazily.
            Err(_elapsed) => Err(Rejected::Timeout),
        }
    }

    async fn wait_for_token<C>(&self, ctx: &C) -> Result<Token, Rejected>
    where
        L: Limiter<C>,
    {
        loop {
            let receiver = {
                let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
                waiters.retain(|waiter| !waiter.is_closed());
                if waiters.len() >= self.backlog_limit {
                    return Err(Rejected::QueueFull);
                }
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                receiver
            };

            // A release may have slipped in between the failed attempt and
            // registration.
            if let Ok(token) = self.inner.try_acquire(ctx).await {
                return Ok(token);
            }

            if receiver.await.is_ok() {
                if let Ok(token) = self.inner.try_acquire(ctx).await {
                    return Ok(token);
                }
                // Lost the freed capacity to a non-waiting acquirer; queue up
                // again at the top of the stack.
            }
        }
    }
}

fn wake_newest(waiters: &Mutex<Vec<oneshot::Sender<()>>>) {
    let mut waiters = waiters.lock().expect("waiter lock poisoned");
    while let Some(waiter) = waiters.pop() {
        if waiter.send(()).is_ok() {
            break;
        }
    }
}

#[async_trait]
impl<L, C> Limiter<C> for LifoBlockingLimiter<L>
where
    L: Limiter<C>,
    C: Send + Sync,
{
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected> {
        self.inner.try_acquire(ctx).await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        let limit = self.inner.release(token, outcome).await;
        wake_newest(&self.waiters);
        limit
    }

    fn limit(&self) -> usize {
        self.inner.limit()
    }

    fn state(&self) -> LimiterState {
        self.inner.state()
    }

    fn notify_on_change(&self, listener: Box<dyn Fn(usize) + Send + Sync>) {
        self.inner.notify_on_change(listener);
    }
}
