use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{Limiter, LimiterState, Outcome, Rejected, Token};

use super::{Bulkhead, BulkheadError};

/// A set of bulkheads keyed by a small closed set of context values (usually
/// an enum), all sharing one limiter.
///
/// Tasks with equal keys start in enqueue order; tasks with different keys
/// may interleave. Combine with a
/// [`PartitionedLimiter`](crate::PartitionedLimiter) resolving on the same
/// keys to also give each key a guaranteed share of the capacity.
pub struct KeyedBulkhead<K, E> {
    bulkheads: HashMap<K, Arc<Bulkhead<K, E>>>,
}

impl<K, E> KeyedBulkhead<K, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// One bulkhead per key, with default settings.
    pub fn new(limiter: Arc<dyn Limiter<K>>, keys: impl IntoIterator<Item = K>) -> Self {
        Self::new_with(limiter, keys, |bulkhead| bulkhead)
    }

    /// One bulkhead per key, each passed through `configure`.
    pub fn new_with(
        limiter: Arc<dyn Limiter<K>>,
        keys: impl IntoIterator<Item = K>,
        configure: impl Fn(Bulkhead<K, E>) -> Bulkhead<K, E>,
    ) -> Self {
        // Capacity freed by one key's completion must also restart the other
        // keys' drain loops, so releases are observed through a shared hook.
        let shared = Arc::new(SharedRelease {
            inner: limiter,
            on_release: RwLock::new(Vec::new()),
        });

        let bulkheads: HashMap<K, Arc<Bulkhead<K, E>>> = keys
            .into_iter()
            .map(|key| {
                let limiter = Arc::clone(&shared) as Arc<dyn Limiter<K>>;
                let bulkhead = configure(Bulkhead::new_with_context(limiter, key.clone()));
                (key, Arc::new(bulkhead))
            })
            .collect();

        let hooks = bulkheads
            .values()
            .map(|bulkhead| {
                let bulkhead = Arc::clone(bulkhead);
                Box::new(move || {
                    if bulkhead.has_backlog() {
                        let bulkhead = Arc::clone(&bulkhead);
                        tokio::spawn(async move { bulkhead.drain().await });
                    }
                }) as Box<dyn Fn() + Send + Sync>
            })
            .collect();
        *shared
            .on_release
            .write()
            .expect("release hook lock poisoned") = hooks;

        Self { bulkheads }
    }

    /// Submit a task under the given key.
    ///
    /// Panics if the key was not part of the construction set.
    pub async fn execute<T, F, Fut>(&self, key: &K, work: F) -> Result<T, BulkheadError<E>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let bulkhead = self
            .bulkheads
            .get(key)
            .expect("key should be part of the bulkhead's construction set");
        bulkhead.execute(work).await
    }
}

/// Fans a limiter's releases out to interested drain loops.
struct SharedRelease<C> {
    inner: Arc<dyn Limiter<C>>,
    on_release: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
}

#[async_trait]
impl<C: Send + Sync> Limiter<C> for SharedRelease<C> {
    async fn try_acquire(&self, ctx: &C) -> Result<Token, Rejected> {
        self.inner.try_acquire(ctx).await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        let limit = self.inner.release(token, outcome).await;
        for hook in self
            .on_release
            .read()
            .expect("release hook lock poisoned")
            .iter()
        {
            hook();
        }
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

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::limits::Fixed;
    use crate::DefaultLimiter;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Lane {
        Interactive,
        Batch,
    }

    fn keyed(limit: usize) -> Arc<KeyedBulkhead<Lane, &'static str>> {
        let limiter: Arc<dyn Limiter<Lane>> =
            Arc::new(DefaultLimiter::<_, Lane>::new_with_context(Fixed::new(limit)));
        Arc::new(KeyedBulkhead::new(
            limiter,
            [Lane::Interactive, Lane::Batch],
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_interleave() {
        let keyed = keyed(2);
        let gate = Arc::new(Notify::new());

        let blocked = {
            let keyed = Arc::clone(&keyed);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                keyed
                    .execute(&Lane::Interactive, move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let batch = keyed
            .execute(&Lane::Batch, || async { Ok::<_, &'static str>(42) })
            .await;
        assert_eq!(batch.unwrap(), 42, "batch runs while interactive is busy");
        assert!(!blocked.is_finished());

        gate.notify_one();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn equal_keys_start_in_enqueue_order() {
        let keyed = keyed(1);
        let gate = Arc::new(Notify::new());
        let starts = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let keyed = Arc::clone(&keyed);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                keyed
                    .execute(&Lane::Interactive, move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut queued = Vec::new();
        for i in 1..=3 {
            let keyed = Arc::clone(&keyed);
            let starts = Arc::clone(&starts);
            queued.push(tokio::spawn(async move {
                keyed
                    .execute(&Lane::Interactive, move || async move {
                        starts.lock().unwrap().push(i);
                        Ok::<_, &'static str>(i)
                    })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.notify_one();
        first.await.unwrap().unwrap();
        for handle in queued {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*starts.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_freed_by_one_key_reaches_the_others() {
        let keyed = keyed(1);
        let gate = Arc::new(Notify::new());

        let interactive = {
            let keyed = Arc::clone(&keyed);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                keyed
                    .execute(&Lane::Interactive, move || async move {
                        gate.notified().await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Queued on the batch lane with no capacity anywhere.
        let batch = {
            let keyed = Arc::clone(&keyed);
            tokio::spawn(async move {
                keyed
                    .execute(&Lane::Batch, || async { Ok::<_, &'static str>(7) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!batch.is_finished(), "no capacity for the batch lane yet");

        gate.notify_one();
        interactive.await.unwrap().unwrap();

        assert_eq!(
            batch.await.unwrap().unwrap(),
            7,
            "the interactive release must drain the batch lane"
        );
    }
}
