use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CacheEntry, CacheError, CacheKey, Priority};

type LoadChannel<R> = Shared<oneshot::Receiver<CacheEntry<Arc<R>>>>;

/// A handle through which any number of callers await the outcome of one load.
pub struct LoadHandle<R> {
    channel: LoadChannel<R>,
}

impl<R> Clone for LoadHandle<R> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<R> LoadHandle<R> {
    /// Waits for the load to settle.
    ///
    /// A load that is dropped without producing a result resolves to
    /// [`CacheError::LoadCancelled`].
    pub async fn wait(self) -> CacheEntry<Arc<R>> {
        self.channel
            .await
            .unwrap_or(Err(CacheError::LoadCancelled))
    }
}

/// One pending load, as tracked by the [`InFlightRegistry`].
pub struct LoadingTask<R> {
    id: u64,
    key: CacheKey,
    priority: Priority,
    created_at: Instant,
    handle: LoadHandle<R>,
    cancel: CancellationToken,
}

impl<R> LoadingTask<R> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn cancel(self) {
        self.cancel.cancel();
    }
}

/// The producing side of a freshly registered load.
///
/// Whoever runs the load sends its outcome through [`sender`](Self::sender), stops early once
/// [`cancel`](Self::cancel) fires, and deregisters the task by [`id`](Self::id) when it settles.
pub struct PendingLoad<R> {
    pub id: u64,
    pub sender: oneshot::Sender<CacheEntry<Arc<R>>>,
    pub cancel: CancellationToken,
    pub handle: LoadHandle<R>,
}

/// Coalesces concurrent requests for the same key into a single load.
///
/// The registry itself is plain data; the owner guards it with a lock and must never hold that
/// lock across the load itself.
pub struct InFlightRegistry<R> {
    tasks: HashMap<CacheKey, LoadingTask<R>>,
    next_id: u64,
    max_tasks: usize,
    max_age: Duration,
}

impl<R> fmt::Debug for InFlightRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("tasks", &self.tasks.len())
            .field("max_tasks", &self.max_tasks)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl<R> InFlightRegistry<R> {
    pub fn new(max_tasks: usize, max_age: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            next_id: 0,
            max_tasks: max_tasks.max(1),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &LoadingTask<R>> {
        self.tasks.values()
    }

    /// Returns a handle to the pending load of `key`, if there is one.
    pub fn join(&self, key: &CacheKey) -> Option<LoadHandle<R>> {
        self.tasks.get(key).map(|task| task.handle.clone())
    }

    /// Whether the load with the given `id` is still registered for `key`.
    ///
    /// A load that was cancelled or replaced in the meantime must not publish its result.
    pub fn is_registered(&self, key: &CacheKey, id: u64) -> bool {
        self.tasks.get(key).is_some_and(|task| task.id == id)
    }

    /// Registers a new load for `key`.
    ///
    /// Loads older than the maximum task age are cancelled first. Fails with
    /// [`CacheError::Overloaded`] if the registry is still full afterwards.
    pub fn register(
        &mut self,
        key: CacheKey,
        priority: Priority,
        now: Instant,
    ) -> CacheEntry<PendingLoad<R>> {
        let stale = self.cancel_stale(now);
        if stale > 0 {
            tracing::debug!(stale, "cancelled stale loads");
        }

        if self.tasks.len() >= self.max_tasks {
            return Err(CacheError::Overloaded);
        }

        let (sender, receiver) = oneshot::channel();
        let handle = LoadHandle {
            channel: receiver.shared(),
        };
        let cancel = CancellationToken::new();

        let id = self.next_id;
        self.next_id += 1;

        let task = LoadingTask {
            id,
            key: key.clone(),
            priority,
            created_at: now,
            handle: handle.clone(),
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.tasks.insert(key, task) {
            previous.cancel();
        }

        Ok(PendingLoad {
            id,
            sender,
            cancel,
            handle,
        })
    }

    /// Deregisters the settled load `id` of `key`.
    ///
    /// Returns `false` if the load was no longer registered, e.g. because it was cancelled.
    pub fn complete(&mut self, key: &CacheKey, id: u64) -> bool {
        if !self.is_registered(key, id) {
            return false;
        }
        self.tasks.remove(key).is_some()
    }

    /// Cancels and drops all loads pending for longer than the maximum task age.
    pub fn cancel_stale(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        self.cancel_where(|task| now.saturating_duration_since(task.created_at) > max_age)
    }

    /// Cancels and drops all loads matching `predicate`.
    pub fn cancel_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&LoadingTask<R>) -> bool,
    {
        let victims: Vec<_> = self
            .tasks
            .values()
            .filter(|task| predicate(task))
            .map(|task| task.key.clone())
            .collect();

        for key in &victims {
            if let Some(task) = self.tasks.remove(key) {
                task.cancel();
            }
        }
        victims.len()
    }

    /// Cancels and drops every pending load.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.cancel();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InFlightRegistry<&'static str> {
        InFlightRegistry::new(2, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_join_shares_the_outcome() {
        let mut registry = registry();
        let key = CacheKey::for_testing("a.png");
        let now = Instant::now();

        assert!(registry.join(&key).is_none());
        let pending = registry.register(key.clone(), Priority::Normal, now).unwrap();
        let joined = registry.join(&key).unwrap();
        assert!(registry.is_registered(&key, pending.id));

        pending.sender.send(Ok(Arc::new("a"))).unwrap();
        assert!(registry.complete(&key, pending.id));
        assert!(registry.is_empty());

        let (first, second) = tokio::join!(pending.handle.wait(), joined.wait());
        assert_eq!(*first.unwrap(), "a");
        assert_eq!(*second.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancellation() {
        let mut registry = registry();
        let key = CacheKey::for_testing("a.png");

        let pending = registry
            .register(key.clone(), Priority::Normal, Instant::now())
            .unwrap();
        let handle = registry.join(&key).unwrap();
        drop(pending);

        assert_eq!(handle.wait().await, Err(CacheError::LoadCancelled));
    }

    #[test]
    fn test_overloaded() {
        let mut registry = registry();
        let now = Instant::now();

        let _a = registry
            .register(CacheKey::for_testing("a"), Priority::Normal, now)
            .unwrap();
        let _b = registry
            .register(CacheKey::for_testing("b"), Priority::Normal, now)
            .unwrap();
        let result = registry.register(CacheKey::for_testing("c"), Priority::Normal, now);
        assert!(matches!(result, Err(CacheError::Overloaded)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stale_tasks_are_cancelled() {
        let mut registry = registry();
        let start = Instant::now();

        let a = registry
            .register(CacheKey::for_testing("a"), Priority::Normal, start)
            .unwrap();
        let b = registry
            .register(CacheKey::for_testing("b"), Priority::Normal, start)
            .unwrap();

        // both slots are taken by stuck loads, which are cleaned up on the next registration
        let later = start + Duration::from_secs(31);
        let c = registry
            .register(CacheKey::for_testing("c"), Priority::Normal, later)
            .unwrap();

        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!c.cancel.is_cancelled());
        assert_eq!(registry.len(), 1);

        // late completions of cancelled loads are ignored
        assert!(!registry.complete(&CacheKey::for_testing("a"), a.id));
    }

    #[test]
    fn test_complete_ignores_replaced_task() {
        let mut registry = registry();
        let key = CacheKey::for_testing("a");
        let start = Instant::now();

        let first = registry.register(key.clone(), Priority::Normal, start).unwrap();
        assert_eq!(registry.cancel_where(|task| task.key() == &key), 1);
        assert!(first.cancel.is_cancelled());

        let second = registry.register(key.clone(), Priority::High, start).unwrap();
        assert!(!registry.complete(&key, first.id));
        assert!(registry.is_registered(&key, second.id));
        assert_eq!(registry.tasks().next().unwrap().priority(), Priority::High);
    }

    #[test]
    fn test_cancel_all() {
        let mut registry = registry();
        let now = Instant::now();

        let a = registry
            .register(CacheKey::for_testing("a"), Priority::Normal, now)
            .unwrap();
        assert_eq!(registry.cancel_all(), 1);
        assert!(a.cancel.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
        assert!(registry.is_empty());
    }
}
