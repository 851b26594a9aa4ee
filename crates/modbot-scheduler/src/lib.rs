//! modbot-scheduler: keyed one-shot deferred execution on tokio.
//!
//! The scheduler owns a table of pending tasks, at most one per key. A new
//! registration for a key replaces any pending task under it, cancellation
//! is keyed and idempotent, and a panic inside one action never disturbs
//! another key. Nothing here is persisted; the lifecycle crates rebuild the
//! table from their stores at startup.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner<K> {
    name: String,
    tasks: Mutex<HashMap<K, Entry>>,
    next_generation: AtomicU64,
}

/// A registry of deferred actions, one pending tokio task per key.
///
/// Cheap to clone; clones share the same task table.
pub struct Scheduler<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a scheduler. The name only shows up in log output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tasks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a task is pending under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.tasks.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().unwrap().is_empty()
    }

    /// Run `action` once `when` is reached.
    ///
    /// A pending task under the same key is replaced without firing; a
    /// target in the past or right now runs the action promptly. The task
    /// claims its table entry before running, so a replacement or
    /// cancellation that lands first definitively suppresses it.
    pub fn schedule_at<F>(&self, when: DateTime<Utc>, key: K, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        // Hold the table lock across the spawn so the new task cannot try
        // to claim its entry before it is inserted.
        let mut tasks = self.inner.tasks.lock().unwrap();
        if let Some(old) = tasks.remove(&key) {
            debug!(scheduler = %self.inner.name, key = ?key, "replacing pending task");
            old.handle.abort();
        }
        trace!(scheduler = %self.inner.name, key = ?key, %when, "scheduling task");

        let handle = tokio::spawn(async move {
            let delay = (when - Utc::now()).to_std().unwrap_or_default();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // Claim the entry. A task that was replaced or cancelled while
            // it slept finds a newer generation (or nothing) and backs off.
            {
                let mut tasks = inner.tasks.lock().unwrap();
                match tasks.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        tasks.remove(&task_key);
                    }
                    _ => {
                        trace!(
                            scheduler = %inner.name,
                            key = ?task_key,
                            "task superseded before firing"
                        );
                        return;
                    }
                }
            }

            trace!(scheduler = %inner.name, key = ?task_key, "running scheduled task");
            if let Err(panic) = AssertUnwindSafe(action).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    scheduler = %inner.name,
                    key = ?task_key,
                    "scheduled task panicked: {message}"
                );
            }
        });

        tasks.insert(key, Entry { generation, handle });
    }

    /// Cancel the pending task for `key`, if any. A no-op for unknown or
    /// already-fired keys; an action that has already claimed its entry is
    /// not interrupted.
    pub fn cancel(&self, key: &K) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if let Some(entry) = tasks.remove(key) {
            entry.handle.abort();
            trace!(scheduler = %self.inner.name, key = ?key, "cancelled task");
        }
    }

    /// Cancel every pending task. Used when a subsystem shuts down.
    pub fn cancel_all(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let count = tasks.len();
        for (_, entry) in tasks.drain() {
            entry.handle.abort();
        }
        debug!(scheduler = %self.inner.name, count, "cancelled all tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_target_time() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_at(in_secs(60), 1, counter_task(&fired));
        assert!(scheduler.contains(&1));

        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.contains(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_suppresses() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_at(in_secs(60), 1, counter_task(&fired));
        scheduler.cancel(&1);
        assert!(!scheduler.contains(&1));

        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_task() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_at(in_secs(60), 1, counter_task(&first));
        scheduler.schedule_at(in_secs(180), 1, counter_task(&second));
        assert_eq!(scheduler.len(), 1);

        // Past the first target: the replaced task must not have fired.
        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_key_is_noop() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        scheduler.cancel(&42);

        // Cancelling an already-fired key is also a no-op.
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at(in_secs(1), 1, counter_task(&fired));
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        scheduler.cancel(&1);
    }

    #[tokio::test(start_paused = true)]
    async fn past_target_runs_promptly() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_at(in_secs(-30), 1, counter_task(&fired));
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_every_key() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        for key in 0..5 {
            scheduler.schedule_at(in_secs(60), key, counter_task(&fired));
        }
        assert_eq!(scheduler.len(), 5);

        scheduler.cancel_all();
        assert!(scheduler.is_empty());

        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_action_is_isolated() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_at(in_secs(10), 1, async {
            panic!("boom");
        });
        scheduler.schedule_at(in_secs(20), 2, counter_task(&fired));

        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());

        // Still usable for the panicked key.
        scheduler.schedule_at(in_secs(10), 1, counter_task(&fired));
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn thousands_of_pending_keys() {
        let scheduler: Scheduler<i64> = Scheduler::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        for key in 0..2000 {
            // Spread fire times so keys do not all land on one instant.
            scheduler.schedule_at(in_secs(60 + key % 30), key, counter_task(&fired));
        }
        assert_eq!(scheduler.len(), 2000);

        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2000);
        assert!(scheduler.is_empty());
    }
}
