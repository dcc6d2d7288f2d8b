//! Debounced commits for rapid field edits.
//!
//! Every field group owns at most one live timer. Scheduling a new edit for the same key aborts
//! the pending one, so only the last edit in a burst reaches the store.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Default quiet period before an edit is committed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

struct PendingCommit {
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap<K> = Arc<Mutex<HashMap<K, PendingCommit>>>;

fn lock_pending<K>(pending: &PendingMap<K>) -> MutexGuard<'_, HashMap<K, PendingCommit>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed debouncer. Must be used from within a tokio runtime.
pub struct Debouncer<K> {
    delay: Duration,
    pending: PendingMap<K>,
    next_generation: Mutex<u64>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedules `commit` to run after the quiet period, replacing any pending commit for `key`.
    pub fn schedule<F>(&self, key: K, commit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };

        // The map stays locked until the new handle is stored so the task cannot finish first.
        let mut pending = lock_pending(&self.pending);
        let task_pending = self.pending.clone();
        let task_key = key.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = lock_pending(&task_pending);
                if pending.get(&task_key).is_some_and(|entry| entry.generation == generation) {
                    pending.remove(&task_key);
                } else {
                    return;
                }
            }
            commit();
        });

        if let Some(previous) = pending.insert(key, PendingCommit { generation, handle }) {
            trace!(generation, "superseded pending edit");
            previous.handle.abort();
        }
    }

    /// Drops the pending commit for `key`. Returns `true` when one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock_pending(&self.pending).remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock_pending(&self.pending).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, entry) in lock_pending(&self.pending).drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn only_last_edit_in_burst_commits() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let committed = Arc::new(Mutex::new(Vec::new()));

        for value in 1..=3 {
            let committed = committed.clone();
            debouncer.schedule("fetch.input", move || committed.lock().unwrap().push(value));
        }
        assert_eq!(debouncer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*committed.lock().unwrap(), vec![3]);
        assert!(!debouncer.is_pending(&"fetch.input"));
    }

    #[tokio::test]
    async fn keys_are_debounced_independently() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let commits = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let commits = commits.clone();
            debouncer.schedule(key, move || {
                commits.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(commits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_edits_never_commit() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        debouncer.schedule("title", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(debouncer.cancel(&"title"));
        assert!(!debouncer.cancel(&"title"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(commits.load(Ordering::SeqCst), 0);
    }
}
