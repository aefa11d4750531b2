use crate::Backoff;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::Notify, time};

/// A deduplicating work queue with single-flight processing per key.
///
/// * A key that is already queued is not queued again.
/// * A key handed out by [`WorkQueue::next`] is not handed out again until
///   [`WorkQueue::done`] is called for it. If the key was added while it was
///   being processed, `done` requeues it.
/// * After [`WorkQueue::shut_down`], pending keys are discarded and `next`
///   returns `None` once the caller has nothing left to do.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

// === impl WorkQueue ===

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub fn add(&self, key: K) {
        self.inner.add(key);
    }

    /// Adds the key once `delay` has elapsed. Must be called from within a
    /// tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        if self.is_shut_down() {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.add(key);
            }
        });
    }

    /// Records a failure for the key and adds it after a delay that grows
    /// with the number of consecutive failures. Returns the delay.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures = failures.saturating_add(1);
            self.inner.backoff.delay(*failures)
        };
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of the key.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next key to process. Returns `None` once the queue has
    /// been shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            // Register as a waiter before inspecting the state so that a
            // concurrent `add` or `shut_down` cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // This worker may have consumed a wakeup meant for
                        // another key.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks processing of the key as finished.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys and discards everything pending. Keys that are
    /// currently being processed are unaffected.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.failures.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// The number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_processing(&self, key: &K) -> bool {
        self.inner.state.lock().processing.contains(key)
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

// === impl Inner ===

impl<K: Clone + Eq + Hash> Inner<K> {
    fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}
