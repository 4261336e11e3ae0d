use crate::rate_limiter::{RateLimiter, default_controller_rate_limiter};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// Deadline used for delays which overflow [`Instant`], roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct State<T> {
    /// Items ready to be handed out by [`WorkQueue::get`], in FIFO order.
    queue: VecDeque<T>,
    /// Items which need processing. Every queued item is dirty, but an item
    /// which is dirty while being processed is not queued until it is done.
    dirty: HashSet<T>,
    /// Items currently handed out to a worker.
    processing: HashSet<T>,
    /// Items scheduled by [`WorkQueue::add_after`], with their deadline.
    waiting: HashMap<T, Instant>,
    rate_limiter: Box<dyn RateLimiter<T>>,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> State<T> {
    /// Returns `true` if a waiting reader must be woken up.
    fn add(&mut self, item: T) -> bool {
        if self.shutting_down || self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            // Picked up again by `done`.
            return false;
        }
        self.queue.push_back(item);
        true
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Notify,
}

/// Deduplicating, rate limited work queue.
///
/// * An item is queued at most once, no matter how often it is added before
///   a worker picks it up.
/// * An item is never handed out to two workers at the same time. If it is
///   added while being processed, it is handed out again after [`WorkQueue::done`].
/// * Failed items can be re-queued with a per item backoff
///   ([`WorkQueue::add_rate_limited`]).
///
/// All state lives behind one lock, only [`WorkQueue::get`] ever waits.
/// Cloning is cheap, all clones share the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Queue using [`default_controller_rate_limiter`].
    pub fn new() -> Self {
        Self::with_rate_limiter(default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    rate_limiter: Box::new(rate_limiter),
                    shutting_down: false,
                }),
                ready: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        // No invariant spans a panic while the lock is held, so poisoning is ignored.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing. No-op after [`WorkQueue::shut_down`].
    pub fn add(&self, item: T) {
        if self.state().add(item) {
            self.inner.ready.notify_one();
        }
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and
    /// no queued items are left.
    ///
    /// Every returned item must be passed to [`WorkQueue::done`] exactly once.
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.inner.ready.notified());
            // Register before inspecting the state, so a concurrent `add` or
            // `shut_down` cannot slip through unnoticed.
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as no longer being processed.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(item);
            let requeued = state.dirty.contains(item);
            if requeued {
                state.queue.push_back(item.clone());
            }
            requeued
        };
        if requeued {
            self.inner.ready.notify_one();
        }
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.state().rate_limiter.forget(item);
    }

    /// Number of failures recorded for `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().rate_limiter.num_requeues(item)
    }

    /// Re-queue `item` once the rate limiter allows it and return the delay,
    /// or `None` if the queue is shutting down.
    pub fn add_rate_limited(&self, item: T) -> Option<Duration> {
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return None;
            }
            state.rate_limiter.when(&item)
        };
        self.add_after(item, delay);
        Some(delay)
    }

    /// Add `item` after `delay`. If the item is already scheduled, the earlier
    /// deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime to schedule delayed add, adding immediately");
                return self.add(item);
            }
        };
        let now = Instant::now();
        let deadline = now
            .checked_add(delay.min(FAR_FUTURE))
            .unwrap_or(now);
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(scheduled) if *scheduled <= deadline => return,
                _ => {
                    state.waiting.insert(item.clone(), deadline);
                }
            }
        }
        let queue: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = queue.upgrade() {
                WorkQueue { inner }.deadline_reached(item, deadline);
            }
        });
    }

    fn deadline_reached(&self, item: T, deadline: Instant) {
        let wake = {
            let mut state = self.state();
            if state.waiting.get(&item) != Some(&deadline) {
                // Superseded by an earlier deadline or discarded by shutdown.
                return;
            }
            state.waiting.remove(&item);
            state.add(item)
        };
        if wake {
            self.inner.ready.notify_one();
        }
    }

    /// Stop accepting items and release all readers blocked in [`WorkQueue::get`]
    /// once the queue ran empty. Scheduled (delayed) items and the failure
    /// history of the rate limiter are discarded.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.waiting.clear();
            state.rate_limiter.clear();
        }
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
