// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Deduplicating, rate-limited work queue.
//!
//! An item is never handed to two workers at once: adding an item that is being processed
//! marks it dirty, and it is queued again when [`WorkQueue::done`] is called for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
    frozen: bool,
    // Bumped by every drain so delayed adds scheduled before it are dropped.
    epoch: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    idle: Notify,
    backoff: Backoff,
}

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

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
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
                    frozen: false,
                    epoch: 0,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Adds the item once `delay` has passed, unless the queue was drained in between.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let epoch = self.state().epoch;
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.state().epoch == epoch {
                queue.add(item);
            }
        });
    }

    /// Adds the item after its backoff delay and counts one more failure for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures += 1;
            delay
        };
        self.add_after(item, delay);
    }

    /// Clears the failure history of the item.
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let ready = self.inner.ready.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if !state.frozen
                    && let Some(item) = state.queue.pop_front()
                {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            ready.await;
        }
    }

    /// Marks the item as processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        let requeued = state.dirty.contains(item);
        if requeued {
            state.queue.push_back(item.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeued {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items waiting to be processed, in order.
    pub fn pending(&self) -> Vec<T> {
        self.state().queue.iter().cloned().collect()
    }

    /// Discards every waiting item and pending delayed add, freezes the queue, and waits for
    /// in-flight items to be marked done. Items added while frozen are kept for [`resume`].
    ///
    /// [`resume`]: WorkQueue::resume
    pub async fn drain(&self) {
        {
            let mut state = self.state();
            state.frozen = true;
            state.queue.clear();
            state.dirty.clear();
            state.failures.clear();
            state.epoch += 1;
        }
        loop {
            let idle = self.inner.idle.notified();
            if self.state().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) {
        let mut state = self.state();
        state.queue.clear();
        state.dirty.clear();
    }

    pub fn resume(&self) {
        self.state().frozen = false;
        self.inner.ready.notify_waiters();
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates_waiting_items() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("a");
        queue.add("b");
        queue.add("a");

        assert_eq!(queue.pending(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_item_in_flight_is_deferred_until_done() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        assert!(queue.is_empty(), "an item being processed is not queued twice");

        queue.done(&item);
        assert_eq!(queue.pending(), vec!["a"]);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::default();

        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(30), Duration::from_secs(1000));
        assert_eq!(backoff.delay(64), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_waits_for_backoff() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), vec!["a"]);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_waiting_and_delayed_items() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("a");
        queue.add_after("b", Duration::from_millis(50));
        queue.add("c");
        let in_flight = queue.get().await.unwrap();

        let drained = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished(), "drain waits for in-flight items");

        queue.done(&in_flight);
        drained.await.unwrap();
        assert!(queue.is_empty());

        queue.add("d");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.pending(), vec!["d"], "delayed add from before the drain is dropped");

        queue.resume();
        assert_eq!(queue.get().await, Some("d"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let queue = WorkQueue::<&str>::new(Backoff::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
