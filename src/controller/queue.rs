//! Work Queue
//!
//! A de-duplicating FIFO of object keys. A key that is added while it is
//! being processed is held back until `done`, so no key is ever handled by
//! two workers at once. Failed keys are retried with per-key exponential
//! backoff.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct State<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed
    dirty: HashSet<T>,
    /// Keys currently handed out to a worker
    processing: HashSet<T>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    /// Backoff state and consecutive failure count per key
    failures: DashMap<T, (ExponentialBackoff, usize)>,
    retry_start: Duration,
    retry_max: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(retry_start: Duration, retry_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            failures: DashMap::new(),
            retry_start,
            retry_max,
        })
    }

    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its next backoff interval
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.next_backoff(&item);
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    /// Number of consecutive failures recorded for `item`
    pub fn retries(&self, item: &T) -> usize {
        self.failures.get(item).map(|entry| entry.1).unwrap_or(0)
    }

    fn next_backoff(&self, item: &T) -> Duration {
        let mut entry = self.failures.entry(item.clone()).or_insert_with(|| {
            let backoff = ExponentialBackoff {
                current_interval: self.retry_start,
                initial_interval: self.retry_start,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: self.retry_max,
                max_elapsed_time: None,
                ..Default::default()
            };
            (backoff, 0)
        });
        let (backoff, retries) = entry.value_mut();
        *retries += 1;
        backoff.next_backoff().unwrap_or(self.retry_max)
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wake all waiting workers and refuse new keys
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(Duration::from_secs(1), Duration::from_secs(8))
    }

    #[tokio::test]
    async fn test_deduplicates_pending_keys() {
        let q = queue();
        q.add("a".into());
        q.add("b".into());
        q.add("a".into());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_held_back() {
        let q = queue();
        q.add("a".into());
        let key = q.get().await.unwrap();

        // Re-added while processing: not visible to other workers yet
        q.add("a".into());
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let q = queue();
        let mut get = tokio_test::task::spawn(q.get());
        assert_pending!(get.poll());

        q.shut_down();
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), None);

        q.add("late".into());
        assert!(q.is_empty());
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let q = queue();
        let key = "a".to_string();
        let delays: Vec<_> = (0..6).map(|_| q.next_backoff(&key)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 8, 8].map(Duration::from_secs).to_vec()
        );
        assert_eq!(q.retries(&key), 6);

        q.forget(&key);
        assert_eq!(q.retries(&key), 0);
        assert_eq!(q.next_backoff(&key), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_key() {
        let q = queue();
        q.add_after("a".into(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }
}
