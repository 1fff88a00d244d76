use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::kubernetes::JobKey;
use crate::metrics::QUEUE_DEPTH;

#[derive(Default)]
struct State {
    queue: VecDeque<JobKey>,
    /// Keys waiting to be processed, queued or not
    dirty: HashSet<JobKey>,
    /// Keys handed to a worker and not yet marked done
    processing: HashSet<JobKey>,
    shutting_down: bool,
}

/// Deduplicating work queue keyed by job.
///
/// A key is handed to at most one worker at a time. Adding a key that is
/// already queued is a no-op; adding one that is being processed marks it
/// dirty so it is queued again once the worker calls [`WorkQueue::done`].
#[derive(Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, key: JobKey) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            QUEUE_DEPTH.set(state.queue.len() as i64);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: JobKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn next(&self) -> Option<JobKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    QUEUE_DEPTH.set(state.queue.len() as i64);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` finished, queueing it again if it changed meanwhile.
    pub fn done(&self, key: &JobKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            QUEUE_DEPTH.set(state.queue.len() as i64);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn key(name: &str) -> JobKey {
        JobKey::new("default", name)
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
        assert!(queue.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let first = queue.next().await.unwrap();

        // Event for the same job while it is being reconciled.
        queue.add(key("a"));
        queue.add(key("a"));
        assert!(queue.is_empty());
        assert!(queue.next().now_or_never().is_none());

        queue.done(&first);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("a")));
        queue.done(&key("a"));
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn waiting_worker_wakes_on_add() {
        let queue = WorkQueue::new();
        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());

        queue.add(key("a"));
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_key() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.shutdown();
        queue.add(key("b"));

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, None);
    }
}
