//! Steady-clock timers bound to an executor.
//!
//! [`Timer`] mirrors the usual deadline-timer surface: `expires_after`
//! schedules a deadline, `async_wait` registers a callback invoked on the
//! owning executor's thread, `cancel` aborts the outstanding wait. The
//! callback receives `true` when the wait was cancelled or superseded,
//! `false` on genuine expiry, and may re-arm the timer from inside itself.

use crate::executor::Executor;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback invoked when a timer fires or is cancelled. The argument is
/// `true` when the wait was cancelled.
pub type TimerCallback = Box<dyn FnOnce(bool) + Send>;

/// Deadline queue owned by each executor. Deadlines live in a min-heap;
/// cancellation removes the callback and leaves a stale heap entry that is
/// skipped on pop.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_key: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, callback: TimerCallback) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.heap.push(Reverse((deadline, key)));
        self.callbacks.insert(key, callback);
        key
    }

    /// Remove a scheduled wait, returning its callback for cancellation
    /// delivery. Returns `None` if it already fired.
    pub fn cancel(&mut self, key: u64) -> Option<TimerCallback> {
        self.callbacks.remove(&key)
    }

    /// Earliest live deadline, for sizing the reactor poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            if self.callbacks.contains_key(&key) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every callback whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&key) {
                due.push(callback);
            }
        }
        due
    }

    /// Drain everything for executor shutdown; all callbacks observe
    /// cancellation.
    pub fn drain(&mut self) -> Vec<TimerCallback> {
        self.heap.clear();
        self.callbacks.drain().map(|(_, cb)| cb).collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }
}

struct TimerState {
    deadline: Option<Instant>,
    pending: Option<u64>,
}

/// A steady-clock timer owned by an [`Executor`].
pub struct Timer {
    ios: Executor,
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new(ios: &Executor) -> Self {
        Self {
            ios: ios.clone(),
            state: Arc::new(Mutex::new(TimerState {
                deadline: None,
                pending: None,
            })),
        }
    }

    pub fn get_executor(&self) -> Executor {
        self.ios.clone()
    }

    /// Set the expiry relative to now. Any outstanding wait is cancelled
    /// (its callback observes `cancelled = true`).
    pub fn expires_after(&self, duration: Duration) {
        self.cancel();
        self.state.lock().deadline = Some(Instant::now() + duration);
    }

    /// Register the callback for the configured deadline. Without a prior
    /// `expires_after` the timer fires immediately.
    pub fn async_wait<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let mut state = self.state.lock();
        let deadline = state.deadline.unwrap_or_else(Instant::now);
        let shared = self.state.clone();
        let key = self.ios.schedule_at(
            deadline,
            Box::new(move |cancelled| {
                shared.lock().pending = None;
                callback(cancelled);
            }),
        );
        state.pending = Some(key);
    }

    /// Abort the outstanding wait, if any. The callback is posted with the
    /// cancelled flag set.
    pub fn cancel(&self) {
        let key = self.state.lock().pending.take();
        if let Some(key) = key {
            self.ios.cancel_timer(key);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_deadline() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, offset_ms) in [(1u32, 100u64), (2, 50), (3, 200)] {
            let fired = fired.clone();
            queue.schedule(
                now + Duration::from_millis(offset_ms),
                Box::new(move |_| fired.lock().push(label)),
            );
        }

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(50)));

        for cb in queue.pop_due(now + Duration::from_millis(120)) {
            cb(false);
        }
        assert_eq!(*fired.lock(), vec![2, 1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let key = queue.schedule(now + Duration::from_millis(10), Box::new(|_| {}));
        assert!(queue.cancel(key).is_some());
        assert!(queue.cancel(key).is_none());
        assert_eq!(queue.next_deadline(), None);
        assert!(queue.pop_due(now + Duration::from_secs(1)).is_empty());
    }
}
