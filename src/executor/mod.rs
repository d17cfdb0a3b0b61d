//! I/O service executors.
//!
//! An [`Executor`] wraps one reactor loop: a cross-thread task queue, a
//! readiness poller, a deadline queue and a wakeup primitive. Sockets,
//! timers and acceptors are bound to an executor at construction and all of
//! their state is mutated on its thread; cross-thread operations are
//! expressed as [`Executor::post`] closures, never direct calls.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        EXECUTOR                            │
//! ├────────────────────────────────────────────────────────────┤
//! │  Poller: epoll/kqueue readiness + wakeup descriptor        │
//! │  TimerQueue: steady-clock deadlines                        │
//! │  Task queue: posted closures (enqueue-only, cross-thread)  │
//! │  Semaphore: wait()/wait_for() cooperative blocking         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Executors are cloneable handles over a shared core; the strong reference
//! count doubles as the load metric used by the accept pool. Every executor
//! draws a process-unique identity and registers in a directory so the RPC
//! layer can address it by id.

mod reactor;
mod signal;
mod timer;

pub use reactor::{Event, Interest, Token};
pub use signal::SignalSet;
pub use timer::Timer;

pub(crate) use reactor::next_token;
pub(crate) use timer::TimerCallback;

use crate::error::{NetError, NetResult};
use crate::ident::Ident;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use reactor::Poller;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// A unit of work posted to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Completion for an armed I/O wait. `Ok` means the descriptor is ready
/// (possibly with an error condition the operation will observe); `Err`
/// carries cancellation when the executor stops or the socket closes.
pub(crate) type IoCallback = Box<dyn FnOnce(NetResult<()>) + Send>;

/// Reply slot installed as executor context during a blocking RPC call.
/// The response handler fills the slot and wakes the executor.
pub type ReplySlot = Arc<Mutex<Option<Vec<u8>>>>;

struct FdWaiters {
    fd: RawFd,
    read: Option<IoCallback>,
    write: Option<IoCallback>,
    registered: bool,
}

impl FdWaiters {
    fn interest(&self) -> Interest {
        let mut interest = Interest(0);
        if self.read.is_some() {
            interest |= Interest::READABLE;
        }
        if self.write.is_some() {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

pub(crate) struct Inner {
    id: Ident,
    poller: Poller,
    tasks_tx: Sender<Task>,
    tasks_rx: Receiver<Task>,
    waiters: Mutex<HashMap<Token, FdWaiters>>,
    timers: Mutex<timer::TimerQueue>,
    stopped: AtomicBool,
    semaphore: AtomicUsize,
    context: Mutex<Option<ReplySlot>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        directory().lock().remove(&self.id.value());
    }
}

fn directory() -> &'static Mutex<HashMap<u16, Weak<Inner>>> {
    static DIRECTORY: OnceLock<Mutex<HashMap<u16, Weak<Inner>>>> = OnceLock::new();
    DIRECTORY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Run a user callback, containing panics at the reactor boundary.
pub(crate) fn guarded<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("handler panicked; containing at executor boundary");
    }
}

/// Reactor-backed I/O service. Cloning produces another handle to the same
/// service.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new() -> NetResult<Executor> {
        let poller = Poller::new()?;
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            id: Ident::acquire(),
            poller,
            tasks_tx,
            tasks_rx,
            waiters: Mutex::new(HashMap::new()),
            timers: Mutex::new(timer::TimerQueue::new()),
            stopped: AtomicBool::new(false),
            semaphore: AtomicUsize::new(0),
            context: Mutex::new(None),
        });
        directory()
            .lock()
            .insert(inner.id.value(), Arc::downgrade(&inner));
        Ok(Executor { inner })
    }

    /// Process-unique identity, recycled when the last handle drops.
    pub fn id(&self) -> u16 {
        self.inner.id.value()
    }

    /// Look up a live executor by identity.
    pub fn find(id: u16) -> Option<Executor> {
        let weak = directory().lock().get(&id).cloned()?;
        weak.upgrade().map(|inner| Executor { inner })
    }

    /// Current load metric: the number of live handles (sockets, timers,
    /// acceptors bound here all hold one).
    pub fn load(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles refer to the same service.
    pub fn same(&self, other: &Executor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Work submission
    // =========================================================================

    /// Enqueue work for execution on this executor's thread. Never blocks
    /// and never inline-executes, even when called from the loop thread.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.inner.tasks_tx.send(Box::new(f));
        self.wake();
    }

    fn wake(&self) {
        if let Err(err) = self.inner.poller.waker().wake() {
            log::warn!("executor {} wakeup failed: {}", self.id(), err);
        }
    }

    // =========================================================================
    // Loop driving
    // =========================================================================

    /// Run until [`stop`](Self::stop) is called. Outstanding I/O waits and
    /// timers observe cancellation when the loop exits.
    pub fn run(&self) {
        while !self.stopped() {
            self.run_one(None);
        }
        self.run_down();
    }

    /// Run for at most `duration` of wall time.
    pub fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.run_one(Some(deadline - now));
        }
        if self.stopped() {
            self.run_down();
        }
    }

    /// Drain everything that is ready right now without blocking. Returns
    /// the number of handlers executed.
    pub fn poll(&self) -> usize {
        let mut count = 0;
        while !self.stopped() && self.run_one(Some(Duration::ZERO)) {
            count += 1;
        }
        count
    }

    /// Execute at most one batch of ready work: due timers, a posted task,
    /// or the I/O completions of one reactor poll bounded by `timeout`.
    /// Returns whether any handler ran.
    pub fn run_one(&self, timeout: Option<Duration>) -> bool {
        let now = Instant::now();

        let due = self.inner.timers.lock().pop_due(now);
        if !due.is_empty() {
            for callback in due {
                guarded(|| callback(false));
            }
            return true;
        }

        if let Ok(task) = self.inner.tasks_rx.try_recv() {
            guarded(task);
            return true;
        }

        // Bound the poll by the nearest timer deadline.
        let next = self.inner.timers.lock().next_deadline();
        let timer_timeout = next.map(|deadline| deadline.saturating_duration_since(now));
        let poll_timeout = match (timeout, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let mut events = Vec::new();
        if let Err(err) = self.inner.poller.poll(&mut events, poll_timeout) {
            log::error!("executor {} poll failed: {}", self.id(), err);
            return false;
        }

        let mut ran = false;
        for event in events {
            ran |= self.dispatch(event);
        }

        let due = self.inner.timers.lock().pop_due(Instant::now());
        for callback in due {
            guarded(|| callback(false));
            ran = true;
        }

        if !ran {
            if let Ok(task) = self.inner.tasks_rx.try_recv() {
                guarded(task);
                ran = true;
            }
        }
        ran
    }

    fn dispatch(&self, event: Event) -> bool {
        let (read_cb, write_cb) = {
            let mut waiters = self.inner.waiters.lock();
            let entry = match waiters.get_mut(&event.token) {
                Some(entry) => entry,
                None => return false,
            };
            let fault = event.interest.is_error() || event.interest.is_hup();
            let read_cb = if event.interest.is_readable() || fault {
                entry.read.take()
            } else {
                None
            };
            let write_cb = if event.interest.is_writable() || fault {
                entry.write.take()
            } else {
                None
            };
            // One-shot delivery disarmed the registration; re-arm whatever
            // direction is still waited on.
            let remaining = entry.interest();
            if remaining.0 != 0 {
                if let Err(err) = self.inner.poller.modify(entry.fd, event.token, remaining) {
                    log::warn!("rearm failed for fd {}: {}", entry.fd, err);
                }
            }
            (read_cb, write_cb)
        };

        let mut ran = false;
        if let Some(callback) = read_cb {
            guarded(|| callback(Ok(())));
            ran = true;
        }
        if let Some(callback) = write_cb {
            guarded(|| callback(Ok(())));
            ran = true;
        }
        ran
    }

    /// Cancel everything outstanding after the loop exits: queued
    /// completions observe cancellation rather than silently vanishing.
    fn run_down(&self) {
        let waiters: Vec<FdWaiters> = {
            let mut map = self.inner.waiters.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for entry in waiters {
            if entry.registered {
                let _ = self.inner.poller.deregister(entry.fd);
            }
            if let Some(callback) = entry.read {
                guarded(|| callback(Err(NetError::Cancelled)));
            }
            if let Some(callback) = entry.write {
                guarded(|| callback(Err(NetError::Cancelled)));
            }
        }
        let timers = self.inner.timers.lock().drain();
        for callback in timers {
            guarded(|| callback(true));
        }
    }

    /// Request loop termination. Safe to call from any thread.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Cooperative blocking (used by synchronous RPC calls)
    // =========================================================================

    /// Signal a parked [`wait`](Self::wait)/[`wait_for`](Self::wait_for).
    /// The signal is posted as ordinary work so it is observed in queue
    /// order.
    pub fn wakeup(&self) {
        let inner = self.inner.clone();
        self.post(move || {
            inner.semaphore.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn take_signal(&self) -> bool {
        self.inner.semaphore.swap(0, Ordering::SeqCst) > 0
    }

    /// Pump the reactor until [`wakeup`](Self::wakeup) is observed or the
    /// executor stops. Keeps servicing posted work and I/O while parked.
    pub fn wait(&self) {
        while !self.stopped() {
            self.run_one(None);
            if self.take_signal() {
                break;
            }
        }
    }

    /// Like [`wait`](Self::wait) but bounded; returns whether the signal
    /// (rather than the deadline or a stop) ended the wait.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let begin = Instant::now();
        while !self.stopped() {
            let elapsed = begin.elapsed();
            if elapsed >= timeout {
                break;
            }
            self.run_one(Some(timeout - elapsed));
            if self.take_signal() {
                return true;
            }
        }
        false
    }

    /// Install the reply slot a blocking RPC call is waiting on.
    pub fn set_context(&self, slot: ReplySlot) {
        *self.inner.context.lock() = Some(slot);
    }

    /// Clone of the installed reply slot, if any.
    pub fn context(&self) -> Option<ReplySlot> {
        self.inner.context.lock().clone()
    }

    /// Remove and return the installed reply slot.
    pub fn take_context(&self) -> Option<ReplySlot> {
        self.inner.context.lock().take()
    }

    // =========================================================================
    // I/O wait arming (crate-internal, used by sockets/acceptors/signals)
    // =========================================================================

    /// Arm a one-shot wait for `direction` readiness on `fd`. The callback
    /// runs on the loop thread when the descriptor becomes ready, or with a
    /// cancellation error when the waiter is torn down.
    pub(crate) fn arm(
        &self,
        fd: RawFd,
        token: Token,
        direction: Interest,
        callback: IoCallback,
    ) -> Result<(), (NetError, IoCallback)> {
        let mut waiters = self.inner.waiters.lock();
        let entry = waiters.entry(token).or_insert(FdWaiters {
            fd,
            read: None,
            write: None,
            registered: false,
        });
        entry.fd = fd;
        if direction.is_readable() {
            entry.read = Some(callback);
        } else {
            entry.write = Some(callback);
        }
        let interest = entry.interest();
        let result = if entry.registered {
            self.inner.poller.modify(fd, token, interest)
        } else {
            self.inner.poller.register(fd, token, interest)
        };
        match result {
            Ok(()) => {
                entry.registered = true;
                Ok(())
            }
            Err(err) => {
                // Undo the slot we just filled so the callback is returned
                // to the caller through the error path exactly once.
                let callback = if direction.is_readable() {
                    entry.read.take()
                } else {
                    entry.write.take()
                };
                if entry.read.is_none() && entry.write.is_none() && !entry.registered {
                    waiters.remove(&token);
                }
                Err((err.into(), callback.expect("callback was just stored")))
            }
        }
    }

    /// Tear down a waiter. Outstanding callbacks are returned so the caller
    /// can complete them with its own error.
    pub(crate) fn disarm(&self, token: Token) -> Vec<IoCallback> {
        let mut callbacks = Vec::new();
        let mut waiters = self.inner.waiters.lock();
        if let Some(entry) = waiters.remove(&token) {
            if entry.registered {
                let _ = self.inner.poller.deregister(entry.fd);
            }
            if let Some(callback) = entry.read {
                callbacks.push(callback);
            }
            if let Some(callback) = entry.write {
                callbacks.push(callback);
            }
        }
        callbacks
    }

    // =========================================================================
    // Timers (used by the Timer handle)
    // =========================================================================

    pub(crate) fn schedule_at(&self, deadline: Instant, callback: TimerCallback) -> u64 {
        let key = self.inner.timers.lock().schedule(deadline, callback);
        // The loop may be parked past this deadline; force a recalculation.
        self.wake();
        key
    }

    pub(crate) fn cancel_timer(&self, key: u64) {
        let callback = self.inner.timers.lock().cancel(key);
        if let Some(callback) = callback {
            self.post(move || callback(true));
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id())
            .field("load", &self.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_poll() {
        let ios = Executor::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        ios.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ios.poll();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique_and_resolvable() {
        let a = Executor::new().unwrap();
        let b = Executor::new().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(Executor::find(a.id()).unwrap().same(&a));
        assert!(Executor::find(b.id()).unwrap().same(&b));
        let missing = Executor::find(0xFFFF);
        assert!(missing.is_none() || !missing.unwrap().same(&a));
    }

    #[test]
    fn directory_entry_removed_on_drop() {
        let id = {
            let ios = Executor::new().unwrap();
            ios.id()
        };
        assert!(Executor::find(id).is_none());
    }

    #[test]
    fn wait_for_times_out() {
        let ios = Executor::new().unwrap();
        let begin = Instant::now();
        assert!(!ios.wait_for(Duration::from_millis(50)));
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wakeup_releases_wait() {
        let ios = Executor::new().unwrap();
        let remote = ios.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.wakeup();
        });
        assert!(ios.wait_for(Duration::from_secs(5)));
    }

    #[test]
    fn stop_cancels_wait() {
        let ios = Executor::new().unwrap();
        let remote = ios.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.stop();
        });
        assert!(!ios.wait_for(Duration::from_secs(5)));
        assert!(ios.stopped());
    }

    #[test]
    fn timer_fires_on_loop() {
        let ios = Executor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = Timer::new(&ios);
        timer.expires_after(Duration::from_millis(20));
        let f = fired.clone();
        timer.async_wait(move |cancelled| {
            if !cancelled {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        ios.run_for(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_reports_cancellation() {
        let ios = Executor::new().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let timer = Timer::new(&ios);
        timer.expires_after(Duration::from_secs(60));
        let o = outcome.clone();
        timer.async_wait(move |cancelled| {
            *o.lock() = Some(cancelled);
        });
        timer.cancel();
        ios.run_for(Duration::from_millis(100));
        assert_eq!(*outcome.lock(), Some(true));
    }

    #[test]
    fn panicking_task_does_not_kill_loop() {
        let ios = Executor::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        ios.post(|| panic!("boom"));
        let c = counter.clone();
        ios.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ios.poll();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_counts_handles() {
        let ios = Executor::new().unwrap();
        let base = ios.load();
        let extra = ios.clone();
        assert_eq!(ios.load(), base + 1);
        drop(extra);
        assert_eq!(ios.load(), base);
    }
}
