//! Topic-based RPC and message routing across executors.
//!
//! Handlers register under a topic per subscriber identity. Delivery posts a
//! closure onto the subscriber's executor; replies route back through the
//! same mechanism, correlated by sequence number. Three calling modes:
//!
//! - [`Router::deliver`]: fire-and-forget, no reply expected;
//! - [`Router::invoke`]: the response (or a timeout) arrives through a
//!   callback posted to the caller's executor;
//! - [`Router::invoke_wait`]: the caller parks in its executor's
//!   `wait_for`, staying responsive to posted work, until the reply slot
//!   fills, the deadline passes, or the executor stops.
//!
//! A pending invocation is resolved exactly once: response arrival and the
//! periodic timeout sweep race, the first writer wins, the loser is a
//! no-op. Identities above the local range address out-of-process parties;
//! traffic for them serializes into [`EventRecord`]s posted to the watcher
//! registered with [`Router::lookout`] (the external transport is out of
//! scope here).

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::executor::{Executor, Timer};
use crate::ident::LOCAL_LIMIT;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque serialized argument/result payload.
pub type Payload = Vec<u8>;

/// Identity of a call's originator. Values above the local range denote
/// remote (out-of-process) callers.
pub type Caller = u32;

/// Handler bound to a (topic, subscriber) pair. Receives the calling
/// identity, the argument payload, and a responder when the caller expects
/// a reply.
pub type Handler = Arc<dyn Fn(Caller, &[u8], Option<Responder>) + Send + Sync>;

/// Response callback for [`Router::invoke`].
pub type ResponseCallback = Box<dyn FnOnce(Result<Payload, RpcError>) + Send>;

/// Watcher callback carrying events destined for an external bridge.
pub type WatcherFn = Arc<dyn Fn(EventRecord) + Send + Sync>;

pub fn is_local(identity: u32) -> bool {
    identity <= LOCAL_LIMIT
}

/// Delivery target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every subscriber of the topic.
    Broadcast,
    /// Deterministic pick among eligible subscribers: `mask % candidates`.
    /// Best-effort sticky routing only; subscriber churn remaps it.
    Mask(u64),
    /// Exactly this subscriber identity.
    Receiver(u32),
}

/// Event kinds forwarded to the watcher bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Deliver,
    Response,
    Bind,
    Unbind,
}

/// Serialized cross-process event for the external transport.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub kind: EventKind,
    pub topic: String,
    pub payload: Payload,
    pub mask: u64,
    pub receiver: u32,
    pub caller: u32,
    pub sn: u64,
}

struct Node {
    handler: Handler,
    remote_callable: bool,
}

enum Continuation {
    /// Response posts to the caller executor's callback.
    Callback { caller: u32, callback: ResponseCallback },
    /// Response fills the caller executor's reply slot and wakes it. The
    /// sweep skips these: the parked wait enforces its own deadline.
    Block { executor_id: u16 },
}

struct PendingInvoke {
    deadline: Instant,
    continuation: Continuation,
}

struct RouterInner {
    config: RpcConfig,
    handlers: Mutex<HashMap<String, BTreeMap<u32, Node>>>,
    pending: Mutex<HashMap<u64, PendingInvoke>>,
    next_sn: AtomicU64,
    watcher: Mutex<Option<(u16, WatcherFn)>>,
    sweep_timer: Mutex<Option<Timer>>,
}

/// Shared RPC router. Clone freely; all clones address the same registry.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: RpcConfig) -> Router {
        Router {
            inner: Arc::new(RouterInner {
                config,
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_sn: AtomicU64::new(1),
                watcher: Mutex::new(None),
                sweep_timer: Mutex::new(None),
            }),
        }
    }

    fn next_sn(&self) -> u64 {
        self.inner.next_sn.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register `handler` under `(topic, subscriber)`. Fails when the pair
    /// already exists. `remote_callable` additionally announces the binding
    /// to the watcher bridge.
    pub fn declare(
        &self,
        topic: &str,
        subscriber: &Executor,
        handler: Handler,
        remote_callable: bool,
    ) -> bool {
        let who = subscriber.id() as u32;
        let inserted = {
            let mut handlers = self.inner.handlers.lock();
            let nodes = handlers.entry(topic.to_string()).or_default();
            if nodes.contains_key(&who) {
                false
            } else {
                nodes.insert(
                    who,
                    Node {
                        handler,
                        remote_callable,
                    },
                );
                true
            }
        };
        if inserted && remote_callable {
            self.forward_event(EventRecord {
                kind: EventKind::Bind,
                topic: topic.to_string(),
                payload: Vec::new(),
                mask: 0,
                receiver: 0,
                caller: who,
                sn: 0,
            });
        }
        inserted
    }

    /// Remove this subscriber's registration; returns whether one existed.
    pub fn undeclare(&self, topic: &str, subscriber: &Executor) -> bool {
        let who = subscriber.id() as u32;
        let removed = {
            let mut handlers = self.inner.handlers.lock();
            match handlers.get_mut(topic) {
                None => None,
                Some(nodes) => {
                    let node = nodes.remove(&who);
                    if nodes.is_empty() {
                        handlers.remove(topic);
                    }
                    node
                }
            }
        };
        match removed {
            None => false,
            Some(node) => {
                if node.remote_callable {
                    self.forward_event(EventRecord {
                        kind: EventKind::Unbind,
                        topic: topic.to_string(),
                        payload: Vec::new(),
                        mask: 0,
                        receiver: 0,
                        caller: who,
                        sn: 0,
                    });
                }
                true
            }
        }
    }

    // =========================================================================
    // Watcher bridge
    // =========================================================================

    /// Register the watcher executor and callback that carries events for
    /// remote parties. At most one watcher; pass `None` to clear.
    pub fn lookout(&self, executor: &Executor, watcher: Option<WatcherFn>) {
        let mut slot = self.inner.watcher.lock();
        *slot = watcher.map(|w| (executor.id(), w));
    }

    fn forward_event(&self, record: EventRecord) -> bool {
        let watcher = self.inner.watcher.lock().clone();
        match watcher {
            Some((ios_id, callback)) => match Executor::find(ios_id) {
                Some(ios) => {
                    ios.post(move || callback(record));
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Fire-and-forget delivery. Returns the number of subscribers the
    /// payload was dispatched to.
    pub fn deliver(&self, topic: &str, payload: &[u8], target: Target, caller: u32) -> usize {
        self.deliver_with(topic, payload, target, caller, 0)
    }

    /// Resolve targets and dispatch, tagging dispatches with `sn` when a
    /// reply is expected (`sn` of zero means fire-and-forget).
    fn deliver_with(
        &self,
        topic: &str,
        payload: &[u8],
        target: Target,
        caller: u32,
        sn: u64,
    ) -> usize {
        let (mask, receiver) = match target {
            Target::Broadcast => (0u64, 0u32),
            Target::Mask(mask) => (mask.max(1), 0),
            Target::Receiver(who) => (0, who),
        };

        if !is_local(receiver) {
            // Remote receiver: the watcher bridge carries it.
            let forwarded = self.forward_event(EventRecord {
                kind: EventKind::Deliver,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                mask,
                receiver,
                caller,
                sn,
            });
            return usize::from(forwarded);
        }

        // Resolve the target set under the registry lock, then dispatch
        // outside it.
        let targets: Vec<(u32, Handler)> = {
            let handlers = self.inner.handlers.lock();
            let nodes = match handlers.get(topic) {
                Some(nodes) if !nodes.is_empty() => nodes,
                _ => return 0,
            };
            let remote_caller = !is_local(caller);
            let mut receiver = receiver;
            if mask > 0 {
                let eligible: Vec<u32> = nodes
                    .iter()
                    .filter(|(_, node)| !remote_caller || node.remote_callable)
                    .map(|(who, _)| *who)
                    .collect();
                if eligible.is_empty() {
                    return 0;
                }
                receiver = eligible[(mask % eligible.len() as u64) as usize];
            }
            if receiver > 0 {
                match nodes.get(&receiver) {
                    None => return 0,
                    Some(node) if remote_caller && !node.remote_callable => return 0,
                    Some(node) => vec![(receiver, node.handler.clone())],
                }
            } else {
                nodes
                    .iter()
                    .map(|(who, node)| (*who, node.handler.clone()))
                    .collect()
            }
        };

        let mut count = 0;
        for (who, handler) in targets {
            count += self.dispatch(who, handler, payload, caller, sn);
        }
        count
    }

    /// Post one handler invocation onto its subscriber's executor.
    fn dispatch(&self, who: u32, handler: Handler, payload: &[u8], caller: u32, sn: u64) -> usize {
        let ios = match Executor::find(who as u16) {
            Some(ios) => ios,
            None => return 0,
        };
        let router = self.clone();
        let payload = payload.to_vec();
        ios.post(move || {
            let responder = if sn != 0 {
                Some(Responder::new(router.clone(), caller, sn))
            } else {
                None
            };
            handler(caller, &payload, responder);
        });
        1
    }

    // =========================================================================
    // Invocation with reply
    // =========================================================================

    fn effective_deadline(&self, timeout: Option<Duration>) -> (Instant, Duration) {
        let timeout = self.inner.config.effective_timeout(timeout);
        (Instant::now() + timeout, timeout)
    }

    /// Call with an asynchronous response callback. A topic with no
    /// subscriber reports `NotFound` immediately (posted to `caller_ios`);
    /// otherwise the callback fires with the response or, after the
    /// deadline, with `Timeout` from the sweep.
    pub fn invoke<F>(
        &self,
        topic: &str,
        payload: &[u8],
        target: Target,
        caller_ios: &Executor,
        timeout: Option<Duration>,
        callback: F,
    ) where
        F: FnOnce(Result<Payload, RpcError>) + Send + 'static,
    {
        let caller = caller_ios.id() as u32;
        let sn = self.next_sn();
        let (deadline, _) = self.effective_deadline(timeout);
        // Record the pending entry before dispatch so a fast response
        // cannot miss it.
        self.inner.pending.lock().insert(
            sn,
            PendingInvoke {
                deadline,
                continuation: Continuation::Callback {
                    caller,
                    callback: Box::new(callback),
                },
            },
        );
        let count = self.deliver_with(topic, payload, target, caller, sn);
        if count == 0 {
            if let Some(entry) = self.inner.pending.lock().remove(&sn) {
                if let Continuation::Callback { callback, .. } = entry.continuation {
                    let topic = topic.to_string();
                    caller_ios.post(move || callback(Err(RpcError::NotFound(topic))));
                }
            }
        }
    }

    /// Blocking call. Must run on `caller_ios`'s thread: the executor keeps
    /// pumping work while parked. Distinguishes timeout (deadline elapsed)
    /// from cancellation (executor stopped while parked).
    pub fn invoke_wait(
        &self,
        topic: &str,
        payload: &[u8],
        target: Target,
        caller_ios: &Executor,
        timeout: Option<Duration>,
    ) -> Result<Payload, RpcError> {
        let caller = caller_ios.id() as u32;
        let sn = self.next_sn();
        let (_, timeout) = self.effective_deadline(timeout);

        let slot: crate::executor::ReplySlot = Arc::new(Mutex::new(None));
        caller_ios.set_context(slot.clone());
        self.inner.pending.lock().insert(
            sn,
            PendingInvoke {
                deadline: Instant::now() + timeout,
                continuation: Continuation::Block {
                    executor_id: caller_ios.id(),
                },
            },
        );
        let count = self.deliver_with(topic, payload, target, caller, sn);
        if count == 0 {
            self.inner.pending.lock().remove(&sn);
            caller_ios.take_context();
            return Err(RpcError::NotFound(topic.to_string()));
        }

        let signalled = caller_ios.wait_for(timeout);
        self.inner.pending.lock().remove(&sn);
        caller_ios.take_context();

        if caller_ios.stopped() {
            return Err(RpcError::Cancelled);
        }
        if !signalled {
            return Err(RpcError::Timeout);
        }
        let data = slot.lock().take().unwrap_or_default();
        decode_reply(data)
    }

    // =========================================================================
    // Response path
    // =========================================================================

    /// Route a reply back to its caller. First writer wins: if the sweep
    /// already expired the invocation this is a no-op.
    pub fn respond(&self, caller: u32, sn: u64, result: Result<Payload, RpcError>) {
        if !is_local(caller) {
            self.forward_event(EventRecord {
                kind: EventKind::Response,
                topic: String::new(),
                payload: encode_reply(&result),
                mask: 0,
                receiver: 0,
                caller,
                sn,
            });
            return;
        }
        let entry = match self.inner.pending.lock().remove(&sn) {
            Some(entry) => entry,
            None => return,
        };
        match entry.continuation {
            Continuation::Callback { caller, callback } => {
                match Executor::find(caller as u16) {
                    Some(ios) => ios.post(move || callback(result)),
                    None => log::debug!("rpc response for vanished executor {}", caller),
                }
            }
            Continuation::Block { executor_id } => {
                if let Some(ios) = Executor::find(executor_id) {
                    let data = encode_reply(&result);
                    let target = ios.clone();
                    ios.post(move || {
                        if let Some(slot) = target.context() {
                            *slot.lock() = Some(data);
                            target.wakeup();
                        }
                    });
                }
            }
        }
    }

    // =========================================================================
    // Timeout sweep
    // =========================================================================

    /// Start the periodic sweep on `ios`. Expired callback-mode entries are
    /// removed and their callers notified with `Timeout`; parked blocking
    /// calls enforce their own deadline and are skipped.
    pub fn start_sweep(&self, ios: &Executor) {
        let timer = Timer::new(ios);
        let router = self.clone();
        let interval = self.inner.config.sweep_interval();
        Self::arm_sweep(&timer, router, interval);
        *self.inner.sweep_timer.lock() = Some(timer);
    }

    pub fn stop_sweep(&self) {
        self.inner.sweep_timer.lock().take();
    }

    fn arm_sweep(timer: &Timer, router: Router, interval: Duration) {
        timer.expires_after(interval);
        let weak = Arc::downgrade(&router.inner);
        timer.async_wait(move |cancelled| {
            if cancelled {
                return;
            }
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let router = Router { inner };
            router.check_timeouts(Instant::now());
            let timer = router.inner.sweep_timer.lock();
            if let Some(timer) = timer.as_ref() {
                Self::arm_sweep(timer, router.clone(), interval);
            }
        });
    }

    fn check_timeouts(&self, now: Instant) {
        let expired: Vec<(u64, u32, ResponseCallback)> = {
            let mut pending = self.inner.pending.lock();
            let keys: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| {
                    now >= entry.deadline
                        && matches!(entry.continuation, Continuation::Callback { .. })
                })
                .map(|(sn, _)| *sn)
                .collect();
            keys.into_iter()
                .filter_map(|sn| {
                    pending.remove(&sn).and_then(|entry| match entry.continuation {
                        Continuation::Callback { caller, callback } => {
                            Some((sn, caller, callback))
                        }
                        Continuation::Block { .. } => None,
                    })
                })
                .collect()
        };
        for (sn, caller, callback) in expired {
            log::debug!("rpc invocation {} timed out (caller {})", sn, caller);
            match Executor::find(caller as u16) {
                Some(ios) => ios.post(move || callback(Err(RpcError::Timeout))),
                None => {}
            }
        }
    }

    /// Number of invocations awaiting a response (test/diagnostic hook).
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

/// One-shot reply channel handed to handlers of calls that expect a result.
/// A handler that drops its responder without answering leaves the caller
/// to the timeout sweep.
pub struct Responder {
    router: Router,
    caller: u32,
    sn: u64,
}

impl Responder {
    fn new(router: Router, caller: u32, sn: u64) -> Responder {
        Responder { router, caller, sn }
    }

    /// Send the reply. Consumes the responder; the first resolution of the
    /// invocation (this or the timeout sweep) wins.
    pub fn respond(self, result: Result<Payload, RpcError>) {
        self.router.respond(self.caller, self.sn, result);
    }

    pub fn caller(&self) -> u32 {
        self.caller
    }

    pub fn sequence(&self) -> u64 {
        self.sn
    }
}

// Reply payloads travel through the executor context slot and the watcher
// bridge as bytes: a one-byte tag distinguishes success from failure.
fn encode_reply(result: &Result<Payload, RpcError>) -> Vec<u8> {
    match result {
        Ok(payload) => {
            let mut data = Vec::with_capacity(payload.len() + 1);
            data.push(1);
            data.extend_from_slice(payload);
            data
        }
        Err(err) => {
            let text = err.to_string();
            let mut data = Vec::with_capacity(text.len() + 1);
            data.push(0);
            data.extend_from_slice(text.as_bytes());
            data
        }
    }
}

fn decode_reply(data: Vec<u8>) -> Result<Payload, RpcError> {
    match data.split_first() {
        Some((1, rest)) => Ok(rest.to_vec()),
        Some((_, rest)) => Err(RpcError::Remote(String::from_utf8_lossy(rest).to_string())),
        None => Err(RpcError::Remote("empty reply".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn echo_handler(calls: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_caller, payload, responder| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(responder) = responder {
                responder.respond(Ok(payload.to_vec()));
            }
        })
    }

    #[test]
    fn declare_is_unique_per_topic_and_subscriber() {
        let router = Router::new(RpcConfig::default());
        let ios = Executor::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(router.declare("topic", &ios, echo_handler(calls.clone()), false));
        assert!(!router.declare("topic", &ios, echo_handler(calls), false));
        assert!(router.undeclare("topic", &ios));
        assert!(!router.undeclare("topic", &ios));
    }

    #[test]
    fn deliver_broadcasts_to_all_subscribers() {
        let router = Router::new(RpcConfig::default());
        let a = Executor::new().unwrap();
        let b = Executor::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        router.declare("fan", &a, echo_handler(calls.clone()), false);
        router.declare("fan", &b, echo_handler(calls.clone()), false);

        let count = router.deliver("fan", b"x", Target::Broadcast, a.id() as u32);
        assert_eq!(count, 2);
        a.poll();
        b.poll();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mask_selects_deterministically() {
        let router = Router::new(RpcConfig::default());
        let a = Executor::new().unwrap();
        let b = Executor::new().unwrap();
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        router.declare("pick", &a, echo_handler(a_calls.clone()), false);
        router.declare("pick", &b, echo_handler(b_calls.clone()), false);

        // Same mask, same pick, every time.
        for _ in 0..5 {
            assert_eq!(router.deliver("pick", b"", Target::Mask(7), 1), 1);
        }
        a.poll();
        b.poll();
        let (a_seen, b_seen) = (
            a_calls.load(Ordering::SeqCst),
            b_calls.load(Ordering::SeqCst),
        );
        assert!(a_seen == 5 && b_seen == 0 || a_seen == 0 && b_seen == 5);
    }

    #[test]
    fn receiver_targets_exactly_one() {
        let router = Router::new(RpcConfig::default());
        let a = Executor::new().unwrap();
        let b = Executor::new().unwrap();
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        router.declare("direct", &a, echo_handler(a_calls.clone()), false);
        router.declare("direct", &b, echo_handler(b_calls.clone()), false);

        let count = router.deliver("direct", b"", Target::Receiver(b.id() as u32), 1);
        assert_eq!(count, 1);
        a.poll();
        b.poll();
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_caller_requires_remote_callable() {
        let router = Router::new(RpcConfig::default());
        let ios = Executor::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        router.declare("guarded", &ios, echo_handler(calls.clone()), false);

        let remote_caller = LOCAL_LIMIT + 10;
        assert_eq!(
            router.deliver("guarded", b"", Target::Receiver(ios.id() as u32), remote_caller),
            0
        );
        assert_eq!(router.deliver("guarded", b"", Target::Mask(3), remote_caller), 0);

        // A local caller passes.
        assert_eq!(
            router.deliver("guarded", b"", Target::Receiver(ios.id() as u32), 1),
            1
        );
    }

    #[test]
    fn invoke_unknown_topic_reports_not_found() {
        let router = Router::new(RpcConfig::default());
        let ios = Executor::new().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        router.invoke("missing", b"", Target::Broadcast, &ios, None, move |result| {
            *slot.lock() = Some(result);
        });
        ios.poll();
        assert_eq!(
            *outcome.lock(),
            Some(Err(RpcError::NotFound("missing".to_string())))
        );
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn invoke_round_trip_on_one_executor() {
        let router = Router::new(RpcConfig::default());
        let ios = Executor::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        router.declare("echo", &ios, echo_handler(calls), false);

        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        router.invoke("echo", b"ping", Target::Broadcast, &ios, None, move |result| {
            *slot.lock() = Some(result);
        });
        for _ in 0..10 {
            ios.poll();
            if outcome.lock().is_some() {
                break;
            }
        }
        assert_eq!(*outcome.lock(), Some(Ok(b"ping".to_vec())));
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn reply_encoding_round_trip() {
        assert_eq!(decode_reply(encode_reply(&Ok(b"data".to_vec()))), Ok(b"data".to_vec()));
        let err = decode_reply(encode_reply(&Err(RpcError::Timeout)));
        assert_eq!(err, Err(RpcError::Remote("timeout".to_string())));
        assert!(decode_reply(Vec::new()).is_err());
    }

    #[test]
    fn remote_deliver_goes_through_watcher() {
        let router = Router::new(RpcConfig::default());
        let watcher_ios = Executor::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.lookout(
            &watcher_ios,
            Some(Arc::new(move |record: EventRecord| {
                sink.lock().push((record.kind, record.receiver));
            })),
        );

        let remote_receiver = LOCAL_LIMIT + 99;
        let count = router.deliver("far", b"x", Target::Receiver(remote_receiver), 1);
        assert_eq!(count, 1);
        watcher_ios.poll();
        assert_eq!(seen.lock().as_slice(), &[(EventKind::Deliver, remote_receiver)]);
    }

    #[test]
    fn bind_events_reach_watcher_for_remote_callable() {
        let router = Router::new(RpcConfig::default());
        let watcher_ios = Executor::new().unwrap();
        let ios = Executor::new().unwrap();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        router.lookout(
            &watcher_ios,
            Some(Arc::new(move |record: EventRecord| {
                sink.lock().push(record.kind);
            })),
        );

        router.declare("pub", &ios, echo_handler(Arc::new(AtomicUsize::new(0))), true);
        router.undeclare("pub", &ios);
        watcher_ios.poll();
        assert_eq!(kinds.lock().as_slice(), &[EventKind::Bind, EventKind::Unbind]);
    }
}
