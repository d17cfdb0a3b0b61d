//! Raw TCP socket with optional transport security.
//!
//! A [`RawSocket`] owns a nonblocking TCP descriptor bound to one executor.
//! Reads and writes go through the TLS session when one is layered in.
//! Concurrent writes serialize through an internal send queue: an
//! asynchronous send always copies the caller's bytes, defers onto the
//! owning executor, and triggers a flush only when the queue was empty.
//! A flush issues one vectored write covering everything queued, then walks
//! the queue front to back handing each node its completion, and repeats to
//! pick up anything queued meanwhile. At most one physical write is in
//! flight per socket.
//!
//! An idle timer ticks at timeout/5 and force-closes the socket when nothing
//! has been received for the configured timeout. Peers that have not yet
//! completed a security/WebSocket handshake get the short untrusted timeout.

use crate::config::{TRUST_TIMEOUT_MS, UNTRUST_TIMEOUT_MS};
use crate::error::{NetError, NetResult};
use crate::executor::{next_token, Executor, Interest, Timer, Token};
use crate::net::{resolve, wait_fd};
#[cfg(feature = "tls")]
use crate::net::tls::{TlsContext, TlsSession};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Milliseconds on the process-local steady clock.
pub(crate) fn steady_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

pub(crate) struct StreamState {
    pub stream: Option<TcpStream>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsSession>,
    #[cfg(feature = "tls")]
    pub tls_context: Option<TlsContext>,
    /// Hostname captured at connect time for SNI.
    pub server_name: Option<String>,
}

impl StreamState {
    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Nonblocking read through the security layer when present.
    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            return tls.read(stream, buf);
        }
        stream.read(buf)
    }

    /// Nonblocking vectored write through the security layer when present.
    /// The TLS path accepts all plaintext into the session buffer and pumps
    /// as much ciphertext as the transport takes.
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            let mut total = 0;
            for buf in bufs {
                total += tls.buffer_plaintext(buf)?;
            }
            tls.pump_writes(stream)?;
            return Ok(total);
        }
        stream.write_vectored(bufs)
    }

    /// True while the security layer holds ciphertext not yet written.
    pub fn needs_flush(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_ref() {
            return tls.wants_write();
        }
        false
    }

    /// Push pending ciphertext toward the transport.
    pub fn pump_flush(&mut self) -> io::Result<()> {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            if let Some(tls) = self.tls.as_mut() {
                tls.pump_writes(stream)?;
            }
        }
        Ok(())
    }
}

struct SendNode {
    data: Vec<u8>,
    handler: Option<Box<dyn FnOnce(NetResult<usize>) + Send>>,
}

pub(crate) struct SocketCore {
    id: crate::ident::Ident,
    ios: Executor,
    token: Token,
    pub(crate) state: Mutex<StreamState>,
    timer: Timer,
    last_recv: AtomicU64,
    timeout_ms: AtomicU64,
    client_role: AtomicBool,
    closed: AtomicBool,
    /// Marks peers that must earn trust through a handshake before the long
    /// idle timeout applies (security layer present, or WebSocket family).
    untrusted: AtomicBool,
    flushing: AtomicBool,
    send_queue: Mutex<VecDeque<SendNode>>,
    userdata: Mutex<Option<Box<dyn Any + Send>>>,
    tick_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

/// Reference-counted raw TCP socket. Clones share the connection.
#[derive(Clone)]
pub struct RawSocket {
    core: Arc<SocketCore>,
}

/// Non-owning handle; lets timer hooks reach the socket without keeping it
/// alive.
pub(crate) struct WeakRawSocket(std::sync::Weak<SocketCore>);

impl WeakRawSocket {
    pub fn upgrade(&self) -> Option<RawSocket> {
        self.0.upgrade().map(|core| RawSocket { core })
    }
}

impl RawSocket {
    pub fn new(ios: &Executor) -> RawSocket {
        let core = Arc::new(SocketCore {
            id: crate::ident::Ident::acquire(),
            ios: ios.clone(),
            token: next_token(),
            state: Mutex::new(StreamState {
                stream: None,
                #[cfg(feature = "tls")]
                tls: None,
                #[cfg(feature = "tls")]
                tls_context: None,
                server_name: None,
            }),
            timer: Timer::new(ios),
            last_recv: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(0),
            client_role: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            untrusted: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            send_queue: Mutex::new(VecDeque::new()),
            userdata: Mutex::new(None),
            tick_hook: Mutex::new(None),
        });
        RawSocket { core }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(ios: &Executor, context: &TlsContext) -> RawSocket {
        let socket = Self::new(ios);
        socket.core.state.lock().tls_context = Some(context.clone());
        // Secured peers earn trust through the handshake.
        socket.core.untrusted.store(true, Ordering::SeqCst);
        socket
    }

    pub fn id(&self) -> u16 {
        self.core.id.value()
    }

    pub(crate) fn downgrade(&self) -> WeakRawSocket {
        WeakRawSocket(Arc::downgrade(&self.core))
    }

    pub fn get_executor(&self) -> Executor {
        self.core.ios.clone()
    }

    pub fn is_client(&self) -> bool {
        self.core.client_role.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.core.send_queue.lock().is_empty()
    }

    pub fn is_security(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.core.state.lock().tls_context.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// Plaintext transport with no security layer.
    pub fn is_native(&self) -> bool {
        !self.is_security()
    }

    pub fn is_open(&self) -> bool {
        !self.core.closed.load(Ordering::SeqCst) && self.core.state.lock().stream.is_some()
    }

    pub fn set_userdata<T: Any + Send>(&self, value: T) {
        *self.core.userdata.lock() = Some(Box::new(value));
    }

    pub fn take_userdata(&self) -> Option<Box<dyn Any + Send>> {
        self.core.userdata.lock().take()
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        let state = self.core.state.lock();
        let stream = state
            .stream
            .as_ref()
            .ok_or(NetError::Closed)?;
        Ok(stream.local_addr()?)
    }

    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        let state = self.core.state.lock();
        let stream = state
            .stream
            .as_ref()
            .ok_or(NetError::Closed)?;
        Ok(stream.peer_addr()?)
    }

    /// Treat this peer as untrusted until a later handshake promotes it.
    pub(crate) fn mark_untrusted(&self) {
        self.core.untrusted.store(true, Ordering::SeqCst);
    }

    /// Install the per-tick hook the WebSocket layer uses for keep-alive.
    pub(crate) fn set_tick_hook(&self, hook: Box<dyn Fn() + Send>) {
        *self.core.tick_hook.lock() = Some(hook);
    }

    /// Adopt an accepted connection. Role stays server.
    pub(crate) fn attach(&self, stream: TcpStream) -> NetResult<()> {
        stream.set_nonblocking(true)?;
        self.core.state.lock().stream = Some(stream);
        Ok(())
    }

    // =========================================================================
    // Idle timeout
    // =========================================================================

    /// Configure the idle timeout. The first call arms the periodic check
    /// and stamps the receive clock; later calls only update the duration.
    pub fn set_timeout(&self, timeout_ms: u64) {
        if self.core.timeout_ms.load(Ordering::SeqCst) == 0 {
            self.core.last_recv.store(steady_ms(), Ordering::SeqCst);
            Self::arm_idle_timer(&self.core, timeout_ms / 5);
        }
        self.core.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    fn arm_idle_timer(core: &Arc<SocketCore>, tick_ms: u64) {
        let weak = Arc::downgrade(core);
        core.timer.expires_after(Duration::from_millis(tick_ms.max(1)));
        core.timer.async_wait(move |cancelled| {
            if cancelled {
                return;
            }
            let core = match weak.upgrade() {
                Some(core) => core,
                None => return,
            };
            if core.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(hook) = core.tick_hook.lock().as_ref() {
                hook();
            }
            let timeout = core.timeout_ms.load(Ordering::SeqCst);
            if timeout == 0 {
                return;
            }
            let idle = steady_ms().saturating_sub(core.last_recv.load(Ordering::SeqCst));
            if idle >= timeout {
                log::debug!("socket {} idle for {}ms, closing", core.id.value(), idle);
                RawSocket { core: core.clone() }.close();
                return;
            }
            Self::arm_idle_timer(&core, timeout.max(5) / 5);
        });
    }

    fn arm_default_timeout(&self) {
        self.core.last_recv.store(steady_ms(), Ordering::SeqCst);
        if self.core.timeout_ms.load(Ordering::SeqCst) == 0 {
            if self.core.untrusted.load(Ordering::SeqCst) {
                self.set_timeout(UNTRUST_TIMEOUT_MS);
            } else {
                self.set_timeout(TRUST_TIMEOUT_MS);
            }
        }
    }

    // =========================================================================
    // Connect / security handshake
    // =========================================================================

    /// Resolve and connect synchronously; marks the handshake role client.
    pub fn connect(&self, host: &str, port: u16) -> NetResult<()> {
        self.core.client_role.store(true, Ordering::SeqCst);
        let peer = resolve(host, port)?;
        let stream = TcpStream::connect(peer)?;
        stream.set_nonblocking(true)?;
        let mut state = self.core.state.lock();
        state.server_name = Some(host.to_string());
        state.stream = Some(stream);
        Ok(())
    }

    /// Resolve and start a nonblocking connect; the handler runs on the
    /// owning executor when the connection is established or fails.
    pub fn async_connect<F>(&self, host: &str, port: u16, handler: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        self.core.client_role.store(true, Ordering::SeqCst);
        let peer = match resolve(host, port) {
            Ok(peer) => peer,
            Err(err) => {
                self.core.ios.post(move || handler(Err(err)));
                return;
            }
        };
        let domain = socket2::Domain::for_address(peer);
        let sock = match socket2::Socket::new(domain, socket2::Type::STREAM, None)
            .and_then(|s| s.set_nonblocking(true).map(|_| s))
        {
            Ok(sock) => sock,
            Err(err) => {
                self.core.ios.post(move || handler(Err(err.into())));
                return;
            }
        };
        let pending = match sock.connect(&peer.into()) {
            Ok(()) => false,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(err) => {
                self.core.ios.post(move || handler(Err(err.into())));
                return;
            }
        };
        let stream: TcpStream = sock.into();
        let fd = stream.as_raw_fd();
        {
            let mut state = self.core.state.lock();
            state.server_name = Some(host.to_string());
            state.stream = Some(stream);
        }
        if !pending {
            self.core.ios.post(move || handler(Ok(())));
            return;
        }
        let this = self.clone();
        let armed = self.core.ios.arm(
            fd,
            self.core.token,
            Interest::WRITABLE,
            Box::new(move |ready| {
                if let Err(err) = ready {
                    handler(Err(err));
                    return;
                }
                let error = this
                    .core
                    .state
                    .lock()
                    .stream
                    .as_ref()
                    .and_then(|s| s.take_error().ok().flatten());
                match error {
                    Some(err) => handler(Err(err.into())),
                    None => handler(Ok(())),
                }
            }),
        );
        if let Err((err, callback)) = armed {
            self.core.ios.post(move || callback(Err(err)));
        }
    }

    /// Perform the security handshake in the configured role; a no-op on
    /// plaintext sockets.
    pub fn handshake(&self) -> NetResult<()> {
        #[cfg(feature = "tls")]
        {
            let client = self.is_client();
            let (context, server_name, fd) = {
                let state = self.core.state.lock();
                (
                    state.tls_context.clone(),
                    state.server_name.clone(),
                    state.fd(),
                )
            };
            let context = match context {
                Some(context) => context,
                None => return Ok(()),
            };
            let fd = fd.ok_or(NetError::Closed)?;
            let mut session = context.new_session(client, server_name.as_deref())?;
            loop {
                let result = {
                    let mut state = self.core.state.lock();
                    let stream = state.stream.as_mut().ok_or(NetError::Closed)?;
                    session.complete_io(stream)
                };
                match result {
                    Ok(()) => break,
                    Err(err) if NetError::would_block(&err) => {
                        let interest = if session.wants_write() {
                            Interest::WRITABLE
                        } else {
                            Interest::READABLE
                        };
                        wait_fd(fd, interest, None)?;
                    }
                    Err(err) => return Err(NetError::Tls(err.to_string())),
                }
            }
            self.core.state.lock().tls = Some(session);
            Ok(())
        }
        #[cfg(not(feature = "tls"))]
        {
            Ok(())
        }
    }

    /// Asynchronous security handshake; plaintext sockets complete
    /// immediately through a posted callback.
    pub fn async_handshake<F>(&self, handler: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        #[cfg(feature = "tls")]
        {
            let client = self.is_client();
            let (context, server_name) = {
                let state = self.core.state.lock();
                (state.tls_context.clone(), state.server_name.clone())
            };
            let context = match context {
                Some(context) => context,
                None => {
                    self.core.ios.post(move || handler(Ok(())));
                    return;
                }
            };
            let session = match context.new_session(client, server_name.as_deref()) {
                Ok(session) => session,
                Err(err) => {
                    self.core.ios.post(move || handler(Err(err)));
                    return;
                }
            };
            self.core.state.lock().tls = Some(session);
            let this = self.clone();
            self.core.ios.post(move || {
                this.drive_tls_handshake(Box::new(handler));
            });
            return;
        }
        #[cfg(not(feature = "tls"))]
        {
            self.core.ios.post(move || handler(Ok(())));
        }
    }

    #[cfg(feature = "tls")]
    fn drive_tls_handshake(&self, handler: Box<dyn FnOnce(NetResult<()>) + Send>) {
        let step = {
            let mut state = self.core.state.lock();
            let fd = state.fd();
            let state = &mut *state;
            let (stream, tls) = match (&mut state.stream, &mut state.tls) {
                (Some(stream), Some(tls)) => (stream, tls),
                _ => {
                    drop(state);
                    self.core.ios.post(move || handler(Err(NetError::Closed)));
                    return;
                }
            };
            if !tls.is_handshaking() {
                Ok(None)
            } else {
                match tls.complete_io(stream) {
                    Ok(()) => Ok(None),
                    Err(err) if NetError::would_block(&err) => {
                        let interest = if tls.wants_write() {
                            Interest::WRITABLE
                        } else {
                            Interest::READABLE
                        };
                        Ok(Some((fd, interest)))
                    }
                    Err(err) => Err(NetError::Tls(err.to_string())),
                }
            }
        };
        match step {
            Ok(None) => handler(Ok(())),
            Err(err) => handler(Err(err)),
            Ok(Some((Some(fd), interest))) => {
                let this = self.clone();
                let armed = self.core.ios.arm(
                    fd,
                    self.core.token,
                    interest,
                    Box::new(move |ready| match ready {
                        Ok(()) => this.drive_tls_handshake(handler),
                        Err(err) => handler(Err(err)),
                    }),
                );
                if let Err((err, callback)) = armed {
                    self.core.ios.post(move || callback(Err(err)));
                }
            }
            Ok(Some((None, _))) => handler(Err(NetError::Closed)),
        }
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Blocking read of up to `max` bytes through the layered stream.
    pub fn read_some(&self, buf: &mut [u8]) -> NetResult<usize> {
        loop {
            let (result, fd) = {
                let mut state = self.core.state.lock();
                let fd = state.fd().ok_or(NetError::Closed)?;
                (state.read_some(buf), fd)
            };
            match result {
                Ok(n) => {
                    self.core.last_recv.store(steady_ms(), Ordering::SeqCst);
                    return Ok(n);
                }
                Err(err) if NetError::would_block(&err) => {
                    wait_fd(fd, Interest::READABLE, None)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Nonblocking read armed on the owning executor. On first use the idle
    /// timer starts with the trusted or untrusted default. A read of zero
    /// bytes reports the peer's close as an error.
    pub fn async_read_some<F>(&self, max: usize, handler: F)
    where
        F: FnOnce(NetResult<Vec<u8>>) + Send + 'static,
    {
        self.arm_default_timeout();
        self.arm_read(max, Box::new(handler));
    }

    fn arm_read(&self, max: usize, handler: Box<dyn FnOnce(NetResult<Vec<u8>>) + Send>) {
        let fd = match self.core.state.lock().fd() {
            Some(fd) => fd,
            None => {
                self.core.ios.post(move || handler(Err(NetError::Closed)));
                return;
            }
        };
        let this = self.clone();
        let armed = self.core.ios.arm(
            fd,
            self.core.token,
            Interest::READABLE,
            Box::new(move |ready| {
                if let Err(err) = ready {
                    handler(Err(err));
                    return;
                }
                let mut buf = vec![0u8; max];
                let result = this.core.state.lock().read_some(&mut buf);
                match result {
                    Ok(0) => handler(Err(NetError::Closed)),
                    Ok(n) => {
                        this.core.last_recv.store(steady_ms(), Ordering::SeqCst);
                        buf.truncate(n);
                        handler(Ok(buf));
                    }
                    Err(err) if NetError::would_block(&err) => {
                        this.arm_read(max, handler);
                    }
                    Err(err) => handler(Err(err.into())),
                }
            }),
        );
        if let Err((err, callback)) = armed {
            self.core.ios.post(move || callback(Err(err)));
        }
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Blocking write of the whole buffer; returns the byte count.
    pub fn send(&self, data: &[u8]) -> NetResult<usize> {
        let mut written = 0;
        while written < data.len() {
            let (result, fd) = {
                let mut state = self.core.state.lock();
                let fd = state.fd().ok_or(NetError::Closed)?;
                let slice = [IoSlice::new(&data[written..])];
                (state.write_vectored(&slice), fd)
            };
            match result {
                Ok(n) => written += n,
                Err(err) if NetError::would_block(&err) => {
                    wait_fd(fd, Interest::WRITABLE, None)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        // Drain any ciphertext the security layer still buffers.
        loop {
            let (result, fd) = {
                let mut state = self.core.state.lock();
                let fd = state.fd().ok_or(NetError::Closed)?;
                if !state.needs_flush() {
                    break;
                }
                (state.pump_flush(), fd)
            };
            match result {
                Ok(()) => {}
                Err(err) if NetError::would_block(&err) => {
                    wait_fd(fd, Interest::WRITABLE, None)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(written)
    }

    /// Queue an asynchronous send. The caller's bytes are always copied and
    /// the enqueue happens on the owning executor; if the queue was empty
    /// the flush starts immediately, otherwise the buffer waits its turn.
    pub fn async_send<F>(&self, data: &[u8], handler: F)
    where
        F: FnOnce(NetResult<usize>) + Send + 'static,
    {
        let owned = data.to_vec();
        let core = self.core.clone();
        self.core.ios.post(move || {
            Self::wait_send(
                &core,
                SendNode {
                    data: owned,
                    handler: Some(Box::new(handler)),
                },
            );
        });
    }

    fn wait_send(core: &Arc<SocketCore>, node: SendNode) {
        let start_flush = {
            let mut queue = core.send_queue.lock();
            queue.push_back(node);
            queue.len() == 1
        };
        if start_flush {
            Self::flush_next(core);
        }
    }

    /// Begin or continue flushing the send queue. Runs on the executor
    /// thread only.
    fn flush_next(core: &Arc<SocketCore>) {
        if core.closed.load(Ordering::SeqCst) && core.state.lock().stream.is_none() {
            Self::clear_queue(core);
            return;
        }
        let batch: (usize, usize) = {
            let queue = core.send_queue.lock();
            if queue.is_empty() {
                if core.closed.load(Ordering::SeqCst) {
                    Self::finish_close(core);
                }
                return;
            }
            (queue.len(), queue.iter().map(|n| n.data.len()).sum())
        };
        if core.flushing.swap(true, Ordering::SeqCst) {
            return; // a write is already in flight
        }
        Self::drive_flush(core.clone(), batch.0, batch.1, 0);
    }

    fn drive_flush(core: Arc<SocketCore>, batch_count: usize, batch_total: usize, mut written: usize) {
        loop {
            let (result, fd) = {
                let queue = core.send_queue.lock();
                let mut state = core.state.lock();
                let fd = match state.fd() {
                    Some(fd) => fd,
                    None => {
                        drop(state);
                        drop(queue);
                        core.flushing.store(false, Ordering::SeqCst);
                        Self::fail_front(&core, NetError::Closed);
                        return;
                    }
                };
                let mut slices = Vec::with_capacity(batch_count);
                let mut skip = written;
                for node in queue.iter().take(batch_count) {
                    if skip >= node.data.len() {
                        skip -= node.data.len();
                        continue;
                    }
                    slices.push(IoSlice::new(&node.data[skip..]));
                    skip = 0;
                }
                (state.write_vectored(&slices), fd)
            };
            match result {
                Ok(n) => {
                    written += n;
                    if written >= batch_total {
                        core.flushing.store(false, Ordering::SeqCst);
                        Self::complete_batch(&core, batch_count, batch_total);
                        Self::flush_next(&core); // pick up late arrivals
                        return;
                    }
                }
                Err(err) if NetError::would_block(&err) => {
                    let next = core.clone();
                    let armed = core.ios.arm(
                        fd,
                        core.token,
                        Interest::WRITABLE,
                        Box::new(move |ready| match ready {
                            Ok(()) => Self::drive_flush(next.clone(), batch_count, batch_total, written),
                            Err(err) => {
                                next.flushing.store(false, Ordering::SeqCst);
                                Self::fail_front(&next, err);
                            }
                        }),
                    );
                    if let Err((err, _callback)) = armed {
                        core.flushing.store(false, Ordering::SeqCst);
                        Self::fail_front(&core, err);
                    }
                    return;
                }
                Err(err) => {
                    core.flushing.store(false, Ordering::SeqCst);
                    Self::fail_front(&core, err.into());
                    return;
                }
            }
        }
    }

    /// On write error only the front-most pending callback is notified;
    /// whatever else is queued is abandoned on the next clear.
    fn fail_front(core: &Arc<SocketCore>, err: NetError) {
        let handler = {
            let mut queue = core.send_queue.lock();
            queue.front_mut().and_then(|node| node.handler.take())
        };
        if let Some(handler) = handler {
            handler(Err(err));
        }
    }

    /// Walk the queue front to back, paying out each node's share of the
    /// accounted byte total.
    fn complete_batch(core: &Arc<SocketCore>, batch_count: usize, mut total: usize) {
        let mut completed = Vec::new();
        {
            let mut queue = core.send_queue.lock();
            for _ in 0..batch_count {
                if total == 0 {
                    break;
                }
                let node = match queue.pop_front() {
                    Some(node) => node,
                    None => break,
                };
                let size = node.data.len();
                total = total.saturating_sub(size);
                completed.push((node.handler, size));
            }
        }
        for (handler, size) in completed {
            if let Some(handler) = handler {
                handler(Ok(size));
            }
        }
    }

    fn clear_queue(core: &Arc<SocketCore>) {
        let dropped = {
            let mut queue = core.send_queue.lock();
            let count = queue.len();
            queue.clear();
            count
        };
        if dropped > 0 {
            log::debug!("socket {}: abandoned {} unsent buffers", core.id.value(), dropped);
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Idempotent close. With no send in flight the transport closes now;
    /// otherwise the close is deferred until the queue drains. The idle
    /// timer is cancelled either way.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.timer.cancel();
        if self.is_idle() {
            Self::finish_close(&self.core);
        }
    }

    /// Post the close onto the owning executor.
    pub fn async_close(&self) {
        let this = self.clone();
        self.core.ios.post(move || this.close());
    }

    fn finish_close(core: &Arc<SocketCore>) {
        Self::clear_queue(core);
        let callbacks = core.ios.disarm(core.token);
        {
            let mut state = core.state.lock();
            #[cfg(feature = "tls")]
            {
                let state = &mut *state;
                if let (Some(tls), Some(stream)) = (state.tls.as_mut(), state.stream.as_mut()) {
                    tls.close(stream);
                }
                state.tls = None;
            }
            state.stream = None;
        }
        for callback in callbacks {
            core.ios.post(move || callback(Err(NetError::Closed)));
        }
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        // Last reference gone: purge unsent buffers. The descriptor closes
        // with the TcpStream.
        self.send_queue.lock().clear();
    }
}
