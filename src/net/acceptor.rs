//! Listening and connection distribution.
//!
//! [`Acceptor`] wraps the listening descriptor. [`SocketServer`] composes it
//! with an executor pool: every accepted connection gets a fresh socket
//! bound to the least-loaded executor, the next accept is re-armed *before*
//! the new connection's handshake runs (so slow or half-open peers cannot
//! exhaust the backlog), and the user callback sees either a ready socket or
//! the handshake error.

use crate::error::{NetError, NetResult};
use crate::executor::{next_token, Executor, Interest, Token};
use crate::ident::Ident;
use crate::net::resolve;
#[cfg(feature = "tls")]
use crate::net::tls::TlsContext;
use crate::net::{wait_fd, Socket, SocketFamily};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct AcceptorCore {
    id: Ident,
    ios: Executor,
    token: Token,
    listener: Mutex<Option<socket2::Socket>>,
    open: AtomicBool,
}

/// Reference-counted listener bound to an executor.
#[derive(Clone)]
pub struct Acceptor {
    core: Arc<AcceptorCore>,
}

impl Acceptor {
    pub fn new(ios: &Executor) -> Acceptor {
        Acceptor {
            core: Arc::new(AcceptorCore {
                id: Ident::acquire(),
                ios: ios.clone(),
                token: next_token(),
                listener: Mutex::new(None),
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.core.id.value()
    }

    pub fn get_executor(&self) -> Executor {
        self.core.ios.clone()
    }

    pub fn is_open(&self) -> bool {
        self.core.open.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        let guard = self.core.listener.lock();
        let listener = guard.as_ref().ok_or(NetError::Closed)?;
        let addr = listener.local_addr()?;
        addr.as_socket()
            .ok_or_else(|| NetError::Resolve("non-inet local address".to_string()))
    }

    /// Bind (with address reuse) and listen. An empty host binds the
    /// wildcard address.
    pub fn listen(&self, port: u16, host: &str) -> NetResult<()> {
        let local = resolve(host, port)?;
        let domain = socket2::Domain::for_address(local);
        let listener = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        listener.set_reuse_address(true)?;
        listener.bind(&local.into())?;
        listener.listen(libc::SOMAXCONN)?;
        listener.set_nonblocking(true)?;
        *self.core.listener.lock() = Some(listener);
        self.core.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.core.listener.lock().as_ref().map(|l| l.as_raw_fd())
    }

    fn try_accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let guard = self.core.listener.lock();
        let listener = guard
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let (stream, addr) = listener.accept()?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;
        Ok((stream.into(), peer))
    }

    /// Blocking accept.
    pub fn accept(&self) -> NetResult<(TcpStream, SocketAddr)> {
        loop {
            let fd = self.raw_fd().ok_or(NetError::Closed)?;
            match self.try_accept() {
                Ok(accepted) => return Ok(accepted),
                Err(err) if NetError::would_block(&err) => {
                    wait_fd(fd, Interest::READABLE, None)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Arm a one-shot asynchronous accept on the owning executor.
    pub fn async_accept<F>(&self, handler: F)
    where
        F: FnOnce(NetResult<(TcpStream, SocketAddr)>) + Send + 'static,
    {
        self.arm_accept(Box::new(handler));
    }

    fn arm_accept(&self, handler: Box<dyn FnOnce(NetResult<(TcpStream, SocketAddr)>) + Send>) {
        let fd = match self.raw_fd() {
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
                match this.try_accept() {
                    Ok(accepted) => handler(Ok(accepted)),
                    Err(err) if NetError::would_block(&err) => this.arm_accept(handler),
                    Err(err) => handler(Err(err.into())),
                }
            }),
        );
        if let Err((err, callback)) = armed {
            self.core.ios.post(move || callback(Err(err)));
        }
    }

    /// Close the listening handle. Connections already accepted and in
    /// their handshake are unaffected.
    pub fn close(&self) {
        self.core.open.store(false, Ordering::SeqCst);
        let callbacks = self.core.ios.disarm(self.core.token);
        *self.core.listener.lock() = None;
        for callback in callbacks {
            self.core.ios.post(move || callback(Err(NetError::Closed)));
        }
    }
}

type AcceptHandler = Arc<dyn Fn(NetResult<Socket>) + Send + Sync>;

struct ServerCore {
    acceptor: Acceptor,
    family: SocketFamily,
    #[cfg(feature = "tls")]
    tls: Option<TlsContext>,
    executors: Mutex<Vec<Executor>>,
}

/// Accepting server that load-balances connections across an executor pool
/// and completes each connection's handshake before handing it to user
/// code.
#[derive(Clone)]
pub struct SocketServer {
    core: Arc<ServerCore>,
}

impl SocketServer {
    pub fn new(ios: &Executor, family: SocketFamily) -> SocketServer {
        SocketServer {
            core: Arc::new(ServerCore {
                acceptor: Acceptor::new(ios),
                family,
                #[cfg(feature = "tls")]
                tls: None,
                executors: Mutex::new(Vec::new()),
            }),
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(ios: &Executor, context: &TlsContext, family: SocketFamily) -> SocketServer {
        SocketServer {
            core: Arc::new(ServerCore {
                acceptor: Acceptor::new(ios),
                family,
                tls: Some(context.clone()),
                executors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The underlying listener.
    pub fn native_handle(&self) -> Acceptor {
        self.core.acceptor.clone()
    }

    /// Add an executor to the accept distribution pool.
    pub fn add_executor(&self, ios: &Executor) {
        self.core.executors.lock().push(ios.clone());
    }

    pub fn is_open(&self) -> bool {
        self.core.acceptor.is_open()
    }

    pub fn close(&self) {
        self.core.acceptor.close();
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.core.acceptor.local_addr()
    }

    /// Least-loaded executor from the pool; first seen wins ties, and an
    /// empty pool falls back to the acceptor's own executor.
    fn next_executor(&self) -> Executor {
        let pool = self.core.executors.lock();
        let mut next: Option<&Executor> = None;
        for ios in pool.iter() {
            match next {
                None => next = Some(ios),
                Some(best) if ios.load() < best.load() => next = Some(ios),
                Some(_) => {}
            }
        }
        next.cloned()
            .unwrap_or_else(|| self.core.acceptor.get_executor())
    }

    fn make_socket(&self, ios: &Executor) -> Socket {
        #[cfg(feature = "tls")]
        if let Some(context) = self.core.tls.as_ref() {
            return Socket::with_tls(ios, context, self.core.family);
        }
        Socket::new(ios, self.core.family)
    }

    /// Bind, listen, and arm the first accept. The handler is invoked once
    /// per connection with the handshaken socket or the failure.
    pub fn listen<F>(&self, port: u16, host: &str, handler: F) -> NetResult<()>
    where
        F: Fn(NetResult<Socket>) + Send + Sync + 'static,
    {
        self.core.acceptor.listen(port, host)?;
        self.accept_next(Arc::new(handler));
        Ok(())
    }

    fn accept_next(&self, handler: AcceptHandler) {
        let ios = self.next_executor();
        let socket = self.make_socket(&ios);
        let server = self.clone();
        self.core.acceptor.async_accept(move |result| {
            // Re-arm before anything else: the next accept must not wait on
            // this connection's handshake (half-open connection defense).
            if server.is_open() {
                server.accept_next(handler.clone());
            }
            match result {
                Err(err) => handler(Err(err)),
                Ok((stream, _peer)) => {
                    if let Err(err) = socket.attach(stream) {
                        handler(Err(err));
                        return;
                    }
                    let acceptor_ios = server.core.acceptor.get_executor();
                    let peer_ios = socket.get_executor();
                    let accepted = socket.clone();
                    peer_ios.post(move || {
                        let done = accepted.clone();
                        accepted.async_handshake(move |hs| {
                            acceptor_ios.post(move || match hs {
                                Ok(()) => handler(Ok(done)),
                                Err(err) => handler(Err(err)),
                            });
                        });
                    });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn listen_and_close() {
        let ios = Executor::new().unwrap();
        let acceptor = Acceptor::new(&ios);
        acceptor.listen(0, "127.0.0.1").unwrap();
        assert!(acceptor.is_open());
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        acceptor.close();
        assert!(!acceptor.is_open());
    }

    #[test]
    fn sync_accept_receives_connection() {
        let ios = Executor::new().unwrap();
        let acceptor = Acceptor::new(&ios);
        acceptor.listen(0, "127.0.0.1").unwrap();
        let port = acceptor.local_addr().unwrap().port();

        let join = std::thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap());
        let (_stream, peer) = acceptor.accept().unwrap();
        assert!(peer.ip().is_loopback());
        join.join().unwrap();
    }

    #[test]
    fn least_loaded_pick_prefers_light_executor() {
        let ios = Executor::new().unwrap();
        let server = SocketServer::new(&ios, SocketFamily::Native);
        let light = Executor::new().unwrap();
        let heavy = Executor::new().unwrap();
        server.add_executor(&heavy);
        server.add_executor(&light);

        // Weigh down the first executor with extra handles.
        let _ballast: Vec<Executor> = (0..4).map(|_| heavy.clone()).collect();
        assert!(server.next_executor().same(&light));
    }

    #[test]
    fn empty_pool_falls_back_to_acceptor_executor() {
        let ios = Executor::new().unwrap();
        let server = SocketServer::new(&ios, SocketFamily::Native);
        assert!(server.next_executor().same(&ios));
    }

    #[test]
    fn ties_keep_first_executor() {
        let ios = Executor::new().unwrap();
        let server = SocketServer::new(&ios, SocketFamily::Native);
        let first = Executor::new().unwrap();
        let second = Executor::new().unwrap();
        server.add_executor(&first);
        server.add_executor(&second);
        assert!(server.next_executor().same(&first));
    }

    #[test]
    fn accepted_native_socket_reaches_handler() {
        let ios = Executor::new().unwrap();
        let server = SocketServer::new(&ios, SocketFamily::Native);
        let accepted = Arc::new(Mutex::new(None));
        let slot = accepted.clone();
        server
            .listen(0, "127.0.0.1", move |result| {
                *slot.lock() = Some(result.map(|s| s.id()));
            })
            .unwrap();
        let port = server.local_addr().unwrap().port();

        let client = std::thread::spawn(move || {
            let _stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while accepted.lock().is_none() && std::time::Instant::now() < deadline {
            ios.run_for(Duration::from_millis(50));
        }
        client.join().unwrap();
        let result = accepted.lock().take().expect("no accept callback");
        assert!(result.is_ok());
    }
}
