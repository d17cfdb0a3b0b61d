//! Socket layer: raw TCP, optional transport security, WebSocket framing,
//! and the accepting server.
//!
//! Layering mirrors the wire: a [`RawSocket`] owns the TCP descriptor and an
//! optional TLS session; a [`Socket`] adds the WebSocket handshake and frame
//! codec on top, or passes straight through in native mode. All sockets are
//! bound to an [`Executor`](crate::Executor) at construction.

mod acceptor;
mod resolve;
mod socket;
mod tcp;
#[cfg(feature = "tls")]
mod tls;

pub use acceptor::{Acceptor, SocketServer};
pub use resolve::resolve;
pub use socket::{Socket, SocketFamily};
pub use tcp::RawSocket;
#[cfg(feature = "tls")]
pub use tls::TlsContext;

use crate::executor::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Block the calling thread until `fd` is ready for `interest` or the
/// timeout passes. Used by the synchronous operation paths only; the
/// reactor never calls this.
pub(crate) fn wait_fd(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<()> {
    let mut events: libc::c_short = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
    };
    loop {
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        return Ok(());
    }
}
