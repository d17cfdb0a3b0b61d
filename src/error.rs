//! Error taxonomy for the networking core.
//!
//! Three families of failures exist and stay distinguishable end to end:
//!
//! - transport errors (resolution, connect, I/O) carry the underlying cause;
//! - protocol errors (malformed frames, failed handshake validation,
//!   oversized messages) collapse to [`NetError::Protocol`] with a close
//!   code, and close the socket that produced them;
//! - RPC outcomes ([`RpcError`]) are returned to the caller, never raised.
//!
//! Errors are delivered through completion callbacks; nothing in this crate
//! throws across an asynchronous boundary.

use std::io;
use thiserror::Error;

/// WebSocket close status codes used by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// 1000 Normal Closure
    Normal = 1000,
    /// 1002 Protocol Error
    Protocol = 1002,
    /// 1003 Opcode Unsupported
    Unsupported = 1003,
    /// 1009 Packet Too Large
    TooLarge = 1009,
}

impl CloseCode {
    /// Normalize an arbitrary wire status code to the codes this
    /// implementation reports. Anything unrecognized becomes 1000.
    pub fn normalize(code: u16) -> CloseCode {
        match code {
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1009 => CloseCode::TooLarge,
            _ => CloseCode::Normal,
        }
    }

    /// Reason string sent in close frames for this code.
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Normal => "Normal Closure",
            CloseCode::Protocol => "Protocol Error",
            CloseCode::Unsupported => "Opcode Unsupported",
            CloseCode::TooLarge => "Packet Too Large",
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Transport and protocol errors surfaced by sockets, acceptors and
/// executors.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error ({})", .0.as_u16())]
    Protocol(CloseCode),

    #[error("socket closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

impl NetError {
    /// True for the protocol family (frame/handshake violations), false for
    /// transport failures.
    pub fn is_protocol(&self) -> bool {
        matches!(self, NetError::Protocol(_) | NetError::Handshake(_))
    }

    pub(crate) fn would_block(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted
    }
}

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

/// Outcomes of an RPC invocation that did not produce a reply payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No subscriber is registered for the topic.
    #[error("{0} not found")]
    NotFound(String),

    /// The invocation deadline elapsed before a response arrived.
    #[error("timeout")]
    Timeout,

    /// The caller's executor stopped while the call was parked.
    #[error("cancel")]
    Cancelled,

    /// The remote handler reported a failure.
    #[error("{0}")]
    Remote(String),
}
