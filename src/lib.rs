//! ionet: embeddable asynchronous networking core.
//!
//! The runtime an embedding scripting layer builds on: reactor-based I/O
//! executors, reference-counted sockets layered raw TCP → optional TLS →
//! optional WebSocket framing, an accepting server that spreads connections
//! across an executor pool, and a topic-based RPC layer riding the same
//! executors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          RPC ROUTER                          │
//! │   declare/deliver/invoke · sequence correlation · sweep      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Socket (websocket | native)     SocketServer / Acceptor     │
//! │   upgrade handshake · codec       least-loaded distribution  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RawSocket: TCP (+ TLS) · send queue · idle timer            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Executor: epoll/kqueue reactor · timers · post/wait/wakeup  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ionet::{Executor, SocketFamily, SocketServer};
//!
//! let ios = Executor::new().unwrap();
//! let server = SocketServer::new(&ios, SocketFamily::WebSocket);
//! server
//!     .listen(8800, "", |result| match result {
//!         Ok(peer) => {
//!             let echo = peer.clone();
//!             peer.async_receive(move |message| {
//!                 if let Ok(data) = message {
//!                     echo.async_send(&data, |_| {});
//!                 }
//!             });
//!         }
//!         Err(err) => eprintln!("accept failed: {}", err),
//!     })
//!     .unwrap();
//! ios.run();
//! ```
//!
//! Every socket, timer and acceptor is bound to an [`Executor`] at
//! construction; executors are created explicitly and passed down rather
//! than discovered through ambient thread-local state.

pub mod config;
pub mod error;
pub mod executor;
pub mod ident;
pub mod net;
pub mod rpc;
pub mod ws;

pub use config::{Config, RpcConfig};
pub use error::{CloseCode, NetError, NetResult, RpcError};
pub use executor::{Executor, ReplySlot, SignalSet, Timer};
pub use net::{Acceptor, RawSocket, Socket, SocketFamily, SocketServer};
#[cfg(feature = "tls")]
pub use net::TlsContext;
pub use rpc::{EventKind, EventRecord, Responder, Router, Target};
