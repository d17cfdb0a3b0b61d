//! WebSocket protocol support: frame codec, HTTP upgrade handshake, and
//! optional per-message deflate.

#[cfg(feature = "deflate")]
pub mod deflate;
pub mod frame;
pub mod handshake;
pub mod http;

pub use frame::{Decoder, Encoder, Opcode};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;
