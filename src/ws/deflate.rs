//! Per-message deflate (RFC 7692, no context takeover).
//!
//! Each message is compressed as an independent raw-deflate stream; nothing
//! carries over between messages, matching the
//! `client_no_context_takeover` parameters this implementation negotiates.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Compress one message payload.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Decompress one message payload, refusing to inflate past `limit` bytes
/// (0 disables the cap).
pub fn decompress(data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    if limit == 0 {
        decoder.read_to_end(&mut out)?;
        return Ok(out);
    }
    let mut chunk = [0u8; 4096];
    loop {
        let n = decoder.read(&mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inflated message exceeds limit",
            ));
        }
        out.extend_from_slice(&chunk[..n]);
    }
}
