//! HTTP Upgrade handshake (RFC 6455 §4).
//!
//! Key derivation: `Sec-WebSocket-Accept` is the base64 of the SHA-1 of the
//! client key concatenated with the protocol GUID. The server mirrors an
//! `Origin` header into CORS headers and negotiates permessage-deflate when
//! offered and compiled in.

use crate::ws::http::{Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WS_VERSION: &str = "13";

fn use_extensions() -> bool {
    cfg!(feature = "deflate")
}

/// Derive the accept value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Fresh random client nonce.
pub fn request_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Fill in the upgrade request headers a client sends.
pub fn init_request(req: &mut Request) {
    req.method = "GET".to_string();
    req.version_major = 1;
    req.version_minor = 1;

    if req.get_header("User-Agent").is_none() {
        req.set_header("User-Agent", concat!("ionet/", env!("CARGO_PKG_VERSION")));
    }
    req.set_header("Cache-Control", "no-cache");
    req.set_header("Pragma", "no-cache");
    req.set_header("Connection", "Upgrade");
    req.set_header("Upgrade", "websocket");
    req.set_header("Sec-WebSocket-Key", request_key());
    req.set_header("Sec-WebSocket-Version", WS_VERSION);

    if use_extensions() {
        req.set_header(
            "Sec-WebSocket-Extensions",
            "permessage-deflate; client_max_window_bits",
        );
    }
}

/// Build the server's response for an upgrade request. A malformed request
/// or missing key downgrades the requested 101 to a 400 close.
pub fn init_response(status: u16, res: &mut Response, req: &Request) {
    let mut status = status;
    let mut key = String::new();
    if status == 101 {
        if !req.is_websocket_upgrade() {
            status = 400;
        } else {
            match req.get_header("Sec-WebSocket-Key") {
                Some(k) if !k.is_empty() => key = k.to_string(),
                _ => status = 400,
            }
        }
    }
    res.status = status;
    res.version_major = 1;
    res.version_minor = 1;
    if status != 101 {
        res.set_header("Cache-Control", "max-age=0");
        res.set_header("Pragma", "no-cache");
        res.set_header("Connection", "Close");
        return;
    }
    if let Some(origin) = req.get_header("Origin") {
        let origin = origin.to_string();
        res.set_header("Access-Control-Allow-Credentials", "true");
        res.set_header("Access-Control-Allow-Origin", origin);
    }
    if use_extensions() {
        if let Some(ext) = req.get_header("Sec-WebSocket-Extensions") {
            if ext.starts_with("permessage-deflate") {
                res.set_header(
                    "Sec-WebSocket-Extensions",
                    "permessage-deflate; client_no_context_takeover; server_max_window_bits=15",
                );
            }
        }
    }
    res.set_header("Connection", "Upgrade");
    res.set_header("Upgrade", "websocket");
    res.set_header("Sec-WebSocket-Accept", accept_key(&key));
}

/// Client-side validation of the server's 101.
pub fn check_response(res: &Response, req: &Request) -> bool {
    let key = req.get_header("Sec-WebSocket-Key").unwrap_or_default();
    let accept = res.get_header("Sec-WebSocket-Accept").unwrap_or_default();
    res.status == 101 && accept == accept_key(key)
}

/// Whether the exchanged response enables per-message compression.
pub fn deflate_negotiated(res: &Response) -> bool {
    use_extensions()
        && res
            .get_header("Sec-WebSocket-Extensions")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
}
