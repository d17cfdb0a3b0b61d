//! Message-oriented socket: WebSocket framing over the raw transport, or a
//! plain byte-stream in native mode.
//!
//! A [`Socket`] in websocket mode performs the HTTP Upgrade exchange after
//! the transport/security handshake, then frames every send and reassembles
//! every receive through the codec. In native mode reads and writes pass
//! straight through, while the HTTP request object stays available for
//! header access. Once a close frame is sent or received the socket is
//! closed and no further frames are processed.

use crate::config::{DEFAULT_MAX_PACKET, TRUST_TIMEOUT_MS};
use crate::error::{CloseCode, NetError, NetResult};
use crate::executor::Executor;
use crate::net::tcp::RawSocket;
#[cfg(feature = "tls")]
use crate::net::tls::TlsContext;
use crate::ws::frame::{self, Decoder, Encoder, Opcode};
use crate::ws::http::{self, Parse};
use crate::ws::handshake;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SCRATCH_SIZE: usize = 8192;

/// Socket personality chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    /// Plain byte stream; HTTP headers still available for request metadata.
    Native,
    /// Full WebSocket framing with upgrade handshake.
    WebSocket,
}

struct WsState {
    family: SocketFamily,
    opcode: Mutex<Opcode>,
    packets: Mutex<VecDeque<Vec<u8>>>,
    decoder: Mutex<Decoder>,
    encoder: Mutex<Encoder>,
    request: Mutex<http::Request>,
    response: Mutex<http::Response>,
    request_parser: Mutex<http::RequestParser>,
    response_parser: Mutex<http::ResponseParser>,
    handshaked: AtomicBool,
    compress: AtomicBool,
}

/// Reference-counted message socket. Clones share the connection.
#[derive(Clone)]
pub struct Socket {
    raw: RawSocket,
    ws: Arc<WsState>,
}

/// The lenient UTF-8 scan used to decide the text→binary opcode downgrade.
/// Deliberately looser than a strict validator (overlong encodings and
/// 5/6-byte sequences pass) for wire compatibility.
fn is_lenient_utf8(data: &[u8]) -> bool {
    let mut follow = 0u32;
    for &chr in data {
        if follow == 0 {
            if chr > 0x80 {
                if chr == 0xfc || chr == 0xfd {
                    follow = 5;
                } else if chr >= 0xf8 {
                    follow = 4;
                } else if chr >= 0xf0 {
                    follow = 3;
                } else if chr >= 0xe0 {
                    follow = 2;
                } else if chr >= 0xc0 {
                    follow = 1;
                } else {
                    return false;
                }
            }
        } else {
            follow -= 1;
            if chr & 0xC0 != 0x80 {
                return false;
            }
        }
    }
    follow == 0
}

enum Decoded {
    Message(Vec<u8>, Opcode, bool),
    Ping(Vec<u8>),
    Close(Vec<u8>),
}

impl Socket {
    pub fn new(ios: &Executor, family: SocketFamily) -> Socket {
        Self::finish_build(RawSocket::new(ios), family)
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(ios: &Executor, context: &TlsContext, family: SocketFamily) -> Socket {
        Self::finish_build(RawSocket::with_tls(ios, context), family)
    }

    fn finish_build(raw: RawSocket, family: SocketFamily) -> Socket {
        let ws = Arc::new(WsState {
            family,
            opcode: Mutex::new(Opcode::Text),
            packets: Mutex::new(VecDeque::new()),
            decoder: Mutex::new(Decoder::new(DEFAULT_MAX_PACKET)),
            encoder: Mutex::new(Encoder::new()),
            request: Mutex::new(http::Request::new()),
            response: Mutex::new(http::Response::new()),
            request_parser: Mutex::new(http::RequestParser::new()),
            response_parser: Mutex::new(http::ResponseParser::new()),
            handshaked: AtomicBool::new(false),
            compress: AtomicBool::new(false),
        });
        let socket = Socket { raw, ws };
        if family == SocketFamily::WebSocket {
            // Framing peers earn trust through the upgrade handshake.
            socket.raw.mark_untrusted();
            let weak_raw = socket.raw.downgrade();
            let weak_ws = Arc::downgrade(&socket.ws);
            socket.raw.set_tick_hook(Box::new(move || {
                if let (Some(raw), Some(ws)) = (weak_raw.upgrade(), weak_ws.upgrade()) {
                    if ws.handshaked.load(Ordering::SeqCst) {
                        Socket { raw, ws }.ping(&[]);
                    }
                }
            }));
        }
        socket
    }

    pub fn id(&self) -> u16 {
        self.raw.id()
    }

    pub fn get_executor(&self) -> Executor {
        self.raw.get_executor()
    }

    /// Access the raw transport beneath the framing layer.
    pub fn next_layer(&self) -> &RawSocket {
        &self.raw
    }

    pub fn is_websocket(&self) -> bool {
        self.ws.family == SocketFamily::WebSocket
    }

    /// Plain byte-stream socket with neither security nor framing.
    pub fn is_native(&self) -> bool {
        self.raw.is_native() && !self.is_websocket()
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_open()
    }

    pub fn is_handshaked(&self) -> bool {
        self.ws.handshaked.load(Ordering::SeqCst)
    }

    /// HTTP request headers: the upgrade request, or general request
    /// metadata on plain-HTTP native sockets.
    pub fn request_header(&self) -> MutexGuard<'_, http::Request> {
        self.ws.request.lock()
    }

    pub fn response_header(&self) -> MutexGuard<'_, http::Response> {
        self.ws.response.lock()
    }

    /// Peer address, honoring the first `X-Forwarded-For` entry when the
    /// originating request carries one.
    pub fn remote_endpoint(&self) -> NetResult<SocketAddr> {
        let mut peer = self.raw.peer_addr()?;
        let forwarded = self
            .ws
            .request
            .lock()
            .get_header("X-Forwarded-For")
            .map(|v| v.to_string());
        if let Some(list) = forwarded {
            let first = list.split(',').next().unwrap_or("").trim().to_string();
            if let Ok(ip) = first.parse::<IpAddr>() {
                peer.set_ip(ip);
            }
        }
        Ok(peer)
    }

    /// Adopt an accepted connection.
    pub(crate) fn attach(&self, stream: TcpStream) -> NetResult<()> {
        self.raw.attach(stream)
    }

    // =========================================================================
    // Connect
    // =========================================================================

    pub fn connect(&self, host: &str, port: u16) -> NetResult<()> {
        self.connect_with_uri(host, port, None)
    }

    pub fn connect_with_uri(&self, host: &str, port: u16, uri: Option<&str>) -> NetResult<()> {
        self.raw.connect(host, port)?;
        if self.is_websocket() {
            self.init_connect(host, port, uri);
        }
        Ok(())
    }

    pub fn async_connect<F>(&self, host: &str, port: u16, handler: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        self.async_connect_with_uri(host, port, None, handler)
    }

    pub fn async_connect_with_uri<F>(&self, host: &str, port: u16, uri: Option<&str>, handler: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        if self.is_websocket() {
            self.init_connect(host, port, uri);
        }
        self.raw.async_connect(host, port, handler);
    }

    fn init_connect(&self, host: &str, port: u16, uri: Option<&str>) {
        let default_port = if self.raw.is_security() { 443 } else { 80 };
        let host_header = if port != default_port {
            format!("{}:{}", host, port)
        } else {
            host.to_string()
        };
        let mut request = self.ws.request.lock();
        if let Some(uri) = uri {
            request.uri = uri.to_string();
        }
        request.set_header("Host", host_header);
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Transport security handshake followed by the WebSocket upgrade when
    /// in websocket mode. Blocking.
    pub fn handshake(&self) -> NetResult<()> {
        self.raw.handshake()?;
        if self.is_websocket() {
            self.ws_handshake()?;
        }
        Ok(())
    }

    pub fn async_handshake<F>(&self, handler: F)
    where
        F: FnOnce(NetResult<()>) + Send + 'static,
    {
        let this = self.clone();
        self.raw.async_handshake(move |result| match result {
            Err(err) => handler(Err(err)),
            Ok(()) if !this.is_websocket() => handler(Ok(())),
            Ok(()) => this.async_ws_handshake(Box::new(handler)),
        });
    }

    fn ws_handshake(&self) -> NetResult<()> {
        if self.raw.is_client() {
            self.send_request()?;
            let leftover = self.read_response_blocking()?;
            {
                let response = self.ws.response.lock();
                let request = self.ws.request.lock();
                if !handshake::check_response(&response, &request) {
                    return Err(NetError::Handshake("accept key mismatch".to_string()));
                }
            }
            self.complete_handshake();
            if !leftover.is_empty() {
                self.decode_bytes(&leftover)
                    .map_err(|code| NetError::Protocol(CloseCode::normalize(code)))?;
            }
            Ok(())
        } else {
            self.read_request_blocking()?;
            self.finish_server_handshake()
        }
    }

    fn async_ws_handshake(&self, handler: Box<dyn FnOnce(NetResult<()>) + Send>) {
        if self.raw.is_client() {
            match self.send_request() {
                Err(err) => handler(Err(err)),
                Ok(()) => self.async_read_response(handler),
            }
        } else {
            self.async_read_request(handler);
        }
    }

    fn send_request(&self) -> NetResult<()> {
        self.ws.decoder.lock().set_client();
        self.ws.encoder.lock().set_client();
        let wire = {
            let mut request = self.ws.request.lock();
            handshake::init_request(&mut request);
            request.to_wire()
        };
        self.raw.send(wire.as_bytes())?;
        Ok(())
    }

    /// Build and send the server's response; promotes the peer to trusted
    /// on a 101.
    fn finish_server_handshake(&self) -> NetResult<()> {
        let (wire, status) = {
            let request = self.ws.request.lock();
            let mut response = self.ws.response.lock();
            handshake::init_response(101, &mut response, &request);
            (response.to_wire(), response.status)
        };
        self.raw.send(wire.as_bytes())?;
        if status != 101 {
            return Err(NetError::Handshake(format!("upgrade refused ({})", status)));
        }
        self.complete_handshake();
        Ok(())
    }

    fn complete_handshake(&self) {
        self.ws.handshaked.store(true, Ordering::SeqCst);
        let compress = handshake::deflate_negotiated(&self.ws.response.lock());
        self.ws.compress.store(compress, Ordering::SeqCst);
        self.raw.set_timeout(TRUST_TIMEOUT_MS);
    }

    fn read_request_blocking(&self) -> NetResult<()> {
        let mut buf = [0u8; SCRATCH_SIZE];
        loop {
            let n = self.raw.read_some(&mut buf)?;
            if n == 0 {
                return Err(NetError::Closed);
            }
            let parse = {
                let mut request = self.ws.request.lock();
                self.ws.request_parser.lock().parse(&mut request, &buf[..n])
            };
            match parse {
                Parse::Good(_) => return Ok(()),
                Parse::Indeterminate => continue,
                Parse::Bad => return Err(NetError::Handshake("bad upgrade request".to_string())),
            }
        }
    }

    fn read_response_blocking(&self) -> NetResult<Vec<u8>> {
        let mut buf = [0u8; SCRATCH_SIZE];
        loop {
            let n = self.raw.read_some(&mut buf)?;
            if n == 0 {
                return Err(NetError::Closed);
            }
            let parse = {
                let mut response = self.ws.response.lock();
                self.ws
                    .response_parser
                    .lock()
                    .parse(&mut response, &buf[..n])
            };
            match parse {
                Parse::Good(rest) => return Ok(rest),
                Parse::Indeterminate => continue,
                Parse::Bad => return Err(NetError::Handshake("bad upgrade response".to_string())),
            }
        }
    }

    fn async_read_request(&self, handler: Box<dyn FnOnce(NetResult<()>) + Send>) {
        let this = self.clone();
        self.raw.async_read_some(SCRATCH_SIZE, move |result| match result {
            Err(err) => handler(Err(err)),
            Ok(bytes) => {
                let parse = {
                    let mut request = this.ws.request.lock();
                    this.ws.request_parser.lock().parse(&mut request, &bytes)
                };
                match parse {
                    Parse::Bad => {
                        handler(Err(NetError::Handshake("bad upgrade request".to_string())))
                    }
                    Parse::Indeterminate => this.async_read_request(handler),
                    Parse::Good(_) => handler(this.finish_server_handshake()),
                }
            }
        });
    }

    fn async_read_response(&self, handler: Box<dyn FnOnce(NetResult<()>) + Send>) {
        let this = self.clone();
        self.raw.async_read_some(SCRATCH_SIZE, move |result| match result {
            Err(err) => handler(Err(err)),
            Ok(bytes) => {
                let parse = {
                    let mut response = this.ws.response.lock();
                    this.ws.response_parser.lock().parse(&mut response, &bytes)
                };
                match parse {
                    Parse::Bad => {
                        handler(Err(NetError::Handshake("bad upgrade response".to_string())))
                    }
                    Parse::Indeterminate => this.async_read_response(handler),
                    Parse::Good(rest) => {
                        let accepted = {
                            let response = this.ws.response.lock();
                            let request = this.ws.request.lock();
                            handshake::check_response(&response, &request)
                        };
                        if !accepted {
                            handler(Err(NetError::Handshake(
                                "accept key mismatch".to_string(),
                            )));
                            return;
                        }
                        this.complete_handshake();
                        let result = if rest.is_empty() {
                            Ok(())
                        } else {
                            this.decode_bytes(&rest)
                                .map_err(|code| NetError::Protocol(CloseCode::normalize(code)))
                        };
                        handler(result);
                    }
                }
            }
        });
    }

    // =========================================================================
    // Receive
    // =========================================================================

    fn next_packet(&self) -> Option<Vec<u8>> {
        self.ws.packets.lock().pop_front()
    }

    /// Blocking receive of the next message (websocket mode) or read chunk
    /// (native mode).
    pub fn receive(&self) -> NetResult<Vec<u8>> {
        let mut buf = [0u8; SCRATCH_SIZE];
        if !self.is_websocket() {
            let n = self.raw.read_some(&mut buf)?;
            if n == 0 {
                return Err(NetError::Closed);
            }
            return Ok(buf[..n].to_vec());
        }
        if let Some(packet) = self.next_packet() {
            return Ok(packet);
        }
        loop {
            let n = self.raw.read_some(&mut buf)?;
            if n == 0 {
                return Err(NetError::Closed);
            }
            if let Err(code) = self.decode_bytes(&buf[..n]) {
                self.close();
                return Err(NetError::Protocol(CloseCode::normalize(code)));
            }
            if let Some(packet) = self.next_packet() {
                return Ok(packet);
            }
        }
    }

    /// Asynchronous receive; drains the reassembly queue before touching
    /// the transport.
    pub fn async_receive<F>(&self, handler: F)
    where
        F: FnOnce(NetResult<Vec<u8>>) + Send + 'static,
    {
        Self::receive_loop(self.clone(), Box::new(handler));
    }

    fn receive_loop(this: Socket, handler: Box<dyn FnOnce(NetResult<Vec<u8>>) + Send>) {
        if !this.is_websocket() {
            this.raw.async_read_some(SCRATCH_SIZE, handler);
            return;
        }
        if let Some(packet) = this.next_packet() {
            this.get_executor().post(move || handler(Ok(packet)));
            return;
        }
        let socket = this.clone();
        this.raw.async_read_some(SCRATCH_SIZE, move |result| match result {
            Err(err) => handler(Err(err)),
            Ok(bytes) => match socket.decode_bytes(&bytes) {
                Err(code) => {
                    socket.close();
                    handler(Err(NetError::Protocol(CloseCode::normalize(code))));
                }
                Ok(()) => Self::receive_loop(socket, handler),
            },
        });
    }

    /// Feed raw bytes through the decoder and react to whatever completes:
    /// messages queue for delivery, pings echo a pong, a close frame runs
    /// the close handshake.
    fn decode_bytes(&self, data: &[u8]) -> Result<(), u16> {
        let mut decoded = Vec::new();
        let result = {
            let mut decoder = self.ws.decoder.lock();
            decoder.decode(data, |payload, opcode, compressed| match opcode {
                Opcode::Text | Opcode::Binary => {
                    decoded.push(Decoded::Message(payload, opcode, compressed))
                }
                Opcode::Ping => decoded.push(Decoded::Ping(payload)),
                Opcode::Close => decoded.push(Decoded::Close(payload)),
                Opcode::Continuation | Opcode::Pong => {}
            })
        };
        for action in decoded {
            match action {
                Decoded::Message(payload, opcode, compressed) => {
                    if opcode == Opcode::Binary {
                        *self.ws.opcode.lock() = Opcode::Binary;
                    }
                    self.push_packet(payload, compressed);
                }
                Decoded::Ping(payload) => self.pong(&payload),
                Decoded::Close(payload) => {
                    let code = frame::close_code(&payload).unwrap_or(0);
                    self.close_with_code(code);
                }
            }
        }
        result
    }

    fn push_packet(&self, payload: Vec<u8>, compressed: bool) {
        #[cfg(feature = "deflate")]
        if compressed {
            match crate::ws::deflate::decompress(&payload, DEFAULT_MAX_PACKET) {
                Ok(inflated) => self.ws.packets.lock().push_back(inflated),
                Err(err) => {
                    log::warn!("socket {}: inflate failed ({}), keeping raw", self.id(), err);
                    self.ws.packets.lock().push_back(payload);
                }
            }
            return;
        }
        let _ = compressed;
        self.ws.packets.lock().push_back(payload);
    }

    // =========================================================================
    // Send
    // =========================================================================

    fn make_op(&self, data: &[u8]) -> Opcode {
        let mut opcode = self.ws.opcode.lock();
        if *opcode == Opcode::Text && !is_lenient_utf8(data) {
            *opcode = Opcode::Binary;
        }
        *opcode
    }

    fn prepare_frame(&self, data: &[u8]) -> Vec<u8> {
        let opcode = self.make_op(data);
        #[cfg(feature = "deflate")]
        {
            if self.ws.compress.load(Ordering::SeqCst) {
                let packed = crate::ws::deflate::compress(data);
                return self.ws.encoder.lock().encode(&packed, opcode, true);
            }
        }
        self.ws.encoder.lock().encode(data, opcode, false)
    }

    /// Blocking send. In websocket mode the payload is framed (and
    /// compressed when negotiated); returns the payload size on success.
    pub fn send(&self, data: &[u8]) -> NetResult<usize> {
        if !self.is_websocket() {
            return self.raw.send(data);
        }
        let wire = self.prepare_frame(data);
        self.raw.send(&wire)?;
        Ok(data.len())
    }

    /// Asynchronous send through the raw socket's serialized queue.
    pub fn async_send<F>(&self, data: &[u8], handler: F)
    where
        F: FnOnce(NetResult<usize>) + Send + 'static,
    {
        if !self.is_websocket() {
            self.raw.async_send(data, handler);
            return;
        }
        let wire = self.prepare_frame(data);
        self.raw.async_send(&wire, handler);
    }

    // =========================================================================
    // Control frames / close
    // =========================================================================

    fn dispatch(&self, opcode: Opcode, data: &[u8]) {
        if !self.ws.handshaked.load(Ordering::SeqCst) {
            return;
        }
        let wire = self.ws.encoder.lock().encode(data, opcode, false);
        if self.raw.is_idle() {
            if let Err(err) = self.raw.send(&wire) {
                log::debug!("socket {}: control frame send failed: {}", self.id(), err);
            }
        } else {
            self.raw.async_send(&wire, |_| {});
        }
    }

    /// Unsolicited keep-alive probe.
    pub fn ping(&self, data: &[u8]) {
        self.dispatch(Opcode::Ping, data);
    }

    fn pong(&self, data: &[u8]) {
        self.dispatch(Opcode::Pong, data);
    }

    fn close_with_code(&self, code: u16) {
        let code = CloseCode::normalize(code);
        self.close_with(code.as_u16(), code.reason());
    }

    /// Send a close frame with the given status and reason, then close the
    /// transport.
    pub fn close_with(&self, code: u16, reason: &str) {
        let payload = frame::close_payload(code, reason);
        self.dispatch(Opcode::Close, &payload);
        self.raw.close();
    }

    /// Close the socket. In websocket mode the close frame's status derives
    /// from the decoder's latched error, normalized per the close-code
    /// policy.
    pub fn close(&self) {
        if !self.raw.is_open() {
            return;
        }
        if self.is_websocket() {
            let code = self.ws.decoder.lock().last_error();
            self.close_with_code(code);
        } else {
            self.raw.close();
        }
    }

    /// Post the close onto the owning executor.
    pub fn async_close(&self) {
        let this = self.clone();
        self.get_executor().post(move || this.close());
    }
}
