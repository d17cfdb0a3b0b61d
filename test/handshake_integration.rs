//! Upgrade handshake over real connections, including the RFC 6455 worked
//! example driven against the accepting server.

use ionet::{Executor, SocketFamily, SocketServer};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn spawn_loop(ios: &Executor) -> impl FnOnce() {
    let runner = ios.clone();
    let handle = std::thread::spawn(move || runner.run());
    let stopper = ios.clone();
    move || {
        stopper.stop();
        let _ = handle.join();
    }
}

fn start_ws_server() -> (SocketServer, u16, Arc<Mutex<Vec<ionet::Socket>>>, impl FnOnce()) {
    let ios = Executor::new().unwrap();
    let server = SocketServer::new(&ios, SocketFamily::WebSocket);
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    server
        .listen(0, "127.0.0.1", move |result| {
            if let Ok(peer) = result {
                sink.lock().push(peer);
            }
        })
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = spawn_loop(&ios);
    (server, port, accepted, stop)
}

fn read_head(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n == 1, "peer closed during response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[test]
fn server_answers_rfc_worked_example() {
    let (server, port, _accepted, stop) = start_ws_server();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);
    assert!(
        head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "head: {}",
        head
    );

    server.close();
    stop();
}

#[test]
fn server_rejects_missing_key_with_400() {
    let (server, port, accepted, stop) = start_ws_server();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "head: {}", head);
    assert!(accepted.lock().is_empty(), "failed handshake reached user code");

    server.close();
    stop();
}

#[test]
fn origin_is_mirrored_into_cors_headers() {
    let (server, port, _accepted, stop) = start_ws_server();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Origin: https://app.example\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut stream);
    assert!(head.contains("Access-Control-Allow-Origin: https://app.example"));
    assert!(head.contains("Access-Control-Allow-Credentials: true"));

    server.close();
    stop();
}

#[test]
fn forwarded_for_overrides_remote_endpoint() {
    let (server, port, accepted, stop) = start_ws_server();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              X-Forwarded-For: 203.0.113.9, 10.0.0.1\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while accepted.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let sockets = accepted.lock();
    let peer = sockets.first().expect("no accepted socket");
    let endpoint = peer.remote_endpoint().unwrap();
    assert_eq!(endpoint.ip().to_string(), "203.0.113.9");

    drop(sockets);
    server.close();
    stop();
}

#[test]
fn client_rejects_tampered_accept_key() {
    // A hand-rolled "server" that answers with the wrong accept value.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let join = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut sink = [0u8; 4096];
        let _ = stream.read(&mut sink).unwrap();
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n",
            )
            .unwrap();
        // Hold the connection open until the client gives up.
        std::thread::sleep(Duration::from_millis(200));
    });

    let ios = Executor::new().unwrap();
    let client = ionet::Socket::new(&ios, SocketFamily::WebSocket);
    client.connect("127.0.0.1", port).unwrap();
    let err = client.handshake().unwrap_err();
    assert!(matches!(err, ionet::NetError::Handshake(_)), "got {:?}", err);
    assert!(!client.is_handshaked());

    join.join().unwrap();
}
