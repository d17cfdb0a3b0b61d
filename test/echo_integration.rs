//! Loopback integration: real sockets over 127.0.0.1.

use ionet::{Executor, RawSocket, SocketFamily, SocketServer};
use parking_lot::Mutex;
use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Run an executor loop on its own thread until the returned guard stops it.
fn spawn_loop(ios: &Executor) -> impl FnOnce() {
    let runner = ios.clone();
    let handle = std::thread::spawn(move || runner.run());
    let stopper = ios.clone();
    move || {
        stopper.stop();
        let _ = handle.join();
    }
}

#[test]
fn websocket_echo_round_trip() {
    let server_ios = Executor::new().unwrap();
    let server = SocketServer::new(&server_ios, SocketFamily::WebSocket);
    server
        .listen(0, "127.0.0.1", |result| {
            if let Ok(peer) = result {
                let echo = peer.clone();
                peer.async_receive(move |message| {
                    if let Ok(data) = message {
                        echo.async_send(&data, |_| {});
                    }
                });
            }
        })
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = spawn_loop(&server_ios);

    // Synchronous client: connect, upgrade, echo one message.
    let client_ios = Executor::new().unwrap();
    let client = ionet::Socket::new(&client_ios, SocketFamily::WebSocket);
    client.connect("127.0.0.1", port).unwrap();
    client.handshake().unwrap();
    assert!(client.is_handshaked());

    client.send(b"hello over websocket").unwrap();
    let message = client.receive().unwrap();
    assert_eq!(message, b"hello over websocket");

    client.close();
    server.close();
    stop();
}

#[test]
fn websocket_binary_payload_round_trips() {
    let server_ios = Executor::new().unwrap();
    let server = SocketServer::new(&server_ios, SocketFamily::WebSocket);
    server
        .listen(0, "127.0.0.1", |result| {
            if let Ok(peer) = result {
                let echo = peer.clone();
                peer.async_receive(move |message| {
                    if let Ok(data) = message {
                        echo.async_send(&data, |_| {});
                    }
                });
            }
        })
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = spawn_loop(&server_ios);

    let client_ios = Executor::new().unwrap();
    let client = ionet::Socket::new(&client_ios, SocketFamily::WebSocket);
    client.connect("127.0.0.1", port).unwrap();
    client.handshake().unwrap();

    // Not valid UTF-8: the opcode downgrades to binary and the bytes come
    // back unchanged.
    let payload: Vec<u8> = (0..=255).collect();
    client.send(&payload).unwrap();
    assert_eq!(client.receive().unwrap(), payload);

    client.close();
    server.close();
    stop();
}

#[test]
fn send_queue_preserves_order_and_accounts_bytes() {
    let ios = Executor::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let socket = RawSocket::new(&ios);
    socket.connect("127.0.0.1", port).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    let first = vec![b'A'; 64 * 1024];
    let second = vec![b'B'; 32 * 1024];
    let total = first.len() + second.len();

    let counts = Arc::new(Mutex::new(Vec::new()));
    let c1 = counts.clone();
    let c2 = counts.clone();
    socket.async_send(&first, move |result| {
        c1.lock().push(("first", result.unwrap()));
    });
    socket.async_send(&second, move |result| {
        c2.lock().push(("second", result.unwrap()));
    });

    let stop = spawn_loop(&ios);

    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 8192];
    while received.len() < total {
        let n = peer.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed early");
        received.extend_from_slice(&chunk[..n]);
    }
    stop();

    // Bytes of A arrive entirely before bytes of B.
    assert!(received[..first.len()].iter().all(|&b| b == b'A'));
    assert!(received[first.len()..].iter().all(|&b| b == b'B'));

    // Completion callbacks fired in order, each with its own payload size.
    let counts = counts.lock();
    assert_eq!(counts.as_slice(), &[("first", first.len()), ("second", second.len())]);
}

#[test]
fn idle_timeout_closes_silent_socket() {
    let ios = Executor::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let socket = RawSocket::new(&ios);
    socket.connect("127.0.0.1", port).unwrap();
    let (_peer, _) = listener.accept().unwrap();

    // 200ms timeout, checked every 40ms. The peer stays silent.
    socket.set_timeout(200);
    let read_error = Arc::new(AtomicUsize::new(0));
    let flag = read_error.clone();
    socket.async_read_some(1024, move |result| {
        if result.is_err() {
            flag.store(1, Ordering::SeqCst);
        }
    });

    let begin = Instant::now();
    while socket.is_open() && begin.elapsed() < Duration::from_secs(5) {
        ios.run_for(Duration::from_millis(50));
    }
    assert!(!socket.is_open(), "idle socket was not closed");
    assert!(begin.elapsed() >= Duration::from_millis(150));
    ios.poll();
    assert_eq!(read_error.load(Ordering::SeqCst), 1, "pending read saw no error");
}

#[test]
fn native_mode_passes_bytes_through() {
    let server_ios = Executor::new().unwrap();
    let server = SocketServer::new(&server_ios, SocketFamily::Native);
    server
        .listen(0, "127.0.0.1", |result| {
            if let Ok(peer) = result {
                let echo = peer.clone();
                peer.async_receive(move |message| {
                    if let Ok(data) = message {
                        echo.async_send(&data, |_| {});
                    }
                });
            }
        })
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = spawn_loop(&server_ios);

    let client_ios = Executor::new().unwrap();
    let client = ionet::Socket::new(&client_ios, SocketFamily::Native);
    client.connect("127.0.0.1", port).unwrap();
    client.handshake().unwrap(); // no-op for plaintext native sockets

    client.send(b"raw bytes").unwrap();
    let bytes = client.receive().unwrap();
    assert_eq!(bytes, b"raw bytes");

    client.close();
    server.close();
    stop();
}

#[test]
fn accepts_distribute_to_least_loaded_executor() {
    let acceptor_ios = Executor::new().unwrap();
    let pool: Vec<Executor> = (0..3).map(|_| Executor::new().unwrap()).collect();
    let server = SocketServer::new(&acceptor_ios, SocketFamily::Native);
    for ios in &pool {
        server.add_executor(ios);
    }
    // Weigh down the first two with ballast handles.
    let _ballast: Vec<Executor> = (0..10)
        .flat_map(|_| [pool[0].clone(), pool[1].clone()])
        .collect();

    let assigned = Arc::new(Mutex::new(Vec::new()));
    let sink = assigned.clone();
    server
        .listen(0, "127.0.0.1", move |result| {
            if let Ok(peer) = result {
                sink.lock().push(peer.get_executor().id());
            }
        })
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = spawn_loop(&acceptor_ios);
    let stop_pool: Vec<_> = pool.iter().map(spawn_loop).collect();

    let streams: Vec<_> = (0..2)
        .map(|_| std::net::TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();
    let deadline = Instant::now() + Duration::from_secs(5);
    while assigned.lock().len() < streams.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    server.close();
    stop();
    for stop in stop_pool {
        stop();
    }

    let assigned = assigned.lock();
    assert_eq!(assigned.len(), 2);
    // Both land on the lightest executor (accepted sockets stay bound to
    // it, but ballast keeps the others strictly heavier).
    for id in assigned.iter() {
        assert_eq!(*id, pool[2].id());
    }
}
