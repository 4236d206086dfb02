//! End-to-end tests driving a real echo server over the reactor core.

use net::{ConnectionHandle, EventLoopThread, TcpServer};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct EchoServer {
    server: TcpServer,
    base: Option<EventLoopThread>,
    addr: SocketAddr,
    handles: Arc<Mutex<Vec<ConnectionHandle>>>,
}

impl EchoServer {
    fn start(threads: usize, idle_timeout: Option<Duration>) -> EchoServer {
        let base = EventLoopThread::spawn("echo-base".into()).unwrap();
        let mut server = TcpServer::new(base.handle(), "127.0.0.1:0".parse().unwrap(), "echo");
        server.set_thread_num(threads);
        server.set_idle_timeout(idle_timeout);

        let handles: Arc<Mutex<Vec<ConnectionHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let up_handles = handles.clone();
        server.set_connection_callback(Arc::new(move |conn, _| {
            if conn.connected() {
                up_handles.lock().unwrap().push(conn.handle());
            }
        }));
        server.set_message_callback(Arc::new(|conn, event_loop, _| {
            let n = conn.input_mut().readable_bytes();
            let data = conn.input_mut().retrieve_as_bytes(n);
            conn.send(event_loop, &data);
        }));

        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        EchoServer {
            server,
            base: Some(base),
            addr,
            handles,
        }
    }

    fn shutdown(mut self) {
        self.server.stop();
        if let Some(base) = self.base.take() {
            base.quit_and_join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn read_exact_or_eof(stream: &mut TcpStream, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) => panic!("read failed: {err}"),
        }
    }
    out
}

#[test]
fn echoes_bytes_back() {
    let server = EchoServer::start(1, None);
    let mut client = connect(server.addr);

    client.write_all(b"hello reactor").unwrap();
    assert_eq!(read_exact_or_eof(&mut client, 13), b"hello reactor");

    // Keep-alive: the same connection serves a second exchange.
    client.write_all(b"again").unwrap();
    assert_eq!(read_exact_or_eof(&mut client, 5), b"again");

    server.shutdown();
}

#[test]
fn serves_connections_across_the_pool() {
    let server = EchoServer::start(2, None);
    let mut clients: Vec<TcpStream> = (0..6).map(|_| connect(server.addr)).collect();

    for (i, client) in clients.iter_mut().enumerate() {
        let msg = format!("client-{i}");
        client.write_all(msg.as_bytes()).unwrap();
        assert_eq!(read_exact_or_eof(client, msg.len()), msg.as_bytes());
    }

    server.shutdown();
}

#[test]
fn connection_table_tracks_lifecycle() {
    let server = EchoServer::start(1, None);
    let client = connect(server.addr);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server.server.connection_count() != 1 {
        assert!(std::time::Instant::now() < deadline, "connection never registered");
        thread::sleep(Duration::from_millis(10));
    }

    drop(client);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server.server.connection_count() != 0 {
        assert!(std::time::Instant::now() < deadline, "connection never removed");
        thread::sleep(Duration::from_millis(10));
    }

    server.shutdown();
}

#[test]
fn cross_thread_send_is_ordered_and_safe() {
    let server = EchoServer::start(1, None);
    let mut client = connect(server.addr);

    // Wait for the connection callback to publish the handle.
    let handle = {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(handle) = server.handles.lock().unwrap().first().cloned() {
                break handle;
            }
            assert!(std::time::Instant::now() < deadline, "no connection handle");
            thread::sleep(Duration::from_millis(5));
        }
    };

    let sender = thread::spawn(move || handle.send("X"));
    sender.join().unwrap();

    assert_eq!(read_exact_or_eof(&mut client, 1), b"X");
    server.shutdown();
}

#[test]
fn idle_connections_are_force_closed() {
    let server = EchoServer::start(1, Some(Duration::from_millis(200)));
    let mut client = connect(server.addr);

    // Activity within the timeout keeps the connection alive.
    thread::sleep(Duration::from_millis(120));
    client.write_all(b"ping").unwrap();
    assert_eq!(read_exact_or_eof(&mut client, 4), b"ping");

    // Silence past the timeout closes it, with no bytes sent.
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from an idle close"),
        Err(err) => panic!("expected EOF, got {err}"),
    }
    server.shutdown();
}

#[test]
fn stop_closes_live_connections() {
    let server = EchoServer::start(1, None);
    let mut client = connect(server.addr);
    client.write_all(b"hi").unwrap();
    assert_eq!(read_exact_or_eof(&mut client, 2), b"hi");

    server.shutdown();

    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes after stop"),
        Err(err) => panic!("expected EOF after stop, got {err}"),
    }
}
