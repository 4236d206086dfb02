//! TCP server orchestration: acceptor, io loop pool, connection table.
//!
//! The base loop runs the acceptor and owns the connection table; every
//! table mutation is posted there. Accepted descriptors are assigned to
//! io loops round-robin and never migrate. Removal flows io loop (close
//! detected) → base loop (table erase) → io loop (destroy), with FIFO
//! task ordering guaranteeing the erase lands before the destroy.

use crate::acceptor::{self, Acceptor};
use crate::connection::{
    ConnectionCallback, ConnectionHandle, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{Endpoint, EventLoop, LoopHandle};
use crate::event_loop_thread::EventLoopThreadPool;
use crate::poller::Token;
use crate::socket::Socket;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

struct ServerInner {
    name: String,
    ip_port: Mutex<String>,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    acceptor_token: Mutex<Option<Token>>,
}

pub struct TcpServer {
    inner: Arc<ServerInner>,
    base: LoopHandle,
    pool: EventLoopThreadPool,
    addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    num_threads: usize,
    reuse_port: bool,
    tcp_no_delay: bool,
    idle_timeout: Option<Duration>,
    connection_callback: Option<ConnectionCallback>,
    message_callback: Option<MessageCallback>,
    write_complete_callback: Option<WriteCompleteCallback>,
}

impl TcpServer {
    pub fn new(base: LoopHandle, addr: SocketAddr, name: &str) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.to_string(),
                ip_port: Mutex::new(addr.to_string()),
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                acceptor_token: Mutex::new(None),
            }),
            base,
            pool: EventLoopThreadPool::new(name, 0),
            addr,
            local_addr: None,
            num_threads: 0,
            reuse_port: false,
            tcp_no_delay: false,
            idle_timeout: Some(Duration::from_secs(60)),
            connection_callback: None,
            message_callback: None,
            write_complete_callback: None,
        }
    }

    /// Number of io loops; zero means the base loop services connections
    /// itself. Must be set before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Per-connection idle expiration; `None` disables it.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn set_reuse_port(&mut self, on: bool) {
        self.reuse_port = on;
    }

    pub fn set_tcp_no_delay(&mut self, on: bool) {
        self.tcp_no_delay = on;
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_callback = Some(cb);
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_callback = Some(cb);
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_callback = Some(cb);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listen address, available after `start`. Useful when
    /// binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Bind, start the loop pool, and post `listen` to the base loop.
    /// Idempotent; later calls are no-ops.
    pub fn start(&mut self) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listen_socket = acceptor::bind_socket(self.addr, self.reuse_port)?;
        let bound = listen_socket.local_addr()?;
        self.local_addr = Some(bound);
        *self.inner.ip_port.lock().unwrap() = bound.to_string();

        self.pool = EventLoopThreadPool::new(&self.inner.name, self.num_threads);
        self.pool.start()?;
        let io_handles = self.pool.handles();

        let idle_fd = acceptor::open_idle_fd()?;
        let on_connection = self.make_new_connection_callback(io_handles);

        info!(server = %self.inner.name, addr = %bound, "starting");
        let inner = self.inner.clone();
        self.base.run_in_loop(move |event_loop| {
            let token = event_loop
                .register_endpoint(|token| {
                    Endpoint::Acceptor(Acceptor::new(listen_socket, idle_fd, token, on_connection))
                });
            *inner.acceptor_token.lock().unwrap() = Some(token);
            let listened =
                event_loop.with_acceptor(token, |acceptor, event_loop| acceptor.listen(event_loop));
            if let Some(Err(err)) = listened {
                error!(error = %err, "listen failed");
            }
        });
        Ok(())
    }

    /// Force-close every live connection, then quit and join the io
    /// loops. The base loop is left running for its owner to stop.
    pub fn stop(&mut self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        info!(server = %self.inner.name, "stopping");
        if let Some(token) = self.inner.acceptor_token.lock().unwrap().take() {
            self.base.run_in_loop(move |event_loop| {
                let _ = event_loop
                    .with_acceptor(token, |acceptor, event_loop| acceptor.detach(event_loop));
                event_loop.remove_endpoint(token);
            });
        }
        let handles: Vec<ConnectionHandle> = self
            .inner
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.force_close();
        }
        self.pool.shutdown();
    }

    /// The acceptor callback: runs on the base loop for every accepted
    /// socket, picks an io loop round-robin, and finishes connection
    /// setup over there.
    fn make_new_connection_callback(
        &self,
        io_handles: Vec<LoopHandle>,
    ) -> acceptor::NewConnectionCallback {
        let inner = self.inner.clone();
        let base = self.base.clone();
        let idle_timeout = self.idle_timeout;
        let tcp_no_delay = self.tcp_no_delay;
        let connection_cb = self.connection_callback.clone();
        let message_cb = self.message_callback.clone();
        let write_complete_cb = self.write_complete_callback.clone();
        let mut next = 0usize;

        Box::new(move |_event_loop: &mut EventLoop, socket: Socket, peer: SocketAddr| {
            let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let name: Arc<str> = format!(
                "{}-{}#{}",
                inner.name,
                inner.ip_port.lock().unwrap(),
                id
            )
            .into();
            let io = if io_handles.is_empty() {
                base.clone()
            } else {
                let handle = io_handles[next % io_handles.len()].clone();
                next += 1;
                handle
            };
            debug!(server = %inner.name, conn = %name, peer = %peer, "new connection");

            let inner = inner.clone();
            let base = base.clone();
            let io_for_conn = io.clone();
            let connection_cb = connection_cb.clone();
            let message_cb = message_cb.clone();
            let write_complete_cb = write_complete_cb.clone();

            io.run_in_loop(move |event_loop| {
                let local = socket.local_addr().unwrap_or(peer);
                if tcp_no_delay {
                    if let Err(err) = socket.set_tcp_no_delay(true) {
                        error!(conn = %name, error = %err, "failed to set TCP_NODELAY");
                    }
                }
                let close_cb = make_close_callback(inner.clone(), base.clone(), io_for_conn.clone());
                let conn_name = name.clone();
                let token = event_loop.register_endpoint(|token| {
                    let mut conn = TcpConnection::new(
                        token,
                        conn_name,
                        socket,
                        local,
                        peer,
                        idle_timeout,
                        io_for_conn,
                    );
                    if let Some(cb) = connection_cb {
                        conn.set_connection_callback(cb);
                    }
                    if let Some(cb) = message_cb {
                        conn.set_message_callback(cb);
                    }
                    if let Some(cb) = write_complete_cb {
                        conn.set_write_complete_callback(cb);
                    }
                    conn.set_close_callback(close_cb);
                    Endpoint::Connection(conn)
                });

                // Insert into the table before enabling I/O so a close can
                // never race ahead of its own registration; both tasks are
                // posted from this thread and drain FIFO on the base loop.
                let handle = event_loop.with_connection(token, |conn, _| conn.handle());
                if let Some(handle) = handle {
                    let key = handle.name().to_string();
                    let table = inner.clone();
                    base.run_in_loop(move |_| {
                        table.connections.lock().unwrap().insert(key, handle);
                    });
                }
                let _ = event_loop
                    .with_connection(token, |conn, event_loop| conn.connect_established(event_loop));
            });
        })
    }
}

/// Removal flow: erase from the table on the base loop, then destroy the
/// connection and free its slot on the io loop.
fn make_close_callback(
    inner: Arc<ServerInner>,
    base: LoopHandle,
    io: LoopHandle,
) -> crate::connection::CloseCallback {
    Arc::new(move |_event_loop: &mut EventLoop, handle: &ConnectionHandle| {
        let name = handle.name().to_string();
        let token = handle.token();
        let inner = inner.clone();
        let io = io.clone();
        base.run_in_loop(move |_| {
            if inner.connections.lock().unwrap().remove(&name).is_none() {
                // Already drained by `stop`; destruction still proceeds.
                debug!(conn = %name, "connection not in table");
            }
            io.run_in_loop(move |event_loop| {
                let _ = event_loop
                    .with_connection(token, |conn, event_loop| conn.connect_destroyed(event_loop));
                event_loop.remove_endpoint(token);
            });
        });
    })
}
