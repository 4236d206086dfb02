//! Per-connection state machine.
//!
//! A connection is created in `Connecting` when accepted, becomes
//! `Connected` once `connect_established` registers read interest on its
//! io loop, moves to `Disconnecting` on a user-initiated shutdown, and
//! reaches the terminal `Disconnected` after `connect_destroyed`. The
//! socket, channel, and both buffers are owned exclusively by the
//! connection; the connection itself is owned by its loop's endpoint
//! arena.
//!
//! In-loop code calls methods on `&mut TcpConnection` directly. Foreign
//! threads hold a [`ConnectionHandle`] and go through the loop's task
//! queue.

use crate::buffer::{Buffer, ReadOutcome};
use crate::channel::{Channel, ReadyOps};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::Token;
use crate::socket::Socket;
use crate::timer::TimerId;
use crate::timestamp::Timestamp;
use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Default threshold for the high-water-mark callback: 64 MiB of
/// unsent output.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Invoked when a connection comes up or goes down; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&mut TcpConnection, &mut EventLoop) + Send + Sync>;

/// Invoked when bytes arrive; consume them from the input buffer.
pub type MessageCallback =
    Arc<dyn Fn(&mut TcpConnection, &mut EventLoop, Timestamp) + Send + Sync>;

/// Invoked after the output buffer fully drains to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&mut TcpConnection, &mut EventLoop) + Send + Sync>;

/// Invoked when staged output first crosses the high-water mark; the
/// argument is the total pending byte count.
pub type HighWaterMarkCallback =
    Arc<dyn Fn(&mut TcpConnection, &mut EventLoop, usize) + Send + Sync>;

/// Set by the server: removes the connection from the server table.
pub(crate) type CloseCallback = Arc<dyn Fn(&mut EventLoop, &ConnectionHandle) + Send + Sync>;

pub(crate) fn default_connection_callback(
    conn: &mut TcpConnection,
    _event_loop: &mut EventLoop,
) {
    info!(
        conn = %conn.name(),
        up = conn.connected(),
        "connection state changed"
    );
}

pub(crate) fn default_message_callback(
    conn: &mut TcpConnection,
    _event_loop: &mut EventLoop,
    _receive_time: Timestamp,
) {
    // Nothing consumes the bytes; drop them so they cannot pile up.
    conn.input.retrieve_all();
}

pub struct TcpConnection {
    token: Token,
    name: Arc<str>,
    state: ConnectionState,
    socket: Socket,
    channel: Channel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    idle_timeout: Option<Duration>,
    idle_timer: Option<TimerId>,
    context: Option<Box<dyn Any + Send>>,
    loop_handle: LoopHandle,
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
    on_write_complete: Option<WriteCompleteCallback>,
    on_high_water_mark: Option<HighWaterMarkCallback>,
    on_close: Option<CloseCallback>,
}

impl TcpConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        token: Token,
        name: Arc<str>,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        idle_timeout: Option<Duration>,
        loop_handle: LoopHandle,
    ) -> Self {
        if let Err(err) = socket.set_keep_alive(true) {
            error!(conn = %name, error = %err, "failed to enable SO_KEEPALIVE");
        }
        let channel = Channel::new(socket.fd(), token);
        trace!(conn = %name, fd = socket.fd(), "connection created");
        Self {
            token,
            name,
            state: ConnectionState::Connecting,
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Buffer::new(),
            output: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            idle_timeout,
            idle_timer: None,
            context: None,
            loop_handle,
            on_connection: Arc::new(default_connection_callback),
            on_message: Arc::new(default_message_callback),
            on_write_complete: None,
            on_high_water_mark: None,
            on_close: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    /// Bytes staged in the output buffer, not yet accepted by the kernel.
    pub fn pending_output(&self) -> usize {
        self.output.readable_bytes()
    }

    /// A cheap, cloneable, thread-safe reference to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            name: self.name.clone(),
            token: self.token,
            loop_handle: self.loop_handle.clone(),
        }
    }

    /// Attach one opaque per-connection value, replacing any previous one.
    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut::<T>()
    }

    /// Split borrow for protocol layers that parse the input buffer into
    /// their context in one call.
    pub fn context_and_input<T: Any>(&mut self) -> (Option<&mut T>, &mut Buffer) {
        let context = self
            .context
            .as_mut()
            .and_then(|value| value.downcast_mut::<T>());
        (context, &mut self.input)
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.on_connection = cb;
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.on_message = cb;
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.on_write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback, mark: usize) {
        self.on_high_water_mark = Some(cb);
        self.high_water_mark = mark;
    }

    pub(crate) fn set_close_callback(&mut self, cb: CloseCallback) {
        self.on_close = Some(cb);
    }

    pub fn set_tcp_no_delay(&mut self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Send bytes on this connection. Must run on the io loop; dropped
    /// silently unless the connection is `Connected`.
    pub fn send(&mut self, event_loop: &mut EventLoop, data: &[u8]) {
        if self.state != ConnectionState::Connected {
            debug!(conn = %self.name, "send on non-connected connection dropped");
            return;
        }
        self.send_in_loop(event_loop, data);
    }

    /// Send everything readable in `buf`, consuming it.
    pub fn send_buffer(&mut self, event_loop: &mut EventLoop, buf: &mut Buffer) {
        if self.state != ConnectionState::Connected {
            debug!(conn = %self.name, "send on non-connected connection dropped");
            return;
        }
        self.send_in_loop(event_loop, buf.peek());
        buf.retrieve_all();
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(&mut self, event_loop: &mut EventLoop) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnecting;
            self.shutdown_in_loop(event_loop);
        }
    }

    /// Close immediately, without waiting for pending output.
    pub fn force_close(&mut self, event_loop: &mut EventLoop) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.state = ConnectionState::Disconnecting;
            self.handle_close(event_loop);
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Called on the io loop once the server has wired callbacks. Enables
    /// read interest, announces the connection, and arms the idle timer.
    pub(crate) fn connect_established(&mut self, event_loop: &mut EventLoop) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.state = ConnectionState::Connected;
        self.channel.enable_reading(event_loop.poller_mut());
        let cb = self.on_connection.clone();
        cb(self, event_loop);
        self.extend_lifetime(event_loop);
    }

    /// Final teardown on the io loop: cancel the idle timer and remove the
    /// channel from the poller. The endpoint slot is freed by the caller.
    pub(crate) fn connect_destroyed(&mut self, event_loop: &mut EventLoop) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            self.channel.disable_all(event_loop.poller_mut());
            let cb = self.on_connection.clone();
            cb(self, event_loop);
        }
        if let Some(id) = self.idle_timer.take() {
            event_loop.cancel_timer(id);
        }
        event_loop.poller_mut().remove_channel(&mut self.channel);
        trace!(conn = %self.name, "connection destroyed");
    }

    pub(crate) fn handle_event(
        &mut self,
        ops: ReadyOps,
        receive_time: Timestamp,
        event_loop: &mut EventLoop,
    ) {
        if ops.close {
            self.handle_close(event_loop);
        }
        if ops.error {
            self.handle_error();
        }
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if ops.read {
            self.handle_read(receive_time, event_loop);
        }
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if ops.write {
            self.handle_write(event_loop);
        }
    }

    fn handle_read(&mut self, receive_time: Timestamp, event_loop: &mut EventLoop) {
        self.extend_lifetime(event_loop);
        match self.input.read_fd(self.channel.fd()) {
            Ok(ReadOutcome::Received(0)) => {}
            Ok(ReadOutcome::Received(_)) => {
                let cb = self.on_message.clone();
                cb(self, event_loop, receive_time);
            }
            Ok(ReadOutcome::Closed(n)) => {
                if n > 0 {
                    let cb = self.on_message.clone();
                    cb(self, event_loop, receive_time);
                }
                if self.state != ConnectionState::Disconnected {
                    self.handle_close(event_loop);
                }
            }
            Err(err) => {
                error!(conn = %self.name, error = %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&mut self, event_loop: &mut EventLoop) {
        if !self.channel.is_writing() {
            debug!(conn = %self.name, "connection is down, no more writing");
            return;
        }
        self.extend_lifetime(event_loop);
        match self.output.write_fd(self.channel.fd()) {
            Ok(_) => {
                if self.output.readable_bytes() == 0 {
                    self.channel.disable_writing(event_loop.poller_mut());
                    self.queue_write_complete(event_loop);
                    if self.state == ConnectionState::Disconnecting {
                        self.shutdown_in_loop(event_loop);
                    }
                }
                // Otherwise the kernel buffer filled again; write interest
                // stays armed and the next EPOLLOUT resumes the drain.
            }
            Err(err) => {
                error!(conn = %self.name, error = %err, "write failed");
            }
        }
    }

    /// Zero-copy fast path: with an empty output buffer and no armed
    /// write interest, write straight to the descriptor. Whatever the
    /// kernel refuses is staged in the output buffer and write interest
    /// is enabled.
    fn send_in_loop(&mut self, event_loop: &mut EventLoop, data: &[u8]) {
        let mut written = 0usize;
        let mut faulted = false;
        if !self.channel.is_writing() && self.output.readable_bytes() == 0 {
            self.extend_lifetime(event_loop);
            while written < data.len() {
                let n = unsafe {
                    libc::write(
                        self.channel.fd(),
                        data[written..].as_ptr() as *const libc::c_void,
                        data.len() - written,
                    )
                };
                if n > 0 {
                    written += n as usize;
                    continue;
                }
                if n == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                        error!(conn = %self.name, error = %err, "send failed");
                        faulted = true;
                        break;
                    }
                    _ => {
                        error!(conn = %self.name, error = %err, "send failed");
                        break;
                    }
                }
            }
            if !faulted && written == data.len() {
                self.queue_write_complete(event_loop);
                return;
            }
        }

        if faulted {
            self.handle_close(event_loop);
            return;
        }

        let remaining = data.len() - written;
        if remaining > 0 {
            let old_len = self.output.readable_bytes();
            let total = old_len + remaining;
            if total >= self.high_water_mark && old_len < self.high_water_mark {
                if let Some(cb) = self.on_high_water_mark.clone() {
                    let token = self.token;
                    event_loop.queue_in_loop(move |event_loop| {
                        let _ = event_loop
                            .with_connection(token, |conn, event_loop| cb(conn, event_loop, total));
                    });
                }
            }
            self.output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing(event_loop.poller_mut());
            }
        }
    }

    fn shutdown_in_loop(&mut self, _event_loop: &mut EventLoop) {
        // Half-close only once the channel stopped writing; otherwise the
        // write-completion path picks this up when the buffer drains.
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!(conn = %self.name, error = %err, "shutdown failed");
            }
        }
    }

    fn handle_close(&mut self, event_loop: &mut EventLoop) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        trace!(conn = %self.name, state = ?self.state, "closing");
        self.state = ConnectionState::Disconnected;
        self.channel.disable_all(event_loop.poller_mut());
        let cb = self.on_connection.clone();
        cb(self, event_loop);
        if let Some(close_cb) = self.on_close.clone() {
            let handle = self.handle();
            close_cb(event_loop, &handle);
        }
    }

    fn handle_error(&mut self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!(conn = %self.name, error = %err, "socket error"),
            Ok(None) => {}
            Err(err) => error!(conn = %self.name, error = %err, "failed to read SO_ERROR"),
        }
    }

    fn queue_write_complete(&mut self, event_loop: &mut EventLoop) {
        if let Some(cb) = self.on_write_complete.clone() {
            let token = self.token;
            event_loop.queue_in_loop(move |event_loop| {
                let _ = event_loop.with_connection(token, |conn, event_loop| cb(conn, event_loop));
            });
        }
    }

    /// Cancel and re-arm the idle timer. Runs on every successful I/O
    /// action so only genuinely quiet connections expire.
    fn extend_lifetime(&mut self, event_loop: &mut EventLoop) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        if let Some(id) = self.idle_timer.take() {
            event_loop.cancel_timer(id);
        }
        let token = self.token;
        let id = event_loop.run_after(timeout, move |event_loop| {
            let _ = event_loop.with_connection(token, |conn, event_loop| {
                info!(conn = %conn.name(), "idle timeout, closing");
                conn.force_close(event_loop);
            });
        });
        self.idle_timer = Some(id);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

/// Thread-safe reference to a connection. All operations enqueue onto
/// the owning io loop; a handle that outlives its connection becomes a
/// no-op (the token fails the generational lookup).
#[derive(Clone)]
pub struct ConnectionHandle {
    name: Arc<str>,
    token: Token,
    loop_handle: LoopHandle,
}

impl ConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let token = self.token;
        let data = data.into();
        self.loop_handle.run_in_loop(move |event_loop| {
            let _ = event_loop.with_connection(token, |conn, event_loop| {
                conn.send(event_loop, &data);
            });
        });
    }

    pub fn shutdown(&self) {
        let token = self.token;
        self.loop_handle.run_in_loop(move |event_loop| {
            let _ = event_loop.with_connection(token, |conn, event_loop| {
                conn.shutdown(event_loop);
            });
        });
    }

    pub fn force_close(&self) {
        let token = self.token;
        self.loop_handle.run_in_loop(move |event_loop| {
            let _ = event_loop.with_connection(token, |conn, event_loop| {
                conn.force_close(event_loop);
            });
        });
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .finish()
    }
}
