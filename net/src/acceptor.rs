//! Listening endpoint: accepts connections in a drain loop and hands the
//! new sockets to the server.

use crate::channel::{Channel, ReadyOps};
use crate::event_loop::EventLoop;
use crate::poller::Token;
use crate::socket::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use tracing::{error, info, warn};

/// Invoked on the base loop for every accepted connection.
pub(crate) type NewConnectionCallback =
    Box<dyn FnMut(&mut EventLoop, Socket, SocketAddr) + Send>;

const LISTEN_BACKLOG: i32 = 4096;

/// Create, configure, and bind the listening socket. Done on the caller's
/// thread so bind errors surface from `TcpServer::start`.
pub(crate) fn bind_socket(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
    let socket = Socket::new_stream()?;
    socket.set_reuse_addr(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(addr)?;
    Ok(socket)
}

/// Reserve a descriptor on a null sink so `EMFILE` can be handled by
/// releasing it, accepting the pending connection, and closing it.
pub(crate) fn open_idle_fd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) struct Acceptor {
    socket: Socket,
    channel: Channel,
    idle_fd: RawFd,
    listening: bool,
    on_connection: NewConnectionCallback,
}

impl Acceptor {
    pub(crate) fn new(
        socket: Socket,
        idle_fd: RawFd,
        token: Token,
        on_connection: NewConnectionCallback,
    ) -> Self {
        let channel = Channel::new(socket.fd(), token);
        Self {
            socket,
            channel,
            idle_fd,
            listening: false,
            on_connection,
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub(crate) fn listen(&mut self, event_loop: &mut EventLoop) -> io::Result<()> {
        self.socket.listen(LISTEN_BACKLOG)?;
        self.listening = true;
        self.channel.enable_reading(event_loop.poller_mut());
        info!(addr = ?self.socket.local_addr(), "listening");
        Ok(())
    }

    pub(crate) fn handle_event(&mut self, ops: ReadyOps, event_loop: &mut EventLoop) {
        if ops.error {
            error!("error event on listening socket");
        }
        if ops.read {
            self.handle_read(event_loop);
        }
    }

    /// Accept until the kernel reports `WouldBlock` (edge-triggered
    /// discipline). On `EMFILE`, release the reserved descriptor, accept
    /// and immediately close the pending connection so the kernel queue
    /// drains, then re-reserve.
    fn handle_read(&mut self, event_loop: &mut EventLoop) {
        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    (self.on_connection)(event_loop, socket, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("process fd limit reached, refusing connection");
                    unsafe { libc::close(self.idle_fd) };
                    let fd = unsafe {
                        libc::accept(self.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut())
                    };
                    if fd >= 0 {
                        unsafe { libc::close(fd) };
                    }
                    match open_idle_fd() {
                        Ok(fd) => self.idle_fd = fd,
                        Err(err) => {
                            self.idle_fd = -1;
                            error!(error = %err, "failed to re-reserve idle fd");
                        }
                    }
                    break;
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Tear down poller state before the endpoint is dropped.
    pub(crate) fn detach(&mut self, event_loop: &mut EventLoop) {
        if self.listening {
            self.channel.disable_all(event_loop.poller_mut());
            event_loop.poller_mut().remove_channel(&mut self.channel);
            self.listening = false;
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.idle_fd >= 0 {
            unsafe { libc::close(self.idle_fd) };
        }
    }
}
