//! Owning wrapper over a TCP socket descriptor.

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// A non-blocking, close-on-exec TCP socket. The descriptor is closed on
/// drop.
pub(crate) struct Socket {
    inner: RawSocket,
}

impl Socket {
    /// A fresh IPv4 stream socket, non-blocking and close-on-exec.
    pub(crate) fn new_stream() -> io::Result<Self> {
        let inner = RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Self { inner })
    }

    pub(crate) fn from_socket2(inner: RawSocket) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(addr))
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection; the new socket comes back
    /// non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (sock, addr) = self.inner.accept()?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((Socket::from_socket2(sock)?, peer))
    }

    /// Half-close: shut down the write side only, letting the peer drain.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    /// Fetch and clear `SO_ERROR`.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_round_trip() {
        let listener = Socket::new_stream().unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = std::net::TcpStream::connect(addr).unwrap();
        // The listener is non-blocking; the connection may need a moment
        // to land in the accept queue.
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
        let (sock, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer, client.local_addr().unwrap());
        sock.set_keep_alive(true).unwrap();
        sock.set_tcp_no_delay(true).unwrap();
        sock.shutdown_write().unwrap();
    }
}
