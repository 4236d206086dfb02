//! Growable byte buffer bridging kernel I/O and protocol parsing.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0             read_index         write_index          data.len()
//! ```
//!
//! Readable bytes are `[read_index, write_index)`. The first
//! `PREPEND_SIZE` bytes are reserved so a small header can be stamped in
//! front of already-appended data without a copy. Consumed space is
//! reclaimed by compacting before the array is ever grown.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved prepend region at the front of every buffer.
pub const PREPEND_SIZE: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// Stack spill region for `read_fd`. A single `readv` can capture a burst
/// this much larger than the buffer's free space.
const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// Result of draining a descriptor into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes received; the descriptor is drained (kernel returned
    /// `WouldBlock`). Zero means a spurious wakeup.
    Received(usize),
    /// The peer closed its write side; carries bytes received before EOF.
    Closed(usize),
}

pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; PREPEND_SIZE + capacity],
            read_index: PREPEND_SIZE,
            write_index: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// The readable region. Valid until the next mutating call.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Offset of the first CRLF in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Consume `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_index += n;
        }
    }

    /// Consume everything; both cursors return to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.read_index = PREPEND_SIZE;
        self.write_index = PREPEND_SIZE;
    }

    /// Consume `n` readable bytes and return them.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.data[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        out
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Stamp `bytes` immediately in front of the readable region.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.read_index -= bytes.len();
        self.data[self.read_index..self.read_index + bytes.len()].copy_from_slice(bytes);
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    /// Compact readable bytes leftward when total free space suffices,
    /// otherwise grow the array. Never shrinks.
    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + PREPEND_SIZE {
            self.data.resize(self.write_index + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, PREPEND_SIZE);
            self.read_index = PREPEND_SIZE;
            self.write_index = PREPEND_SIZE + readable;
        }
    }

    /// Drain a non-blocking descriptor into the buffer.
    ///
    /// Performs a vectored read into the writable region plus a stack spill
    /// region, looping until the kernel reports `WouldBlock` (edge-triggered
    /// discipline: a single readiness notification must be read dry).
    /// `EINTR` is retried.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<ReadOutcome> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let mut total = 0usize;
        loop {
            let writable = self.writable_bytes();
            let iov = [
                libc::iovec {
                    iov_base: unsafe { self.data.as_mut_ptr().add(self.write_index) }
                        as *mut libc::c_void,
                    iov_len: writable,
                },
                libc::iovec {
                    iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                    iov_len: extra.len(),
                },
            ];
            let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Received(total)),
                    _ => return Err(err),
                }
            }
            if n == 0 {
                return Ok(ReadOutcome::Closed(total));
            }
            let n = n as usize;
            if n <= writable {
                self.write_index += n;
            } else {
                self.write_index = self.data.len();
                self.append(&extra[..n - writable]);
            }
            total += n;
        }
    }

    /// Drain readable bytes to a non-blocking descriptor.
    ///
    /// Loops while bytes remain and the kernel accepts more; stops on
    /// `WouldBlock`, retries `EINTR`, and returns the number written.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut total = 0usize;
        while self.readable_bytes() > 0 {
            let n = unsafe {
                libc::write(
                    fd,
                    self.data.as_ptr().add(self.read_index) as *const libc::c_void,
                    self.readable_bytes(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            }
            if n == 0 {
                break;
            }
            self.retrieve(n as usize);
            total += n as usize;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE + 6);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
    }

    #[test]
    fn retrieving_everything_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        let initial_len = PREPEND_SIZE + 16;
        buf.append(&[b'a'; 12]);
        buf.retrieve(10);
        // 10 reclaimed + 4 writable is enough for 12 more without growth.
        buf.append(&[b'b'; 12]);
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(buf.data.len(), initial_len);
    }

    #[test]
    fn grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 40]);
        assert_eq!(buf.readable_bytes(), 40);
        assert_eq!(buf.peek(), &[b'a'; 40][..]);
    }

    #[test]
    fn prepend_uses_reserved_region() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE - 4);
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn find_crlf_scans_readable_region() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
    }

    #[test]
    fn read_fd_drains_and_reports_eof() {
        let (rd, wr) = nonblocking_pipe();
        let payload = vec![b'x'; 100_000];
        let mut written = 0;
        while written < payload.len() {
            let n = unsafe {
                libc::write(
                    wr,
                    payload[written..].as_ptr() as *const libc::c_void,
                    payload.len() - written,
                )
            };
            if n <= 0 {
                break; // pipe full; what made it in is enough for the test
            }
            written += n as usize;
        }

        let mut buf = Buffer::with_capacity(16);
        match buf.read_fd(rd).unwrap() {
            ReadOutcome::Received(n) => assert_eq!(n, written),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(buf.readable_bytes(), written);

        close(wr);
        match buf.read_fd(rd).unwrap() {
            ReadOutcome::Closed(0) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        close(rd);
    }

    #[test]
    fn write_fd_drains_readable_bytes() {
        let (rd, wr) = nonblocking_pipe();
        let mut buf = Buffer::new();
        buf.append(b"ping");
        assert_eq!(buf.write_fd(wr).unwrap(), 4);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 8];
        let n = unsafe { libc::read(rd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(n, 4);
        assert_eq!(&out[..4], b"ping");
        close(rd);
        close(wr);
    }
}
