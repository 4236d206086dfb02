//! Binding between a file descriptor and its poller interest set.
//!
//! A channel never owns its descriptor; the socket (or timer/event fd) it
//! watches belongs to the surrounding endpoint. Registration with the kernel
//! goes through a small state machine so a channel can be logically removed
//! (`Deleted`, still known to the poller map) and later re-enabled without
//! reallocation, or physically removed (`New`).

use crate::poller::{Poller, Token};
use std::os::unix::io::RawFd;

pub(crate) const EPOLL_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EPOLL_PRI: u32 = libc::EPOLLPRI as u32;
pub(crate) const EPOLL_OUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EPOLL_HUP: u32 = libc::EPOLLHUP as u32;
pub(crate) const EPOLL_ERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EPOLL_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub(crate) const EPOLL_ET: u32 = libc::EPOLLET as u32;

const READ_EVENTS: u32 = EPOLL_IN | EPOLL_PRI | EPOLL_RDHUP;
const WRITE_EVENTS: u32 = EPOLL_OUT;

/// Kernel registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Known to neither the poller map nor the kernel.
    New,
    /// In the poller map and the kernel interest set.
    Added,
    /// In the poller map but removed from the kernel (empty interest).
    Deleted,
}

pub(crate) struct Channel {
    fd: RawFd,
    token: Token,
    events: u32,
    revents: u32,
    state: ChannelState,
}

impl Channel {
    pub(crate) fn new(fd: RawFd, token: Token) -> Self {
        Self {
            fd,
            token,
            events: 0,
            revents: 0,
            state: ChannelState::New,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn events(&self) -> u32 {
        self.events
    }

    pub(crate) fn revents(&self) -> u32 {
        self.revents
    }

    pub(crate) fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events & EPOLL_OUT != 0
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events == 0
    }

    pub(crate) fn enable_reading(&mut self, poller: &mut Poller) {
        self.events |= READ_EVENTS | EPOLL_ET;
        poller.update_channel(self);
    }

    pub(crate) fn enable_writing(&mut self, poller: &mut Poller) {
        self.events |= WRITE_EVENTS | EPOLL_ET;
        poller.update_channel(self);
    }

    pub(crate) fn disable_writing(&mut self, poller: &mut Poller) {
        self.events &= !WRITE_EVENTS;
        poller.update_channel(self);
    }

    pub(crate) fn disable_all(&mut self, poller: &mut Poller) {
        self.events = 0;
        poller.update_channel(self);
    }
}

/// What a returned readiness mask asks of the endpoint, in dispatch order:
/// close, error, read, write.
///
/// A `HUP` accompanied by `IN` is routed to the read path so residual bytes
/// are drained; the read path's own EOF detection then drives the close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReadyOps {
    pub close: bool,
    pub error: bool,
    pub read: bool,
    pub write: bool,
}

pub(crate) fn ready_ops(revents: u32) -> ReadyOps {
    ReadyOps {
        close: revents & EPOLL_HUP != 0 && revents & EPOLL_IN == 0,
        error: revents & EPOLL_ERR != 0,
        read: revents & (EPOLL_IN | EPOLL_PRI | EPOLL_RDHUP) != 0,
        write: revents & EPOLL_OUT != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hup_without_in_is_a_close() {
        let ops = ready_ops(EPOLL_HUP);
        assert!(ops.close);
        assert!(!ops.read);
    }

    #[test]
    fn hup_with_in_drains_through_the_read_path() {
        let ops = ready_ops(EPOLL_HUP | EPOLL_IN);
        assert!(!ops.close);
        assert!(ops.read);
    }

    #[test]
    fn error_and_write_bits_map_directly() {
        let ops = ready_ops(EPOLL_ERR | EPOLL_OUT);
        assert!(ops.error);
        assert!(ops.write);
        assert!(!ops.read);
        assert!(!ops.close);
    }

    #[test]
    fn rdhup_is_readable() {
        assert!(ready_ops(EPOLL_RDHUP).read);
    }
}
