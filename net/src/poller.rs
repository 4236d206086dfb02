//! Readiness demultiplexer over raw epoll.

use crate::channel::{Channel, ChannelState};
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, error};

/// Identifies the endpoint a readiness event belongs to.
///
/// Endpoint tokens carry a generation so events that outlive their endpoint
/// (the slot was vacated and possibly reused mid-round) fail the lookup
/// instead of reaching a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Token {
    /// The loop's eventfd wakeup channel.
    Wakeup,
    /// The timer queue's timerfd channel.
    Timer,
    /// An acceptor or connection in the loop's endpoint arena.
    Endpoint { index: usize, generation: u64 },
}

pub(crate) struct PollEvent {
    pub token: Token,
    pub revents: u32,
}

const INITIAL_EVENT_CAPACITY: usize = 64;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Token>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            events: vec![
                libc::epoll_event { events: 0, u64: 0 };
                INITIAL_EVENT_CAPACITY
            ],
            channels: HashMap::new(),
        })
    }

    /// Block until at least one descriptor is ready, filling `active` with
    /// the resolved (token, mask) pairs. `EINTR` is retried. Returns the
    /// receive timestamp taken right after the wait.
    pub(crate) fn poll(&mut self, active: &mut Vec<PollEvent>) -> Timestamp {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("epoll_wait failed: {err}");
            }
            let now = Timestamp::now();
            let n = n as usize;
            for i in 0..n {
                let fd = self.events[i].u64 as RawFd;
                let revents = self.events[i].events;
                match self.channels.get(&fd) {
                    Some(&token) => active.push(PollEvent { token, revents }),
                    None => debug!(fd, "readiness for unregistered fd"),
                }
            }
            if n == self.events.len() {
                self.events
                    .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
            }
            return now;
        }
    }

    /// Synchronize a channel's interest set with the kernel.
    ///
    /// `New`/`Deleted` channels are (re-)added; an `Added` channel with an
    /// empty interest set is logically deleted (kernel DEL, kept in the map),
    /// otherwise modified in place. ADD/MOD failures break loop invariants
    /// and are fatal; DEL failures are logged only, since the peer may have
    /// closed the socket already.
    pub(crate) fn update_channel(&mut self, channel: &mut Channel) {
        let fd = channel.fd();
        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                self.channels.insert(fd, channel.token());
                channel.set_state(ChannelState::Added);
                if let Err(err) = self.ctl(libc::EPOLL_CTL_ADD, fd, channel.events()) {
                    panic!("epoll_ctl ADD failed for fd {fd}: {err}");
                }
            }
            ChannelState::Added => {
                debug_assert_eq!(self.channels.get(&fd), Some(&channel.token()));
                if channel.is_none_event() {
                    if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                        error!(fd, error = %err, "epoll_ctl DEL failed");
                    }
                    channel.set_state(ChannelState::Deleted);
                } else if let Err(err) = self.ctl(libc::EPOLL_CTL_MOD, fd, channel.events()) {
                    panic!("epoll_ctl MOD failed for fd {fd}: {err}");
                }
            }
        }
    }

    /// Physically remove a channel: erase it from the map and, if still in
    /// the kernel set, delete it there. The interest set must already be
    /// empty.
    pub(crate) fn remove_channel(&mut self, channel: &mut Channel) {
        debug_assert!(channel.is_none_event());
        let fd = channel.fd();
        self.channels.remove(&fd);
        if channel.state() == ChannelState::Added {
            if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                error!(fd, error = %err, "epoll_ctl DEL failed");
            }
        }
        channel.set_state(ChannelState::New);
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn eventfd() -> RawFd {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn channel_registration_state_machine() {
        let mut poller = Poller::new().unwrap();
        let fd = eventfd();
        let token = Token::Endpoint {
            index: 0,
            generation: 1,
        };
        let mut channel = Channel::new(fd, token);
        assert_eq!(channel.state(), ChannelState::New);

        channel.enable_reading(&mut poller);
        assert_eq!(channel.state(), ChannelState::Added);
        assert!(poller.contains(fd));

        channel.disable_all(&mut poller);
        assert_eq!(channel.state(), ChannelState::Deleted);
        assert!(poller.contains(fd));

        channel.enable_reading(&mut poller);
        assert_eq!(channel.state(), ChannelState::Added);

        channel.disable_all(&mut poller);
        poller.remove_channel(&mut channel);
        assert_eq!(channel.state(), ChannelState::New);
        assert!(!poller.contains(fd));

        unsafe { libc::close(fd) };
    }

    #[test]
    fn poll_reports_ready_channel() {
        let mut poller = Poller::new().unwrap();
        let fd = eventfd();
        let token = Token::Endpoint {
            index: 7,
            generation: 3,
        };
        let mut channel = Channel::new(fd, token);
        channel.enable_reading(&mut poller);

        let one: u64 = 1;
        let n = unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8)
        };
        assert_eq!(n, 8);

        let mut active = Vec::new();
        let now = poller.poll(&mut active);
        assert!(now.is_valid());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, token);
        assert_ne!(active[0].revents & crate::channel::EPOLL_IN, 0);

        channel.disable_all(&mut poller);
        poller.remove_channel(&mut channel);
        unsafe { libc::close(fd) };
    }
}
