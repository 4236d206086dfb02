//! Timer service fronted by a timerfd the poller watches.
//!
//! Two indices cover the same timer set: `timers`, ordered by
//! `(expiration, sequence)` so the earliest expiry is the first key, and
//! `active`, addressed by sequence for cheap cancellation even when several
//! timers share an instant. The timerfd is always armed to the earliest
//! expiry, or disarmed when the set is empty.

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::poller::{Poller, Token};
use crate::timestamp::Timestamp;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::error;

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Reserve a globally unique timer sequence number.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Value-type handle to a scheduled timer. Conveys no ownership; canceling
/// a timer that already fired (or never existed) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    fn repeating(&self) -> bool {
        self.interval.is_some()
    }

    fn restart(&mut self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }

    pub(crate) fn invoke(&mut self, event_loop: &mut EventLoop) {
        (self.callback)(event_loop);
    }
}

/// Never arm the timerfd closer than this; a zero relative value would
/// disarm it instead.
const MIN_ARM_DELAY_MICROS: i64 = 100;

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    channel: Channel,
    timers: BTreeMap<(Timestamp, u64), Timer>,
    active: HashMap<u64, Timestamp>,
    calling_expired: bool,
    canceling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new(poller: &mut Poller) -> io::Result<Self> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut channel = Channel::new(timer_fd, Token::Timer);
        channel.enable_reading(poller);
        Ok(Self {
            timer_fd,
            channel,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            calling_expired: false,
            canceling: HashSet::new(),
        })
    }

    /// Schedule a callback for `when`, optionally repeating every
    /// `interval`. Re-arms the timerfd when the new timer becomes the
    /// earliest expiry.
    pub(crate) fn add(
        &mut self,
        sequence: u64,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Timer {
            callback,
            expiration: when,
            interval,
            sequence,
        };
        if self.insert(timer) {
            arm_timer_fd(self.timer_fd, when, Timestamp::now());
        }
        TimerId::new(sequence)
    }

    /// Remove a timer from both indices. If it is currently being
    /// dispatched (self-cancellation), record it so `reset` destroys it
    /// instead of re-arming.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(expiration) = self.active.remove(&id.sequence) {
            let removed = self.timers.remove(&(expiration, id.sequence));
            debug_assert!(removed.is_some());
        } else if self.calling_expired {
            self.canceling.insert(id.sequence);
        }
    }

    /// Drain the timerfd and take every timer due at `now` out of both
    /// indices, in expiration order (sequence order at equal instants).
    pub(crate) fn expired(&mut self, now: Timestamp) -> Vec<Timer> {
        drain_timer_fd(self.timer_fd);
        let sentinel = (now, u64::MAX);
        let remaining = self.timers.split_off(&sentinel);
        let expired_map = std::mem::replace(&mut self.timers, remaining);
        let mut expired = Vec::with_capacity(expired_map.len());
        for ((_, sequence), timer) in expired_map {
            let removed = self.active.remove(&sequence);
            debug_assert!(removed.is_some());
            expired.push(timer);
        }
        self.calling_expired = true;
        self.canceling.clear();
        expired
    }

    /// Restart repeating timers that were not canceled during their own
    /// dispatch, then re-arm the timerfd to the new minimum (or disarm).
    pub(crate) fn reset(&mut self, expired: Vec<Timer>, now: Timestamp) {
        self.calling_expired = false;
        for mut timer in expired {
            if timer.repeating() && !self.canceling.contains(&timer.sequence) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        self.canceling.clear();
        match self.timers.keys().next() {
            Some(&(next, _)) => arm_timer_fd(self.timer_fd, next, now),
            None => disarm_timer_fd(self.timer_fd),
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.timers.len(), self.active.len());
        self.timers.len()
    }

    /// Insert into both indices; true when the new timer expires before
    /// everything already queued.
    fn insert(&mut self, timer: Timer) -> bool {
        let earliest_changed = match self.timers.keys().next() {
            None => true,
            Some(&(first, _)) => timer.expiration < first,
        };
        self.active.insert(timer.sequence, timer.expiration);
        self.timers
            .insert((timer.expiration, timer.sequence), timer);
        earliest_changed
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.timer_fd) };
    }
}

fn arm_timer_fd(timer_fd: RawFd, expiration: Timestamp, now: Timestamp) {
    let micros = now.micros_until(expiration).max(MIN_ARM_DELAY_MICROS);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: micros / 1_000_000,
            tv_nsec: (micros % 1_000_000) * 1_000,
        },
    };
    let rc =
        unsafe { libc::timerfd_settime(timer_fd, 0, &new_value, std::ptr::null_mut()) };
    if rc < 0 {
        panic!(
            "timerfd_settime failed: {}",
            io::Error::last_os_error()
        );
    }
}

fn disarm_timer_fd(timer_fd: RawFd) {
    let zero = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };
    let rc = unsafe { libc::timerfd_settime(timer_fd, 0, &zero, std::ptr::null_mut()) };
    if rc < 0 {
        panic!(
            "timerfd_settime failed: {}",
            io::Error::last_os_error()
        );
    }
}

fn drain_timer_fd(timer_fd: RawFd) {
    let mut expirations: u64 = 0;
    loop {
        let n = unsafe {
            libc::read(
                timer_fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n == 8 {
            return;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return,
            _ => {
                error!(error = %err, "failed to drain timerfd");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn both_indices_stay_consistent() {
        let mut poller = Poller::new().unwrap();
        let mut queue = TimerQueue::new(&mut poller).unwrap();
        let base = Timestamp::now() + Duration::from_secs(60);

        let a = queue.add(next_sequence(), noop(), base, None);
        let b = queue.add(next_sequence(), noop(), base, None);
        let c = queue.add(
            next_sequence(),
            noop(),
            base + Duration::from_secs(1),
            Some(Duration::from_secs(1)),
        );
        assert_eq!(queue.len(), 3);

        queue.cancel(b);
        assert_eq!(queue.len(), 2);

        // Canceling twice, or canceling an id that never existed, is a no-op.
        queue.cancel(b);
        queue.cancel(TimerId::new(u64::MAX));
        assert_eq!(queue.len(), 2);

        queue.cancel(a);
        queue.cancel(c);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn expired_takes_due_timers_in_order() {
        let mut poller = Poller::new().unwrap();
        let mut queue = TimerQueue::new(&mut poller).unwrap();
        let now = Timestamp::now();

        // Two timers share an instant; a third is in the future.
        let shared = now + Duration::from_millis(1);
        let s1 = next_sequence();
        let s2 = next_sequence();
        queue.add(s2, noop(), shared, None);
        queue.add(s1, noop(), shared, None);
        queue.add(next_sequence(), noop(), now + Duration::from_secs(60), None);

        let expired = queue.expired(now + Duration::from_millis(2));
        let sequences: Vec<u64> = expired.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![s1, s2]);
        assert_eq!(queue.len(), 1);

        queue.reset(expired, Timestamp::now());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_during_dispatch_suppresses_rearm() {
        let mut poller = Poller::new().unwrap();
        let mut queue = TimerQueue::new(&mut poller).unwrap();
        let now = Timestamp::now();

        let sequence = next_sequence();
        let id = queue.add(
            sequence,
            noop(),
            now + Duration::from_millis(1),
            Some(Duration::from_millis(10)),
        );

        let expired = queue.expired(now + Duration::from_millis(2));
        assert_eq!(expired.len(), 1);
        // Simulates the callback canceling its own repeating timer.
        queue.cancel(id);
        queue.reset(expired, Timestamp::now());
        assert_eq!(queue.len(), 0);
    }
}
