//! Single-threaded reactor loop and its cross-thread handle.
//!
//! A loop blocks only inside `epoll_wait`; it is broken by kernel
//! readiness, the timerfd firing, or a write to the wakeup eventfd. Each
//! iteration polls, dispatches ready endpoints, then drains the
//! cross-thread task queue.
//!
//! Endpoints (the acceptor and connections) live in a generational arena
//! owned by the loop. Dispatch checks an endpoint out of its slot for the
//! duration of the handler, which both pins it (nothing can free it
//! mid-dispatch) and frees the loop for poller, timer, and task access
//! from inside the handler. Tokens carry the slot generation, so a token
//! held past teardown fails lookup instead of reaching a recycled slot.

use crate::acceptor::Acceptor;
use crate::channel::{ready_ops, Channel};
use crate::connection::TcpConnection;
use crate::poller::{PollEvent, Poller, Token};
use crate::timer::{next_sequence, TimerCallback, TimerId, TimerQueue};
use crate::timestamp::Timestamp;
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace};

/// A unit of work executed on the owning loop thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

pub(crate) enum Endpoint {
    Acceptor(Acceptor),
    Connection(TcpConnection),
}

impl Endpoint {
    fn channel_mut(&mut self) -> &mut Channel {
        match self {
            Endpoint::Acceptor(acceptor) => acceptor.channel_mut(),
            Endpoint::Connection(connection) => connection.channel_mut(),
        }
    }

    fn handle_event(&mut self, now: Timestamp, event_loop: &mut EventLoop) {
        let ops = ready_ops(self.channel_mut().revents());
        match self {
            Endpoint::Acceptor(acceptor) => acceptor.handle_event(ops, event_loop),
            Endpoint::Connection(connection) => connection.handle_event(ops, now, event_loop),
        }
    }
}

struct Slot {
    generation: u64,
    endpoint: Option<Endpoint>,
}

struct LoopShared {
    thread: ThreadId,
    wakeup_fd: RawFd,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl LoopShared {
    /// Write 8 bytes to the eventfd so a blocked `epoll_wait` returns.
    /// Retries `EINTR`. The counter cannot realistically overflow, so any
    /// other failure is logged and dropped.
    fn wakeup(&self) {
        let one: u64 = 1;
        loop {
            let n = unsafe {
                libc::write(
                    self.wakeup_fd,
                    &one as *const u64 as *const libc::c_void,
                    8,
                )
            };
            if n == 8 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            debug!(error = %err, "wakeup write failed");
            return;
        }
    }

    fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}

/// Cheap cloneable handle for submitting work to a loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueue `f` to run on the loop thread. Tasks submitted from one
    /// thread run in submission order relative to each other.
    pub fn run_in_loop(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.queue_in_loop(f);
    }

    /// Enqueue `f` and wake the loop. The eventfd counter persists, so a
    /// task submitted before the loop even starts running is picked up on
    /// its first poll.
    pub fn queue_in_loop(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(f));
        self.shared.wakeup();
    }

    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Ask the loop to exit after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.shared.on_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Schedule `callback` at the instant `when`.
    ///
    /// The returned id is valid immediately; the insertion itself runs on
    /// the loop thread.
    pub fn run_at(
        &self,
        when: Timestamp,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        let sequence = next_sequence();
        self.queue_in_loop(move |event_loop| {
            event_loop.install_timer(sequence, Box::new(callback), when, None);
        });
        TimerId::new(sequence)
    }

    /// Schedule `callback` after `delay`.
    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Schedule `callback` every `interval`, first firing one interval
    /// from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        let sequence = next_sequence();
        self.queue_in_loop(move |event_loop| {
            event_loop.install_timer(
                sequence,
                Box::new(callback),
                Timestamp::now() + interval,
                Some(interval),
            );
        });
        TimerId::new(sequence)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.queue_in_loop(move |event_loop| event_loop.cancel_timer(id));
    }
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: Poller,
    wakeup_channel: Channel,
    timers: TimerQueue,
    endpoints: Slab<Slot>,
    next_generation: u64,
    dispatching: bool,
    active: Vec<PollEvent>,
}

impl EventLoop {
    /// Create a loop bound to the calling thread.
    pub fn new() -> io::Result<Self> {
        let mut poller = Poller::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut wakeup_channel = Channel::new(wakeup_fd, Token::Wakeup);
        wakeup_channel.enable_reading(&mut poller);
        let timers = TimerQueue::new(&mut poller)?;
        Ok(Self {
            shared: Arc::new(LoopShared {
                thread: thread::current().id(),
                wakeup_fd,
                pending: Mutex::new(Vec::new()),
                calling_pending: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }),
            poller,
            wakeup_channel,
            timers,
            endpoints: Slab::new(),
            next_generation: 1,
            dispatching: false,
            active: Vec::new(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.on_loop_thread()
    }

    /// Run until `quit`. Must be called on the thread that created the
    /// loop.
    pub fn run(&mut self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop driven off its owning thread"
        );
        trace!("event loop started");
        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = std::mem::take(&mut self.active);
            active.clear();
            let now = self.poller.poll(&mut active);
            self.dispatching = true;
            for event in &active {
                match event.token {
                    Token::Wakeup => {
                        self.wakeup_channel.set_revents(event.revents);
                        self.drain_wakeup();
                    }
                    Token::Timer => {
                        self.timers.channel_mut().set_revents(event.revents);
                        self.process_expired_timers();
                    }
                    Token::Endpoint { index, generation } => {
                        self.dispatch_endpoint(index, generation, event.revents, now);
                    }
                }
            }
            self.dispatching = false;
            self.active = active;
            self.drain_pending();
        }
        trace!("event loop stopped");
    }

    /// Run `f` now when the loop is not mid-dispatch, otherwise defer it
    /// to this iteration's task drain.
    pub fn run_in_loop(&mut self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        if self.dispatching || self.shared.calling_pending.load(Ordering::Acquire) {
            self.queue_in_loop(f);
        } else {
            f(self);
        }
    }

    pub fn queue_in_loop(&mut self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(f));
        if self.shared.calling_pending.load(Ordering::Acquire) {
            self.shared.wakeup();
        }
    }

    pub fn run_at(
        &mut self,
        when: Timestamp,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.install_timer(next_sequence(), Box::new(callback), when, None)
    }

    pub fn run_after(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.run_at(Timestamp::now() + delay, callback)
    }

    pub fn run_every(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.install_timer(
            next_sequence(),
            Box::new(callback),
            Timestamp::now() + interval,
            Some(interval),
        )
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    pub(crate) fn install_timer(
        &mut self,
        sequence: u64,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        self.timers.add(sequence, callback, when, interval)
    }

    pub(crate) fn poller_mut(&mut self) -> &mut Poller {
        &mut self.poller
    }

    /// Place a new endpoint in the arena. The constructor receives the
    /// token the endpoint's channel must carry.
    pub(crate) fn register_endpoint(&mut self, make: impl FnOnce(Token) -> Endpoint) -> Token {
        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = self.endpoints.vacant_entry();
        let token = Token::Endpoint {
            index: entry.key(),
            generation,
        };
        entry.insert(Slot {
            generation,
            endpoint: Some(make(token)),
        });
        token
    }

    /// Drop an endpoint's slot. Fails silently on stale tokens.
    pub(crate) fn remove_endpoint(&mut self, token: Token) {
        let Token::Endpoint { index, generation } = token else {
            return;
        };
        match self.endpoints.get(index) {
            Some(slot) if slot.generation == generation => {}
            _ => return,
        }
        let slot = self.endpoints.remove(index);
        debug_assert!(
            slot.endpoint.is_some(),
            "endpoint removed while checked out"
        );
    }

    /// Check a connection out of its slot and run `f` with it and the
    /// loop. Returns `None` for stale tokens, non-connection endpoints,
    /// or an endpoint already checked out (re-entrant dispatch).
    pub(crate) fn with_connection<R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut TcpConnection, &mut EventLoop) -> R,
    ) -> Option<R> {
        let Token::Endpoint { index, generation } = token else {
            return None;
        };
        let taken = {
            let slot = self.endpoints.get_mut(index)?;
            if slot.generation != generation {
                return None;
            }
            slot.endpoint.take()
        };
        match taken {
            Some(Endpoint::Connection(mut connection)) => {
                let result = f(&mut connection, self);
                self.restore(index, Endpoint::Connection(connection));
                Some(result)
            }
            Some(other) => {
                self.restore(index, other);
                None
            }
            None => None,
        }
    }

    /// `with_connection`, for the acceptor.
    pub(crate) fn with_acceptor<R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut Acceptor, &mut EventLoop) -> R,
    ) -> Option<R> {
        let Token::Endpoint { index, generation } = token else {
            return None;
        };
        let taken = {
            let slot = self.endpoints.get_mut(index)?;
            if slot.generation != generation {
                return None;
            }
            slot.endpoint.take()
        };
        match taken {
            Some(Endpoint::Acceptor(mut acceptor)) => {
                let result = f(&mut acceptor, self);
                self.restore(index, Endpoint::Acceptor(acceptor));
                Some(result)
            }
            Some(other) => {
                self.restore(index, other);
                None
            }
            None => None,
        }
    }

    fn dispatch_endpoint(&mut self, index: usize, generation: u64, revents: u32, now: Timestamp) {
        let Some(slot) = self.endpoints.get_mut(index) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        let Some(mut endpoint) = slot.endpoint.take() else {
            return;
        };
        endpoint.channel_mut().set_revents(revents);
        endpoint.handle_event(now, self);
        self.restore(index, endpoint);
    }

    fn restore(&mut self, index: usize, endpoint: Endpoint) {
        match self.endpoints.get_mut(index) {
            Some(slot) => {
                debug_assert!(slot.endpoint.is_none());
                slot.endpoint = Some(endpoint);
            }
            // The slot was removed while its endpoint was checked out;
            // the endpoint is torn down here instead.
            None => error!(index, "endpoint slot vanished during dispatch"),
        }
    }

    /// Swap the pending list out under the lock, then run the tasks
    /// unlocked so they can enqueue more work without deadlock.
    fn drain_pending(&mut self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<Task> = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }

    fn drain_wakeup(&mut self) {
        let mut value: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.shared.wakeup_fd,
                    &mut value as *mut u64 as *mut libc::c_void,
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
                    debug!(error = %err, "wakeup drain failed");
                    return;
                }
            }
        }
    }

    fn process_expired_timers(&mut self) {
        let now = Timestamp::now();
        let mut expired = self.timers.expired(now);
        for timer in expired.iter_mut() {
            timer.invoke(self);
        }
        self.timers.reset(expired, Timestamp::now());
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe { libc::close(self.shared.wakeup_fd) };
    }
}
