//! Loop-per-thread bootstrap and the fixed worker pool.

use crate::event_loop::{EventLoop, LoopHandle};
use std::io;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::debug;

/// A thread running one event loop. The handle is available as soon as
/// `spawn` returns; the loop itself runs until `quit`.
pub struct EventLoopThread {
    handle: LoopHandle,
    join: JoinHandle<()>,
}

impl EventLoopThread {
    pub fn spawn(name: String) -> io::Result<EventLoopThread> {
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new().name(name).spawn(move || {
            let mut event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };
            let _ = tx.send(Ok(event_loop.handle()));
            event_loop.run();
        })?;
        let handle = rx
            .recv()
            .map_err(|_| io::Error::other("loop thread exited before handing over"))??;
        Ok(EventLoopThread { handle, join })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Ask the loop to exit and wait for the thread.
    pub fn quit_and_join(self) {
        self.handle.quit();
        let _ = self.join.join();
    }
}

/// A fixed set of io loops plus round-robin selection.
///
/// With zero threads the caller's base loop services connections itself.
pub struct EventLoopThreadPool {
    name: String,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
}

impl EventLoopThreadPool {
    pub fn new(name: &str, num_threads: usize) -> Self {
        Self {
            name: name.to_string(),
            num_threads,
            threads: Vec::new(),
        }
    }

    pub fn start(&mut self) -> io::Result<()> {
        debug_assert!(self.threads.is_empty(), "pool started twice");
        for i in 0..self.num_threads {
            let thread = EventLoopThread::spawn(format!("{}-io-{}", self.name, i))?;
            self.threads.push(thread);
        }
        debug!(pool = %self.name, threads = self.num_threads, "io loop pool started");
        Ok(())
    }

    /// Handles of every worker loop, in spawn order. Empty when the pool
    /// has zero threads.
    pub fn handles(&self) -> Vec<LoopHandle> {
        self.threads.iter().map(|t| t.handle()).collect()
    }

    /// Quit every worker loop and join the threads.
    pub fn shutdown(&mut self) {
        for thread in self.threads.drain(..) {
            thread.quit_and_join();
        }
    }
}
