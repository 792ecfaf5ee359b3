use std::cell::Cell;
use std::io;
use std::sync::mpsc;
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// A thread running one event loop.
///
/// `spawn` returns once the loop exists, so the handle is valid
/// immediately. Dropping the `LoopThread` quits the loop and joins the
/// thread.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    pub fn spawn(name: &str) -> io::Result<LoopThread> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
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
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "loop thread died"))??;
        Ok(LoopThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A round-robin pool of I/O loops fed from a base loop.
///
/// With zero threads every request for a loop yields the base handle, so a
/// server degrades to handling connections on its own loop.
pub struct LoopThreadPool {
    base: LoopHandle,
    threads: Vec<LoopThread>,
    next: Cell<usize>,
}

impl LoopThreadPool {
    pub fn new(base: LoopHandle) -> LoopThreadPool {
        LoopThreadPool {
            base,
            threads: Vec::new(),
            next: Cell::new(0),
        }
    }

    /// Spawns `num_threads` I/O loops named `"{name}-io-{i}"`.
    pub fn start(&mut self, num_threads: usize, name: &str) -> io::Result<()> {
        assert!(self.threads.is_empty(), "pool already started");
        for i in 0..num_threads {
            self.threads.push(LoopThread::spawn(&format!("{}-io-{}", name, i))?);
        }
        debug!("LoopThreadPool started {} thread(s)", num_threads);
        Ok(())
    }

    /// The next loop in round-robin order, or the base loop for an empty
    /// pool.
    pub fn next_loop(&self) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let index = self.next.get();
        self.next.set((index + 1) % self.threads.len());
        self.threads[index].handle()
    }
}
