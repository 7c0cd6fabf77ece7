//! Subordinate loop threads and their selection policy.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::hash_ring::HashRing;

/// Invoked once per subordinate loop, on that loop's thread, before its
/// first iteration.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Virtual nodes each subordinate loop contributes to the selection ring.
const DEFAULT_VIRTUAL_NODES: usize = 3;

/// A thread whose whole job is running one event loop.
pub struct EventLoopThread {
    join: Option<thread::JoinHandle<()>>,
    handle: LoopHandle,
}

impl EventLoopThread {
    /// Spawn the thread, wait for its loop to come up, and return a handle.
    ///
    /// The loop is created on the new thread's stack; the startup channel
    /// carries its handle back (or the creation error).
    pub fn start(name: &str, init: Option<ThreadInitCallback>) -> Result<EventLoopThread> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&lp);
                }
                let _ = tx.send(Ok(lp.handle()));
                lp.run();
            })
            .map_err(Error::Io)?;

        match rx.recv() {
            Ok(Ok(handle)) => {
                // Wait for the first iteration so a later quit cannot race
                // the loop's startup and be cleared.
                while !handle.is_looping() {
                    thread::yield_now();
                }
                Ok(EventLoopThread {
                    join: Some(join),
                    handle,
                })
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(Error::Io(e))
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::LoopStartup(
                    "loop thread exited before reporting its handle".to_string(),
                ))
            }
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Pool of subordinate loops with consistent-hash selection.
///
/// Connections from the same peer address stick to the same subordinate
/// loop, while distinct peers spread across the pool through the ring's
/// virtual nodes. With zero subordinates every selection returns the main
/// loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    started: bool,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
    ring: HashRing,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> Self {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            num_threads: 0,
            started: false,
            threads: Vec::new(),
            loops: Vec::new(),
            ring: HashRing::new(DEFAULT_VIRTUAL_NODES),
        }
    }

    /// Number of subordinate loops to spawn. Must be set before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Replace the ring's virtual-node count. Must be set before `start`.
    pub fn set_virtual_nodes(&mut self, replicas: usize) {
        self.ring = HashRing::new(replicas);
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Number of subordinate loops actually running.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Spawn the subordinate loops and add each to the selection ring.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<()> {
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}-{}", self.name, i);
            let t = EventLoopThread::start(&name, init.clone())?;
            self.loops.push(t.handle().clone());
            self.ring.add_node(&name, i);
            self.threads.push(t);
            debug!(loop_name = %name, "subordinate loop started");
        }

        // With no subordinates the main loop does the I/O itself; the init
        // callback still runs once, on the main loop.
        if self.num_threads == 0 {
            if let Some(init) = init {
                self.base.run_in_loop(move |lp| init(lp));
            }
        }
        Ok(())
    }

    /// Pick the loop for `key` (a peer IP) via the consistent-hash ring.
    pub fn get_next_loop(&self, key: &str) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base.clone();
        }
        match self.ring.get(key) {
            Some(index) if index < self.loops.len() => self.loops[index].clone(),
            _ => {
                error!(key, "hash ring yielded no usable loop; falling back to main loop");
                self.base.clone()
            }
        }
    }

    /// Every loop in the pool, or the main loop when the pool is empty.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}
