//! One-loop-per-thread reactor.
//!
//! An [`EventLoop`] owns a poller, a timer queue, a wakeup descriptor, and a
//! queue of deferred tasks. It is deliberately `!Send`: a loop is created on
//! the thread that runs it and every channel, timer, and connection it owns
//! is mutated on that thread only. Other threads reach a loop through its
//! [`LoopHandle`], which enqueues tasks and interrupts the blocking wait via
//! an eventfd.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak as RcWeak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, info, trace};

use crate::channel::{Channel, ChannelHandler, ChannelId, EventSet};
use crate::poller::{default_poller, Poller};
use crate::timer::{Timer, TimerQueue};
use crate::timestamp::Timestamp;

/// Liveness timeout for the blocking wait; a wakeup write interrupts it long
/// before this expires.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A deferred task. The draining loop passes itself to the task, which is how
/// work that crossed threads regains access to the owner loop.
pub(crate) type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<RcWeak<Inner>> = RefCell::new(RcWeak::new());
}

/// State reachable from other threads.
struct Shared {
    thread: ThreadId,
    wakeup_fd: OwnedFd,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    looping: AtomicBool,
}

impl Shared {
    #[inline]
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Interrupt the owner loop's blocking wait with an 8-byte counter write.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(bytes = n, "wakeup write returned unexpected byte count");
        }
    }

    fn queue(&self, task: Task) {
        self.pending.lock().push(task);
        // Wake when the enqueue comes from a foreign thread, or when the
        // owner is mid-drain: the drain runs after the poll, so without a
        // wakeup the next poll could block the full timeout before this task
        // executes.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }
}

/// Loop-private state.
struct Inner {
    shared: Arc<Shared>,
    poller: RefCell<Box<dyn Poller>>,
    channels: RefCell<Slab<Channel>>,
    next_generation: Cell<u32>,
    timers: RefCell<TimerQueue>,
    // Keep the descriptor handlers alive; their channels hold weak ties.
    wakeup_handler: Arc<WakeupHandler>,
    timer_handler: Arc<TimerHandler>,
}

/// Per-thread reactor. Cheap to clone; clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// Cross-thread handle to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

struct WakeupHandler;

impl ChannelHandler for WakeupHandler {
    fn handle_read(&self, lp: &EventLoop, _at: Timestamp) {
        lp.drain_wakeup();
    }
}

struct TimerHandler;

impl ChannelHandler for TimerHandler {
    fn handle_read(&self, lp: &EventLoop, _at: Timestamp) {
        lp.process_expired_timers();
    }
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl EventLoop {
    /// Create the reactor for the current thread.
    ///
    /// # Panics
    ///
    /// Panics when a loop already exists on this thread; one loop per thread
    /// is a hard invariant.
    pub fn new() -> io::Result<EventLoop> {
        CURRENT_LOOP.with(|current| {
            if current.borrow().upgrade().is_some() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let wakeup_fd = create_eventfd()?;
        let poller = default_poller()?;
        let timers = TimerQueue::new()?;

        let shared = Arc::new(Shared {
            thread: thread::current().id(),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
        });

        let inner = Rc::new(Inner {
            shared,
            poller: RefCell::new(poller),
            channels: RefCell::new(Slab::new()),
            next_generation: Cell::new(0),
            timers: RefCell::new(timers),
            wakeup_handler: Arc::new(WakeupHandler),
            timer_handler: Arc::new(TimerHandler),
        });
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Rc::downgrade(&inner));

        let lp = EventLoop { inner };

        let wakeup_fd = lp.inner.shared.wakeup_fd.as_raw_fd();
        let wakeup_handler_dyn: Arc<dyn ChannelHandler> = lp.inner.wakeup_handler.clone();
        let wakeup_tie: Weak<dyn ChannelHandler> = Arc::downgrade(&wakeup_handler_dyn);
        let wakeup_channel = lp.add_channel(wakeup_fd, wakeup_tie);
        lp.enable_reading(wakeup_channel);

        let timer_fd = lp.inner.timers.borrow().fd();
        let timer_handler_dyn: Arc<dyn ChannelHandler> = lp.inner.timer_handler.clone();
        let timer_tie: Weak<dyn ChannelHandler> = Arc::downgrade(&timer_handler_dyn);
        let timer_channel = lp.add_channel(timer_fd, timer_tie);
        lp.enable_reading(timer_channel);

        debug!(thread = ?thread::current().id(), "event loop created");
        Ok(lp)
    }

    /// The loop running on the current thread, if any.
    pub fn current() -> Option<EventLoop> {
        CURRENT_LOOP
            .with(|current| current.borrow().upgrade())
            .map(|inner| EventLoop { inner })
    }

    /// A handle other threads may use to reach this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.shared.is_in_loop_thread()
    }

    /// Run the event-dispatch cycle until [`quit`](Self::quit) is requested.
    ///
    /// Each iteration blocks on the poller, dispatches every active channel,
    /// then drains the deferred-task queue.
    pub fn run(&self) {
        let shared = &self.inner.shared;
        // Clear the quit flag before publishing `looping`: once a caller
        // observes the loop as running, its quit request cannot be lost.
        shared.quit.store(false, Ordering::Release);
        shared.looping.store(true, Ordering::Release);
        info!("event loop started");

        let mut active: Vec<ChannelId> = Vec::new();
        while !shared.quit.load(Ordering::Acquire) {
            active.clear();
            let poll_time = {
                let mut poller = self.inner.poller.borrow_mut();
                let mut channels = self.inner.channels.borrow_mut();
                match poller.poll(Some(POLL_TIMEOUT), &mut channels, &mut active) {
                    Ok(at) => at,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        Timestamp::now()
                    }
                }
            };

            for id in &active {
                let (revents, tie) = {
                    let channels = self.inner.channels.borrow();
                    match channels.get(id.slot()) {
                        Some(ch) if ch.generation() == id.generation => {
                            (ch.revents(), ch.handler())
                        }
                        // Removed by an earlier callback in this batch.
                        _ => continue,
                    }
                };
                let Some(handler) = tie.upgrade() else {
                    trace!(slot = id.slot, "channel owner gone; skipping callbacks");
                    continue;
                };

                if revents.contains(EventSet::CLOSED) && !revents.contains(EventSet::READABLE) {
                    handler.handle_close(self);
                }
                if revents.contains(EventSet::ERROR) {
                    handler.handle_error(self);
                }
                if revents.contains(EventSet::READABLE) {
                    handler.handle_read(self, poll_time);
                }
                if revents.contains(EventSet::WRITABLE) {
                    handler.handle_write(self);
                }
            }

            self.drain_pending();
        }

        shared.looping.store(false, Ordering::Release);
        info!("event loop stopped");
    }

    /// Request a cooperative exit; the current iteration completes first.
    pub fn quit(&self) {
        self.inner.shared.quit.store(true, Ordering::Release);
    }

    /// Execute `task` now. The loop lives on this thread by construction, so
    /// there is nothing to defer.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop)) {
        task(self);
    }

    /// Enqueue `task` for the deferred-task drain of this iteration's tail
    /// (or the next iteration when enqueued mid-drain).
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.inner.shared.queue(Box::new(task));
    }

    /// Schedule `callback` at an absolute time.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut(&EventLoop) + Send + 'static) {
        self.add_timer(Timer {
            callback: Box::new(callback),
            expiration: when,
            interval: None,
        });
    }

    /// Schedule `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) {
        self.run_at(Timestamp::now().add_duration(delay), callback);
    }

    /// Schedule `callback` every `interval`, first firing one interval from
    /// now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) {
        self.add_timer(Timer {
            callback: Box::new(callback),
            expiration: Timestamp::now().add_duration(interval),
            interval: Some(interval),
        });
    }

    pub(crate) fn add_timer(&self, timer: Timer) {
        let mut timers = self.inner.timers.borrow_mut();
        let expiration = timer.expiration;
        if timers.insert(timer) {
            timers.rearm(expiration);
        }
    }

    fn process_expired_timers(&self) {
        let now = Timestamp::now();
        let expired = {
            let mut timers = self.inner.timers.borrow_mut();
            timers.drain_fd();
            timers.take_expired(now)
        };

        // Callbacks run with no queue borrow held; they are free to schedule
        // further timers, which fire no earlier than the next iteration.
        let mut repeats = Vec::new();
        for mut timer in expired {
            (timer.callback)(self);
            if let Some(interval) = timer.interval {
                timer.expiration = now.add_duration(interval);
                repeats.push(timer);
            }
        }

        let mut timers = self.inner.timers.borrow_mut();
        for timer in repeats {
            timers.insert(timer);
        }
        if let Some(earliest) = timers.earliest() {
            timers.rearm(earliest);
        }
    }

    fn drain_wakeup(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.inner.shared.wakeup_fd.as_raw_fd(),
                &mut one as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(bytes = n, "wakeup read returned unexpected byte count");
        }
    }

    /// Swap the pending queue out under the mutex, then run the tasks with no
    /// lock held so they may enqueue further tasks freely.
    fn drain_pending(&self) {
        let shared = &self.inner.shared;
        shared.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *shared.pending.lock());
        for task in tasks {
            task(self);
        }
        shared.calling_pending.store(false, Ordering::Release);
    }

    // --- channel arena ---

    pub(crate) fn add_channel(&self, fd: RawFd, tie: Weak<dyn ChannelHandler>) -> ChannelId {
        let generation = self.inner.next_generation.get().wrapping_add(1);
        self.inner.next_generation.set(generation);
        let slot = self
            .inner
            .channels
            .borrow_mut()
            .insert(Channel::new(fd, generation, tie));
        ChannelId::new(slot, generation)
    }

    pub(crate) fn enable_reading(&self, id: ChannelId) {
        self.modify_interest(id, |mask| mask | EventSet::READABLE);
    }

    pub(crate) fn enable_writing(&self, id: ChannelId) {
        self.modify_interest(id, |mask| mask | EventSet::WRITABLE);
    }

    pub(crate) fn disable_writing(&self, id: ChannelId) {
        self.modify_interest(id, |mask| mask - EventSet::WRITABLE);
    }

    pub(crate) fn disable_all(&self, id: ChannelId) {
        self.modify_interest(id, |_| EventSet::empty());
    }

    pub(crate) fn is_writing(&self, id: ChannelId) -> bool {
        let channels = self.inner.channels.borrow();
        channels
            .get(id.slot())
            .map_or(false, |ch| ch.generation() == id.generation && ch.is_writing())
    }

    fn modify_interest(&self, id: ChannelId, apply: impl FnOnce(EventSet) -> EventSet) {
        let mut channels = self.inner.channels.borrow_mut();
        let Some(channel) = channels.get_mut(id.slot()) else {
            return;
        };
        if channel.generation() != id.generation {
            return;
        }
        channel.set_interest(apply(channel.interest()));

        let mut poller = self.inner.poller.borrow_mut();
        if let Err(e) = poller.update_channel(id, channel) {
            if channel.is_none_interest() {
                // A failed deregistration only means stale readiness reports.
                error!(fd = channel.fd(), error = %e, "poller deregister failed");
            } else {
                panic!(
                    "poller registration failed for fd {}: {e}",
                    channel.fd()
                );
            }
        }
    }

    pub(crate) fn remove_channel(&self, id: ChannelId) {
        let mut channels = self.inner.channels.borrow_mut();
        let matches = channels
            .get(id.slot())
            .map_or(false, |ch| ch.generation() == id.generation);
        if !matches {
            return;
        }
        let mut channel = channels.remove(id.slot());
        let mut poller = self.inner.poller.borrow_mut();
        if let Err(e) = poller.remove_channel(id, &mut channel) {
            error!(fd = channel.fd(), error = %e, "poller remove failed");
        }
    }
}

impl LoopHandle {
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Whether the owner loop is inside [`EventLoop::run`].
    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `task` on the owner loop: inline when called from the owner
    /// thread, otherwise enqueued followed by a wakeup.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                if Arc::ptr_eq(&lp.inner.shared, &self.shared) {
                    task(&lp);
                    return;
                }
            }
        }
        self.shared.queue(Box::new(task));
    }

    /// Enqueue `task` unconditionally.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Request the owner loop to exit, waking it if called from elsewhere.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Schedule a timer at an absolute time on the owner loop.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut(&EventLoop) + Send + 'static) {
        self.run_in_loop(move |lp| lp.run_at(when, callback));
    }

    /// Schedule a one-shot timer `delay` from now on the owner loop.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) {
        let when = Timestamp::now().add_duration(delay);
        self.run_in_loop(move |lp| lp.run_at(when, callback));
    }

    /// Schedule a repeating timer on the owner loop.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) {
        let first = Timestamp::now().add_duration(interval);
        self.run_in_loop(move |lp| {
            lp.add_timer(Timer {
                callback: Box::new(callback),
                expiration: first,
                interval: Some(interval),
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Spawn a loop on its own thread and hand back its handle once the
    /// loop is actually running.
    fn spawn_loop() -> (thread::JoinHandle<()>, LoopHandle) {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run();
        });
        let handle = rx.recv().unwrap();
        while !handle.is_looping() {
            thread::yield_now();
        }
        (join, handle)
    }

    #[test]
    #[should_panic(expected = "another EventLoop")]
    fn test_one_loop_per_thread() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn test_second_loop_allowed_after_drop() {
        let first = EventLoop::new().unwrap();
        drop(first);
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn test_current_resolves_to_this_loop() {
        let lp = EventLoop::new().unwrap();
        let current = EventLoop::current().unwrap();
        assert!(Arc::ptr_eq(&lp.inner.shared, &current.inner.shared));
    }

    #[test]
    fn test_queue_in_loop_wakes_promptly() {
        let (join, handle) = spawn_loop();

        let (tx, rx) = mpsc::channel();
        let enqueued = Instant::now();
        handle.queue_in_loop(move |lp| {
            tx.send((enqueued.elapsed(), thread::current().id())).unwrap();
            lp.quit();
        });

        let (latency, ran_on) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // Far below the 10 s poll timeout; the wakeup interrupted the wait.
        assert!(latency < Duration::from_millis(500), "latency {latency:?}");
        assert_ne!(ran_on, thread::current().id());
        join.join().unwrap();
    }

    #[test]
    fn test_run_in_loop_inline_on_owner_thread() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let mut ran = false;
        handle.run_in_loop(|_| ()); // exercises the cross-handle path too
        lp.run_in_loop(|_| ran = true);
        assert!(ran);
    }

    #[test]
    fn test_tasks_run_in_enqueue_order() {
        let (join, handle) = spawn_loop();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            handle.queue_in_loop(move |_| order.lock().push(i));
        }
        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move |lp| {
            tx.send(()).unwrap();
            lp.quit();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        join.join().unwrap();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_timer_ordering_with_ties() {
        let (join, handle) = spawn_loop();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let base = Timestamp::now().add_seconds(0.05);
        for (label, at) in [
            ("late", base.add_seconds(0.03)),
            ("early-a", base),
            ("early-b", base), // same expiration; insertion order breaks the tie
        ] {
            let fired = fired.clone();
            handle.run_at(at, move |_| fired.lock().push(label));
        }

        let (tx, rx) = mpsc::channel();
        handle.run_after(Duration::from_millis(200), move |lp| {
            tx.send(()).unwrap();
            lp.quit();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        join.join().unwrap();

        assert_eq!(*fired.lock(), vec!["early-a", "early-b", "late"]);
    }

    #[test]
    fn test_repeating_timer_fires_repeatedly() {
        let (join, handle) = spawn_loop();
        let count = Arc::new(Mutex::new(0u32));

        let c = count.clone();
        handle.run_every(Duration::from_millis(20), move |_| *c.lock() += 1);

        let (tx, rx) = mpsc::channel();
        handle.run_after(Duration::from_millis(150), move |lp| {
            tx.send(()).unwrap();
            lp.quit();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        join.join().unwrap();

        let fired = *count.lock();
        assert!(fired >= 3, "repeating timer fired only {fired} times");
    }

    #[test]
    fn test_quit_from_foreign_thread() {
        let (join, handle) = spawn_loop();
        assert!(!handle.is_in_loop_thread());
        handle.quit();
        join.join().unwrap();
        assert!(!handle.is_looping());
    }

    #[test]
    fn test_timer_callback_can_schedule_more() {
        let (join, handle) = spawn_loop();
        let (tx, rx) = mpsc::channel();
        handle.run_after(Duration::from_millis(10), move |lp| {
            let tx = tx.clone();
            lp.run_after(Duration::from_millis(10), move |lp| {
                tx.send(()).unwrap();
                lp.quit();
            });
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        join.join().unwrap();
    }
}
