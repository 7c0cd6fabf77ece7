//! Timer set driven by a single kernel timer descriptor.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::error;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Smallest delay the timer descriptor is armed with, to tolerate the clock
/// racing past an expiration between computing the delta and arming.
const MIN_ARM_MICROS: i64 = 100;

pub(crate) type TimerCallback = Box<dyn FnMut(&EventLoop) + Send>;

/// One scheduled callback. A repeating timer carries its interval.
pub(crate) struct Timer {
    pub(crate) callback: TimerCallback,
    pub(crate) expiration: Timestamp,
    pub(crate) interval: Option<Duration>,
}

impl Timer {
    #[inline]
    pub(crate) fn repeats(&self) -> bool {
        self.interval.is_some()
    }
}

/// Ordered set of timers keyed by `(expiration, sequence)`.
///
/// The sequence number is a monotonic per-queue counter, so duplicate
/// expirations stay distinct and ties dispatch in insertion order. The kernel
/// timer descriptor is always armed for the earliest entry.
pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    timers: BTreeMap<(Timestamp, u64), Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            timer_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            timers: BTreeMap::new(),
            next_seq: 0,
        })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.timer_fd.as_raw_fd()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    #[inline]
    pub(crate) fn earliest(&self) -> Option<Timestamp> {
        self.timers.keys().next().map(|(at, _)| *at)
    }

    /// Insert a timer; returns true when it became the new earliest entry,
    /// in which case the caller rearms the descriptor.
    pub(crate) fn insert(&mut self, timer: Timer) -> bool {
        let earliest_changed = self
            .earliest()
            .map_or(true, |earliest| timer.expiration < earliest);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert((timer.expiration, seq), timer);
        earliest_changed
    }

    /// Split off every timer with expiration `<= now`, in dispatch order.
    pub(crate) fn take_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let unexpired = self.timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut self.timers, unexpired);
        expired.into_values().collect()
    }

    /// Arm the descriptor to fire at `expiration`.
    pub(crate) fn rearm(&self, expiration: Timestamp) {
        let mut delta = expiration.micros_since(Timestamp::now());
        if delta < MIN_ARM_MICROS {
            delta = MIN_ARM_MICROS;
        }

        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (delta / Timestamp::MICROS_PER_SECOND) as libc::time_t,
                tv_nsec: ((delta % Timestamp::MICROS_PER_SECOND) * 1000) as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.fd(), 0, &new_value, std::ptr::null_mut())
        };
        if ret != 0 {
            // The timer may fire late; nothing else to do.
            error!(
                error = %io::Error::last_os_error(),
                "timerfd_settime failed"
            );
        }
    }

    /// Acknowledge an expiration by draining the descriptor's counter.
    pub(crate) fn drain_fd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(bytes = n, "timerfd read returned unexpected byte count");
        }
    }
}
