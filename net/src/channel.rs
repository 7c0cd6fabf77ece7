use std::os::unix::io::RawFd;
use std::sync::Weak;

use bitflags::bitflags;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

bitflags! {
    /// Readiness event kinds, used both as an interest mask and as the mask
    /// of events returned by a poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventSet: u8 {
        /// Readable, including urgent/priority data.
        const READABLE = 1 << 0;
        /// Writable.
        const WRITABLE = 1 << 1;
        /// Peer hang-up. Returned only; never part of an interest mask.
        const CLOSED = 1 << 2;
        /// Socket error. Returned only.
        const ERROR = 1 << 3;
    }
}

/// Poller registration status for a channel, tracked privately through the
/// channel so the backend knows whether to add, modify, or re-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Never registered with the backend.
    New,
    /// Currently registered.
    Added,
    /// Known to the reactor but deregistered (interest went empty).
    Deleted,
}

/// Identifier of a channel inside its owner loop's arena.
///
/// Carries a generation counter alongside the slot index so that a slot
/// recycled for a new descriptor is never confused with the old channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ChannelId {
    #[inline]
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        ChannelId {
            slot: slot as u32,
            generation,
        }
    }

    #[inline]
    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Callbacks dispatched when a channel's descriptor reports events.
///
/// The owner registers itself weakly; the loop upgrades the reference before
/// dispatching and skips every callback when the owner is already gone.
pub(crate) trait ChannelHandler {
    fn handle_read(&self, lp: &EventLoop, at: Timestamp);
    fn handle_write(&self, _lp: &EventLoop) {}
    fn handle_close(&self, _lp: &EventLoop) {}
    fn handle_error(&self, _lp: &EventLoop) {}
}

/// Binding of one file descriptor to its interest mask, returned mask, and
/// owner callbacks within one reactor.
///
/// Channels live in the owner loop's arena and are mutated only through that
/// loop, which is what keeps every interest-set change on the owning thread.
pub(crate) struct Channel {
    fd: RawFd,
    interest: EventSet,
    revents: EventSet,
    state: PollState,
    generation: u32,
    handler: Weak<dyn ChannelHandler>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd, generation: u32, handler: Weak<dyn ChannelHandler>) -> Self {
        Channel {
            fd,
            interest: EventSet::empty(),
            revents: EventSet::empty(),
            state: PollState::New,
            generation,
            handler,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn interest(&self) -> EventSet {
        self.interest
    }

    #[inline]
    pub(crate) fn set_interest(&mut self, interest: EventSet) {
        self.interest = interest;
    }

    #[inline]
    pub(crate) fn is_none_interest(&self) -> bool {
        self.interest.is_empty()
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.interest.contains(EventSet::WRITABLE)
    }

    #[inline]
    pub(crate) fn revents(&self) -> EventSet {
        self.revents
    }

    #[inline]
    pub(crate) fn set_revents(&mut self, revents: EventSet) {
        self.revents = revents;
    }

    #[inline]
    pub(crate) fn state(&self) -> PollState {
        self.state
    }

    #[inline]
    pub(crate) fn set_state(&mut self, state: PollState) {
        self.state = state;
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) fn handler(&self) -> Weak<dyn ChannelHandler> {
        self.handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_set_masks() {
        let mut e = EventSet::empty();
        assert!(e.is_empty());
        e |= EventSet::READABLE;
        e |= EventSet::WRITABLE;
        assert!(e.contains(EventSet::READABLE));
        e.remove(EventSet::READABLE);
        assert_eq!(e, EventSet::WRITABLE);
    }

    #[test]
    fn test_channel_id_generation_distinguishes_reuse() {
        let a = ChannelId::new(3, 1);
        let b = ChannelId::new(3, 2);
        assert_ne!(a, b);
        assert_eq!(a.slot(), b.slot());
    }
}
