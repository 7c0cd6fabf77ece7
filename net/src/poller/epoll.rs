//! Level-triggered epoll backend.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use slab::Slab;
use tracing::trace;

use super::Poller;
use crate::channel::{Channel, ChannelId, EventSet, PollState};
use crate::timestamp::Timestamp;

/// Initial readiness array capacity; doubled whenever a wait fills it.
const INITIAL_EVENT_CAPACITY: usize = 64;

const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_CAPACITY],
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel, slot: usize) -> io::Result<()> {
        let mut interest: u32 = 0;
        if channel.interest().contains(EventSet::READABLE) {
            interest |= READ_EVENTS;
        }
        if channel.interest().contains(EventSet::WRITABLE) {
            interest |= WRITE_EVENTS;
        }
        let mut event = libc::epoll_event {
            events: interest,
            u64: slot as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn revents_of(bits: u32) -> EventSet {
    let mut revents = EventSet::empty();
    if bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        revents |= EventSet::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        revents |= EventSet::WRITABLE;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        revents |= EventSet::CLOSED;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        revents |= EventSet::ERROR;
    }
    revents
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        channels: &mut Slab<Channel>,
        active: &mut Vec<ChannelId>,
    ) -> io::Result<Timestamp> {
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let at = Timestamp::now();
        if n < 0 {
            let e = io::Error::last_os_error();
            // A signal landing mid-wait is not an error; report zero events.
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(at);
            }
            return Err(e);
        }
        let n = n as usize;

        for i in 0..n {
            let event = self.events[i];
            let slot = event.u64 as usize;
            let Some(channel) = channels.get_mut(slot) else {
                trace!(slot, "readiness for unknown channel slot");
                continue;
            };
            let revents = revents_of(event.events);
            if revents.is_empty() {
                continue;
            }
            channel.set_revents(revents);
            active.push(ChannelId::new(slot, channel.generation()));
        }

        // A full readiness array means events may have been left behind in
        // the kernel; double it for the next wait.
        if n == self.events.len() {
            self.events
                .resize(n * 2, unsafe { std::mem::zeroed() });
        }

        Ok(at)
    }

    fn update_channel(&mut self, id: ChannelId, channel: &mut Channel) -> io::Result<()> {
        match channel.state() {
            PollState::New | PollState::Deleted => {
                if !channel.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_ADD, channel, id.slot())?;
                    channel.set_state(PollState::Added);
                }
            }
            PollState::Added => {
                if channel.is_none_interest() {
                    channel.set_state(PollState::Deleted);
                    self.ctl(libc::EPOLL_CTL_DEL, channel, id.slot())?;
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel, id.slot())?;
                }
            }
        }
        Ok(())
    }

    fn remove_channel(&mut self, id: ChannelId, channel: &mut Channel) -> io::Result<()> {
        let was_added = channel.state() == PollState::Added;
        channel.set_state(PollState::New);
        if was_added {
            self.ctl(libc::EPOLL_CTL_DEL, channel, id.slot())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Weak};

    use crate::channel::ChannelHandler;
    use crate::event_loop::EventLoop;

    struct NopHandler;
    impl ChannelHandler for NopHandler {
        fn handle_read(&self, _lp: &EventLoop, _at: Timestamp) {}
    }

    fn weak_handler() -> (Arc<NopHandler>, Weak<dyn ChannelHandler>) {
        let strong = Arc::new(NopHandler);
        let strong_dyn: Arc<dyn ChannelHandler> = strong.clone();
        let weak: Weak<dyn ChannelHandler> = Arc::downgrade(&strong_dyn);
        (strong, weak)
    }

    #[test]
    fn test_poll_no_events() {
        let mut poller = EpollPoller::new().unwrap();
        let mut channels = Slab::new();
        let mut active = Vec::new();
        let at = poller
            .poll(Some(Duration::from_millis(1)), &mut channels, &mut active)
            .unwrap();
        assert!(active.is_empty());
        assert!(at.is_valid());
    }

    #[test]
    fn test_register_and_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let mut channels: Slab<Channel> = Slab::new();
        let (_strong, weak) = weak_handler();

        let slot = channels.insert(Channel::new(b.as_raw_fd(), 1, weak));
        let id = ChannelId::new(slot, 1);
        channels[slot].set_interest(EventSet::READABLE);
        poller.update_channel(id, &mut channels[slot]).unwrap();
        assert_eq!(channels[slot].state(), PollState::Added);

        a.write_all(b"x").unwrap();
        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_millis(200)), &mut channels, &mut active)
            .unwrap();
        assert_eq!(active, vec![id]);
        assert!(channels[slot].revents().contains(EventSet::READABLE));
    }

    #[test]
    fn test_level_triggered_reports_until_drained() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let mut channels: Slab<Channel> = Slab::new();
        let (_strong, weak) = weak_handler();

        let slot = channels.insert(Channel::new(b.as_raw_fd(), 1, weak));
        let id = ChannelId::new(slot, 1);
        channels[slot].set_interest(EventSet::READABLE);
        poller.update_channel(id, &mut channels[slot]).unwrap();

        a.write_all(b"pending").unwrap();
        // Unconsumed data keeps the descriptor active on every wait.
        for _ in 0..3 {
            let mut active = Vec::new();
            poller
                .poll(Some(Duration::from_millis(200)), &mut channels, &mut active)
                .unwrap();
            assert_eq!(active, vec![id]);
        }
    }

    #[test]
    fn test_empty_interest_deregisters() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let mut channels: Slab<Channel> = Slab::new();
        let (_strong, weak) = weak_handler();

        let slot = channels.insert(Channel::new(b.as_raw_fd(), 1, weak));
        let id = ChannelId::new(slot, 1);
        channels[slot].set_interest(EventSet::READABLE);
        poller.update_channel(id, &mut channels[slot]).unwrap();

        channels[slot].set_interest(EventSet::empty());
        poller.update_channel(id, &mut channels[slot]).unwrap();
        assert_eq!(channels[slot].state(), PollState::Deleted);

        // Re-enabling re-adds the descriptor.
        channels[slot].set_interest(EventSet::WRITABLE);
        poller.update_channel(id, &mut channels[slot]).unwrap();
        assert_eq!(channels[slot].state(), PollState::Added);

        poller.remove_channel(id, &mut channels[slot]).unwrap();
        assert_eq!(channels[slot].state(), PollState::New);
    }

    #[test]
    fn test_peer_close_reports_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let mut channels: Slab<Channel> = Slab::new();
        let (_strong, weak) = weak_handler();

        let slot = channels.insert(Channel::new(b.as_raw_fd(), 1, weak));
        let id = ChannelId::new(slot, 1);
        channels[slot].set_interest(EventSet::READABLE);
        poller.update_channel(id, &mut channels[slot]).unwrap();

        drop(a);
        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_millis(200)), &mut channels, &mut active)
            .unwrap();
        assert_eq!(active, vec![id]);
        // End-of-stream routes through the read path (a zero-length read).
        assert!(channels[slot].revents().contains(EventSet::READABLE));
    }
}
