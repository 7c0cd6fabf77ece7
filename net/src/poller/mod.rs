//! Readiness notification backends.
//!
//! The reactor talks to an abstract [`Poller`]; the shipped backend is
//! level-triggered epoll. A `RIPPLE_USE_POLL` environment switch is reserved
//! for a poll(2) backend, which is not currently implemented.

mod epoll;

use std::io;
use std::time::Duration;

use slab::Slab;
use tracing::warn;

use crate::channel::{Channel, ChannelId};
use crate::timestamp::Timestamp;

pub(crate) use epoll::EpollPoller;

/// Environment variable reserved for selecting the poll(2) backend.
pub(crate) const USE_POLL_ENV: &str = "RIPPLE_USE_POLL";

/// Abstract readiness notifier.
///
/// A poller never owns channels; it registers, deregisters, and waits on
/// their descriptors, and on wake fills in each active channel's returned
/// mask. Every channel it has been told about with a non-empty interest mask
/// is registered with the backend.
pub(crate) trait Poller {
    /// Block up to `timeout` and record the channels with a non-empty
    /// returned mask into `active`. Returns a timestamp sampled immediately
    /// after wake.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        channels: &mut Slab<Channel>,
        active: &mut Vec<ChannelId>,
    ) -> io::Result<Timestamp>;

    /// Apply a channel's current interest mask to the backend.
    ///
    /// Registration transitions: an unregistered channel with a non-empty
    /// mask is added; a registered channel with an empty mask is deleted
    /// (but stays known); a registered channel with a non-empty mask is
    /// modified.
    fn update_channel(&mut self, id: ChannelId, channel: &mut Channel) -> io::Result<()>;

    /// Forget a channel entirely, deregistering it first if needed.
    fn remove_channel(&mut self, id: ChannelId, channel: &mut Channel) -> io::Result<()>;
}

/// Construct the backend selected by the environment.
pub(crate) fn default_poller() -> io::Result<Box<dyn Poller>> {
    if std::env::var(USE_POLL_ENV).is_ok_and(|v| !v.is_empty()) {
        warn!(
            "{} is set but the poll(2) backend is not implemented; using the epoll backend",
            USE_POLL_ENV
        );
    }
    Ok(Box::new(EpollPoller::new()?))
}
