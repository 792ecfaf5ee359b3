use std::env;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use crate::channel::Channel;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollPoller;
pub(crate) use self::poll::PollPoller;

/// The readiness multiplexer behind an event loop.
///
/// One `poll` call fills `active` with every channel whose received-event
/// set is non-empty and returns the time the call came back. Registration
/// is idempotent on a channel's interest set; a channel must be removed
/// before it is dropped.
///
/// All three operations run on the owning loop's thread only.
pub(crate) trait Poller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Instant;
    fn update_channel(&mut self, channel: &Rc<Channel>);
    fn remove_channel(&mut self, channel: &Channel);
}

/// Picks the backend once, at loop construction: `epoll(7)` unless
/// `EVIO_FORCE_POLL` is set in the environment. There is no re-selection
/// after the loop starts.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if env::var_os("EVIO_FORCE_POLL").is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        Ok(Box::new(EpollPoller::new()?))
    }
}
