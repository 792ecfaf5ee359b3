use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::interest::Interest;
use crate::poller::Poller;
use crate::ready::Ready;

/// `poll(2)` backend.
///
/// Keeps a `pollfd` array parallel to the registered channels; each channel
/// remembers its slot index. Removal swaps with the last element so updates
/// stay O(1). A channel whose interest set goes empty is not removed but
/// parked by negating its descriptor (`-fd - 1`), which keeps the slot (and
/// every other channel's index) stable while the kernel ignores the entry.
pub(crate) struct PollPoller {
    poll_fds: Vec<libc::pollfd>,
    channels: HashMap<libc::c_int, Rc<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            poll_fds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, mut num_events: libc::c_int, active: &mut Vec<Rc<Channel>>) {
        for poll_fd in &self.poll_fds {
            if num_events == 0 {
                break;
            }
            if poll_fd.revents != 0 {
                num_events -= 1;
                // Parked entries have a negative fd and never report events.
                let channel = &self.channels[&poll_fd.fd];
                channel.set_revents(Ready::from_poll(poll_fd.revents));
                active.push(channel.clone());
            }
        }
    }
}

fn interest_to_poll(interest: Option<Interest>) -> libc::c_short {
    let mut events = 0;
    if let Some(interest) = interest {
        if interest.is_readable() {
            events |= libc::POLLIN | libc::POLLPRI;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
    }
    events
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Instant {
        let res = syscall!(poll(
            self.poll_fds.as_mut_ptr(),
            self.poll_fds.len() as libc::nfds_t,
            timeout_ms,
        ));
        let now = Instant::now();
        match res {
            Ok(num_events) if num_events > 0 => {
                trace!("{} events happened", num_events);
                self.fill_active(num_events, active);
            }
            Ok(_) => trace!("nothing happened"),
            // Interrupted by a signal: treat as zero events.
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => error!("PollPoller::poll: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        trace!(
            "fd = {} interest = {:?}",
            channel.fd(),
            channel.interest()
        );
        if channel.index() < 0 {
            // A new channel: append a slot.
            assert!(!self.channels.contains_key(&channel.fd()));
            let poll_fd = libc::pollfd {
                fd: channel.fd(),
                events: interest_to_poll(channel.interest()),
                revents: 0,
            };
            self.poll_fds.push(poll_fd);
            channel.set_index(self.poll_fds.len() as i32 - 1);
            self.channels.insert(channel.fd(), channel.clone());
        } else {
            assert!(self.channels.contains_key(&channel.fd()));
            let index = channel.index() as usize;
            let poll_fd = &mut self.poll_fds[index];
            assert!(poll_fd.fd == channel.fd() || poll_fd.fd == -channel.fd() - 1);
            poll_fd.fd = channel.fd();
            poll_fd.events = interest_to_poll(channel.interest());
            poll_fd.revents = 0;
            if channel.interest().is_none() {
                // Park the slot; -fd - 1 round-trips back to fd.
                poll_fd.fd = -poll_fd.fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!("remove fd = {}", channel.fd());
        assert!(channel.interest().is_none());
        let removed = self.channels.remove(&channel.fd());
        assert!(removed.is_some());

        let index = channel.index() as usize;
        self.poll_fds.swap_remove(index);
        if index < self.poll_fds.len() {
            // Fix up the index of the entry that took this slot.
            let mut swapped_fd = self.poll_fds[index].fd;
            if swapped_fd < 0 {
                swapped_fd = -swapped_fd - 1;
            }
            self.channels[&swapped_fd].set_index(index as i32);
        }
        channel.set_index(INDEX_NEW);
    }
}
