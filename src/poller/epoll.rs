use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::Channel;
use crate::interest::Interest;
use crate::poller::Poller;
use crate::ready::Ready;

// Kernel-set tags kept in Channel::index. NEW doubles as the
// freshly-constructed value.
const NEW: i32 = -1;
const ADDED: i32 = 1;
const DELETED: i32 = 2;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

/// `epoll(7)` backend, level-triggered.
///
/// Each channel carries a tag identifying its presence in the kernel set:
/// a `NEW` or `DELETED` channel is `EPOLL_CTL_ADD`ed, an `ADDED` channel
/// whose interest set goes empty is `EPOLL_CTL_DEL`eted (and tagged
/// `DELETED` so it can be cheaply re-added), anything else is a
/// `EPOLL_CTL_MOD`.
pub(crate) struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<libc::c_int, Rc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            // SAFETY: `epoll_create1(2)` ensures the fd is valid.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            events: Vec::with_capacity(INITIAL_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn fill_active(&self, num_events: usize, active: &mut Vec<Rc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for event in &self.events[..num_events] {
            let channel = &self.channels[&(event.u64 as libc::c_int)];
            channel.set_revents(Ready::from_epoll(event.events));
            active.push(channel.clone());
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: channel.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, channel.fd(), &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd = {}: {}", channel.fd(), err);
            } else {
                panic!("epoll_ctl op = {} fd = {}: {}", op, channel.fd(), err);
            }
        }
    }
}

fn interest_to_epoll(interest: Option<Interest>) -> u32 {
    let mut events = 0;
    if let Some(interest) = interest {
        if interest.is_readable() {
            events |= libc::EPOLLIN | libc::EPOLLPRI;
        }
        if interest.is_writable() {
            events |= libc::EPOLLOUT;
        }
    }
    events as u32
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Instant {
        trace!("fd total count {}", self.channels.len());
        self.events.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Instant::now();
        match res {
            Ok(num_events) if num_events > 0 => {
                trace!("{} events happened", num_events);
                let num_events = num_events as usize;
                // SAFETY: `epoll_wait` initialised `num_events` entries.
                unsafe { self.events.set_len(num_events) };
                self.fill_active(num_events, active);
                if num_events == self.events.capacity() {
                    // The list came back full; there may be more events
                    // pending than it can hold.
                    self.events.reserve(self.events.capacity());
                }
            }
            Ok(_) => trace!("nothing happened"),
            // Interrupted by a signal: treat as zero events.
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => error!("EpollPoller::poll: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let tag = channel.index();
        trace!(
            "fd = {} interest = {:?} tag = {}",
            channel.fd(),
            channel.interest(),
            tag
        );
        if tag == NEW || tag == DELETED {
            if tag == NEW {
                assert!(!self.channels.contains_key(&channel.fd()));
                self.channels.insert(channel.fd(), channel.clone());
            } else {
                assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&channel.fd()));
            assert_eq!(tag, ADDED);
            if channel.interest().is_none() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!("remove fd = {}", channel.fd());
        assert!(channel.interest().is_none());
        let removed = self.channels.remove(&channel.fd());
        assert!(removed.is_some());

        if channel.index() == ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(NEW);
    }
}
