use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::warn;

use crate::event_loop::LoopInner;
use crate::interest::Interest;
use crate::ready::Ready;

/// Not yet known to any poller backend. The poll backend stores the slot
/// index here instead; the epoll backend its kernel-set tag.
pub(crate) const INDEX_NEW: i32 = -1;

/// Binds a file descriptor to an interest set and event callbacks on one
/// loop.
///
/// A channel does not own its descriptor; the wrapping object (socket,
/// timer fd, wakeup fd) does. A channel lives entirely on its loop and its
/// callbacks run only on that loop's thread.
pub(crate) struct Channel {
    fd: libc::c_int,
    event_loop: Weak<LoopInner>,
    weak_self: Weak<Channel>,
    interest: Cell<Option<Interest>>,
    revents: Cell<Ready>,
    // Poller bookkeeping: slot index (poll backend) or kernel-set tag
    // (epoll backend).
    index: Cell<i32>,
    handling: Cell<bool>,
    callbacks: RefCell<Callbacks>,
}

#[derive(Default)]
struct Callbacks {
    read: Option<Box<dyn Fn(Instant)>>,
    write: Option<Box<dyn Fn()>>,
    close: Option<Box<dyn Fn()>>,
    error: Option<Box<dyn Fn()>>,
}

impl Channel {
    pub(crate) fn new(event_loop: Weak<LoopInner>, fd: libc::c_int) -> Rc<Channel> {
        Rc::new_cyclic(|weak_self| Channel {
            fd,
            event_loop,
            weak_self: weak_self.clone(),
            interest: Cell::new(None),
            revents: Cell::new(Ready::EMPTY),
            index: Cell::new(INDEX_NEW),
            handling: Cell::new(false),
            callbacks: RefCell::new(Callbacks::default()),
        })
    }

    pub(crate) fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest.get()
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.revents.set(revents);
    }

    pub(crate) fn set_read_callback(&self, cb: impl Fn(Instant) + 'static) {
        self.callbacks.borrow_mut().read = Some(Box::new(cb));
    }

    pub(crate) fn set_write_callback(&self, cb: impl Fn() + 'static) {
        self.callbacks.borrow_mut().write = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl Fn() + 'static) {
        self.callbacks.borrow_mut().close = Some(Box::new(cb));
    }

    pub(crate) fn set_error_callback(&self, cb: impl Fn() + 'static) {
        self.callbacks.borrow_mut().error = Some(Box::new(cb));
    }

    pub(crate) fn enable_reading(&self) {
        self.add_interest(Interest::READABLE);
    }

    pub(crate) fn enable_writing(&self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_writing(&self) {
        self.interest
            .set(self.interest.get().and_then(|i| i.remove(Interest::WRITABLE)));
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.interest.set(None);
        self.update();
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest.get().map_or(false, Interest::is_writable)
    }

    /// Unregisters from the poller. The interest set must be empty.
    pub(crate) fn remove(&self) {
        assert!(self.interest.get().is_none());
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn add_interest(&self, interest: Interest) {
        let new = match self.interest.get() {
            Some(cur) => cur.add(interest),
            None => interest,
        };
        self.interest.set(Some(new));
        self.update();
    }

    fn update(&self) {
        if let (Some(event_loop), Some(this)) =
            (self.event_loop.upgrade(), self.weak_self.upgrade())
        {
            event_loop.update_channel(&this);
        }
    }

    /// Decodes the received event set and invokes the matching callbacks.
    ///
    /// Order matters: an invalid descriptor is only warned about, a hangup
    /// without pending input closes, errors come before reads so `SO_ERROR`
    /// is harvested before the read sees EOF, and writes go last.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        self.handling.set(true);
        let revents = self.revents.get();
        let callbacks = self.callbacks.borrow();

        if revents.is_invalid() {
            warn!("Channel::handle_event: fd {} is invalid (POLLNVAL)", self.fd);
        }
        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = &callbacks.close {
                cb();
            }
        }
        if revents.is_error() || revents.is_invalid() {
            if let Some(cb) = &callbacks.error {
                cb();
            }
        }
        if revents.is_readable() || revents.is_priority() {
            if let Some(cb) = &callbacks.read {
                cb(receive_time);
            }
        }
        if revents.is_writable() {
            if let Some(cb) = &callbacks.write {
                cb();
            }
        }
        self.handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Dispatch holds a strong reference for the duration of
        // handle_event, so this fires only on a genuine lifetime bug.
        assert!(!self.handling.get());
    }
}
