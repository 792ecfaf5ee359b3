use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::sys::TimerFd;

/// Process-wide monotonically increasing timer sequence numbers. A sequence
/// number identifies a timer for its whole life and is never reused, so a
/// stale `TimerId` can never cancel a newer timer.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a scheduled timer for cancellation.
///
/// Cancelling is always valid: a timer that already fired, was already
/// cancelled, or never existed makes the cancel a no-op.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }
}

struct Timer {
    callback: RefCell<Box<dyn FnMut()>>,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    fn run(&self) {
        let mut callback = self.callback.borrow_mut();
        (*callback)();
    }
}

/// The loop's ordered timer set, fed by a monotonic timer fd.
///
/// Timers are keyed `(expiration, sequence)`, so equal expirations fire in
/// creation order. The kernel timer is always armed to the earliest entry.
pub(crate) struct TimerQueue {
    timer_fd: TimerFd,
    channel: Rc<Channel>,
    timers: RefCell<BTreeMap<(Instant, u64), Rc<Timer>>>,
    // sequence -> current expiration, for cancellation lookup.
    active: RefCell<HashMap<u64, Instant>>,
    calling_expired: Cell<bool>,
    // Sequences cancelled while their callback batch was firing; the
    // re-arm step skips re-inserting these.
    canceling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: Weak<LoopInner>, timer_fd: TimerFd) -> TimerQueue {
        use std::os::fd::AsRawFd;

        let channel = Channel::new(event_loop, timer_fd.as_raw_fd());
        TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(HashSet::new()),
        }
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    /// Inserts a timer; loop thread only (the loop posts on behalf of
    /// foreign threads).
    pub(crate) fn add(
        &self,
        sequence: u64,
        callback: Box<dyn FnMut()>,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Rc::new(Timer {
            callback: RefCell::new(callback),
            interval,
            sequence,
        });
        if self.insert(timer, when) {
            self.timer_fd.set_time(when);
        }
        TimerId::new(sequence)
    }

    /// Removes a timer, or records it as cancelled if it is in the batch
    /// currently firing so the re-arm step drops it.
    pub(crate) fn cancel(&self, id: TimerId) {
        let expiration = self.active.borrow_mut().remove(&id.sequence);
        match expiration {
            Some(when) => {
                let removed = self.timers.borrow_mut().remove(&(when, id.sequence));
                debug_assert!(removed.is_some());
            }
            None if self.calling_expired.get() => {
                self.canceling.borrow_mut().insert(id.sequence);
            }
            None => {}
        }
    }

    /// Fire path: drains the timer fd, runs every expired callback in
    /// expiration order, re-inserts surviving repeating timers and re-arms
    /// the kernel timer to the new earliest entry.
    pub(crate) fn handle_read(&self) {
        self.timer_fd.read();
        let now = Instant::now();
        let expired = self.expired_before(now);

        self.calling_expired.set(true);
        self.canceling.borrow_mut().clear();
        for (_, timer) in &expired {
            timer.run();
        }
        self.calling_expired.set(false);

        self.restart(expired, now);
    }

    /// Extracts every entry with `expiration <= now`, inclusive of equal
    /// expirations via a sentinel just above any real sequence number.
    fn expired_before(&self, now: Instant) -> Vec<((Instant, u64), Rc<Timer>)> {
        let mut timers = self.timers.borrow_mut();
        let rest = timers.split_off(&(now, u64::MAX));
        let expired: Vec<_> = std::mem::replace(&mut *timers, rest).into_iter().collect();
        drop(timers);

        let mut active = self.active.borrow_mut();
        for ((_, sequence), _) in &expired {
            active.remove(sequence);
        }
        expired
    }

    fn restart(&self, expired: Vec<((Instant, u64), Rc<Timer>)>, now: Instant) {
        for ((_, sequence), timer) in expired {
            match timer.interval {
                Some(interval) if !self.canceling.borrow().contains(&sequence) => {
                    self.insert(timer, now + interval);
                }
                _ => {}
            }
        }
        let next = self.timers.borrow().keys().next().map(|&(when, _)| when);
        if let Some(when) = next {
            self.timer_fd.set_time(when);
        }
    }

    /// Returns whether the new timer became the earliest.
    fn insert(&self, timer: Rc<Timer>, when: Instant) -> bool {
        let mut timers = self.timers.borrow_mut();
        let earliest_changed = timers
            .keys()
            .next()
            .map_or(true, |&(earliest, _)| when < earliest);
        self.active.borrow_mut().insert(timer.sequence, when);
        let replaced = timers.insert((when, timer.sequence), timer);
        debug_assert!(replaced.is_none());
        earliest_changed
    }
}
