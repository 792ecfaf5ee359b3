use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::sys::{TimerFd, Waker};
use crate::timer::{self, TimerId, TimerQueue};

/// How long one kernel wait may block when nothing happens.
const POLL_TIME_MS: i32 = 10_000;

thread_local! {
    /// The loop owning the current thread, if any. At most one per thread.
    static CURRENT_LOOP: RefCell<Weak<LoopInner>> = RefCell::new(Weak::new());
}

type Task = Box<dyn FnOnce()>;
type SendTask = Box<dyn FnOnce() + Send>;

/// Key into a loop's local slot registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(usize);

/// The cross-thread half of a loop: everything a foreign thread may touch.
pub(crate) struct Shared {
    pending: Mutex<Vec<SendTask>>,
    waker: Waker,
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

/// A single-threaded event dispatcher.
///
/// Construction binds the loop to the current thread; at most one loop may
/// exist per thread at a time and every dispatch happens on that thread.
/// [`run`] blocks polling for readiness, invoking channel callbacks, firing
/// due timers and draining work posted from other threads, until [`quit`]
/// is called.
///
/// `EventLoop` itself never leaves its thread; a [`LoopHandle`] (from
/// [`handle`]) is the `Send + Clone` face used to post work, schedule
/// timers or quit from anywhere.
///
/// [`run`]: EventLoop::run
/// [`quit`]: EventLoop::quit
/// [`handle`]: EventLoop::handle
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

pub(crate) struct LoopInner {
    weak_self: Weak<LoopInner>,
    shared: Arc<Shared>,
    looping: Cell<bool>,
    poller: RefCell<Box<dyn Poller>>,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    timers: TimerQueue,
    wakeup_channel: Rc<Channel>,
    local_pending: RefCell<Vec<Task>>,
    poll_return_time: Cell<Instant>,
    // Loop-confined component state (connection cores, connectors, server
    // cores) keyed so cross-thread handles can find their way back.
    slots: RefCell<HashMap<Token, Rc<dyn Any>>>,
    next_token: Cell<usize>,
}

impl EventLoop {
    /// Creates a loop bound to the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live loop: one loop per thread
    /// is a hard invariant, violating it would mean loop-confined state has
    /// two mutators.
    pub fn new() -> io::Result<EventLoop> {
        let occupied = CURRENT_LOOP.with(|current| current.borrow().strong_count() > 0);
        assert!(
            !occupied,
            "another EventLoop already exists on this thread"
        );

        let waker = Waker::new()?;
        let wakeup_fd = waker.as_raw_fd();
        let timer_fd = TimerFd::new()?;
        let poller = poller::new_default_poller()?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            waker,
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
        });

        let inner = Rc::new_cyclic(|weak_self: &Weak<LoopInner>| LoopInner {
            weak_self: weak_self.clone(),
            shared,
            looping: Cell::new(false),
            poller: RefCell::new(poller),
            active_channels: RefCell::new(Vec::new()),
            timers: TimerQueue::new(weak_self.clone(), timer_fd),
            wakeup_channel: Channel::new(weak_self.clone(), wakeup_fd),
            local_pending: RefCell::new(Vec::new()),
            poll_return_time: Cell::new(Instant::now()),
            slots: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
        });

        // Wire the internal channels now that weak upgrades succeed.
        let weak = inner.weak_self.clone();
        inner.wakeup_channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                if let Err(err) = event_loop.shared.waker.drain() {
                    error!("EventLoop wakeup drain: {}", err);
                }
            }
        });
        inner.wakeup_channel.enable_reading();

        let weak = inner.weak_self.clone();
        inner.timers.channel().set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timers.handle_read();
            }
        });
        inner.timers.channel().enable_reading();

        CURRENT_LOOP.with(|current| *current.borrow_mut() = inner.weak_self.clone());
        debug!("EventLoop created on {:?}", inner.shared.thread);
        Ok(EventLoop { inner })
    }

    /// Runs the dispatch cycle until [`quit`](EventLoop::quit) is called:
    /// wait for readiness, invoke the callbacks of every active channel,
    /// then drain work posted from other threads.
    pub fn run(&mut self) {
        let inner = &self.inner;
        inner.assert_in_loop_thread();
        assert!(!inner.looping.get(), "EventLoop::run called reentrantly");
        inner.looping.set(true);
        debug!("EventLoop start looping");

        while !inner.shared.quit.load(Ordering::Acquire) {
            let mut active = inner.active_channels.take();
            active.clear();
            let now = inner.poller.borrow_mut().poll(POLL_TIME_MS, &mut active);
            inner.poll_return_time.set(now);
            for channel in &active {
                trace!("dispatch fd = {}", channel.fd());
                channel.handle_event(now);
            }
            inner.active_channels.replace(active);
            inner.drain_pending();
        }

        inner.looping.set(false);
        debug!("EventLoop stop looping");
    }

    /// Stops the loop after the current iteration.
    pub fn quit(&self) {
        self.inner.handle().quit();
    }

    /// Runs `task` immediately: the caller is by construction on the loop
    /// thread. Use a [`LoopHandle`] to post from other threads.
    pub fn run_in_loop(&self, task: impl FnOnce() + 'static) {
        self.inner.assert_in_loop_thread();
        task();
    }

    /// Defers `task` to the tail of the current (or next) loop iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce() + 'static) {
        self.inner.queue_in_loop_local(Box::new(task));
    }

    /// Schedules `task` at `when`. Returns an id usable with
    /// [`cancel`](EventLoop::cancel).
    pub fn run_at(&self, when: Instant, task: impl FnOnce() + 'static) -> TimerId {
        self.inner.run_at(when, None, once(task))
    }

    /// Schedules `task` after `delay` from now.
    pub fn run_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, task)
    }

    /// Schedules `task` every `interval`, first firing one interval from
    /// now, until cancelled.
    pub fn run_every(&self, interval: Duration, task: impl FnMut() + 'static) -> TimerId {
        self.inner
            .run_at(Instant::now() + interval, Some(interval), Box::new(task))
    }

    /// Cancels a timer. Always valid; cancelling a timer that already fired
    /// or never existed is a no-op.
    pub fn cancel(&self, id: TimerId) {
        self.inner.assert_in_loop_thread();
        self.inner.timers.cancel(id);
    }

    /// The time the poller last returned; timestamps message callbacks.
    pub fn poll_return_time(&self) -> Instant {
        self.inner.poll_return_time.get()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    /// A `Send + Clone` handle for posting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        self.inner.handle()
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(!self.inner.looping.get());
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Weak::new());
    }
}

impl LoopInner {
    pub(crate) fn current() -> Option<Rc<LoopInner>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Loop-confined state must have exactly one mutating thread; going on
    /// after a violation would corrupt it silently.
    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "called from {:?}, but the loop belongs to {:?}",
            thread::current().id(),
            self.shared.thread,
        );
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    /// Defers a (possibly non-`Send`) task from the loop thread itself.
    pub(crate) fn queue_in_loop_local(&self, task: Task) {
        self.assert_in_loop_thread();
        self.local_pending.borrow_mut().push(task);
        // Queued while draining: wake so the next poll returns at once
        // instead of after a full poll interval.
        if self.shared.calling_pending.load(Ordering::Acquire) {
            if let Err(err) = self.shared.waker.wake() {
                error!("EventLoop wakeup: {}", err);
            }
        }
    }

    pub(crate) fn run_at(
        &self,
        when: Instant,
        interval: Option<Duration>,
        task: Box<dyn FnMut()>,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers.add(timer::next_sequence(), task, when, interval)
    }

    pub(crate) fn run_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + 'static,
    ) -> TimerId {
        self.run_at(Instant::now() + delay, None, once(task))
    }

    pub(crate) fn register_slot(&self, state: Rc<dyn Any>) -> Token {
        self.assert_in_loop_thread();
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.slots.borrow_mut().insert(token, state);
        token
    }

    pub(crate) fn slot(&self, token: Token) -> Option<Rc<dyn Any>> {
        self.assert_in_loop_thread();
        self.slots.borrow().get(&token).cloned()
    }

    pub(crate) fn take_slot(&self, token: Token) -> Option<Rc<dyn Any>> {
        self.assert_in_loop_thread();
        self.slots.borrow_mut().remove(&token)
    }

    /// Swaps both pending queues with empty ones and runs the drained tasks
    /// outside any critical section, so a task may post more work without
    /// deadlocking.
    fn drain_pending(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);

        let remote = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in remote {
            task();
        }
        let local = self.local_pending.take();
        for task in local {
            task();
        }

        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

/// A cheap, cloneable, `Send` reference to an [`EventLoop`].
///
/// The only legal way to reach a loop from a foreign thread. Work posted
/// here is queued under a short critical section and executed on the loop
/// thread at the tail of its iteration; if the loop is blocked in the
/// kernel it is woken through the wakeup descriptor.
///
/// Tasks posted by one thread execute in posting order.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Runs `task` immediately when called on the loop thread, otherwise
    /// posts it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Posts `task` for the loop thread, waking the loop when the caller is
    /// foreign or the loop is already draining its queue (either way the
    /// task must not wait out a full poll interval).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Schedules `task` on the loop at `when`.
    ///
    /// The returned [`TimerId`] is valid immediately, even though the
    /// insertion itself happens on the loop thread.
    pub fn run_at(&self, when: Instant, task: impl FnOnce() + Send + 'static) -> TimerId {
        let sequence = timer::next_sequence();
        self.run_in_loop(move || {
            if let Some(event_loop) = LoopInner::current() {
                event_loop.timers.add(sequence, once(task), when, None);
            }
        });
        TimerId::new(sequence)
    }

    pub fn run_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, task)
    }

    pub fn run_every(&self, interval: Duration, task: impl FnMut() + Send + 'static) -> TimerId {
        let sequence = timer::next_sequence();
        let when = Instant::now() + interval;
        self.run_in_loop(move || {
            if let Some(event_loop) = LoopInner::current() {
                event_loop
                    .timers
                    .add(sequence, Box::new(task), when, Some(interval));
            }
        });
        TimerId::new(sequence)
    }

    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(event_loop) = LoopInner::current() {
                event_loop.timers.cancel(id);
            }
        });
    }

    /// Stops the loop after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!("EventLoop wakeup: {}", err);
        }
    }
}

/// Adapts a `FnOnce` into the `FnMut` shape timer callbacks use.
fn once(task: impl FnOnce() + 'static) -> Box<dyn FnMut()> {
    let mut task = Some(task);
    Box::new(move || {
        if let Some(task) = task.take() {
            task();
        }
    })
}
