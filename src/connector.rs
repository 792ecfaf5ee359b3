use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::sys::net;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Asynchronous non-blocking connect with exponential backoff.
///
/// Owns the in-flight socket and a write-readiness channel watching the
/// connect; lives on its loop. The connect flag is shared so `stop` can be
/// requested from any thread (the actual teardown still runs on the loop).
pub(crate) struct Connector {
    // Weak: the connector is registered in the loop's slot registry.
    event_loop: Weak<LoopInner>,
    weak_self: Weak<Connector>,
    server_addr: SocketAddr,
    // Intent to be connected; cleared by stop.
    connect: Arc<AtomicBool>,
    state: Cell<State>,
    retry_delay: Cell<Duration>,
    // Socket and channel exist only while a connect is in flight.
    sock: RefCell<Option<OwnedFd>>,
    channel: RefCell<Option<Rc<Channel>>>,
    new_connection_callback: RefCell<Option<Box<dyn Fn(OwnedFd)>>>,
}

impl Connector {
    fn owner_loop(&self) -> Rc<LoopInner> {
        self.event_loop.upgrade().expect("loop outlives its connector")
    }

    pub(crate) fn new(
        event_loop: Rc<LoopInner>,
        server_addr: SocketAddr,
        connect: Arc<AtomicBool>,
    ) -> Rc<Connector> {
        Rc::new_cyclic(|weak_self| Connector {
            event_loop: Rc::downgrade(&event_loop),
            weak_self: weak_self.clone(),
            server_addr,
            connect,
            state: Cell::new(State::Disconnected),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            sock: RefCell::new(None),
            channel: RefCell::new(None),
            new_connection_callback: RefCell::new(None),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, callback: impl Fn(OwnedFd) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn start_in_loop(&self) {
        self.owner_loop().assert_in_loop_thread();
        assert_eq!(self.state.get(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.connect();
        } else {
            debug!("Connector::start_in_loop - do not connect");
        }
    }

    /// Aborts an in-flight connect. The connect flag must already be
    /// cleared by the caller.
    pub(crate) fn stop_in_loop(&self) {
        self.owner_loop().assert_in_loop_thread();
        if self.state.get() == State::Connecting {
            self.state.set(State::Disconnected);
            let fd = self.remove_and_reset_channel();
            self.retry(fd);
        }
    }

    /// Connect again from scratch with the backoff reset; used by clients
    /// re-establishing a dropped connection.
    pub(crate) fn restart(&self) {
        self.owner_loop().assert_in_loop_thread();
        self.state.set(State::Disconnected);
        self.retry_delay.set(INIT_RETRY_DELAY);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn connect(&self) {
        let fd = match net::new_stream_socket(net::family(&self.server_addr)) {
            Ok(fd) => fd,
            // No descriptor, no recovery path.
            Err(err) => panic!("Connector::connect: socket: {}", err),
        };
        match net::connect(fd.as_raw_fd(), &self.server_addr) {
            Ok(()) => self.connecting(fd),
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => self.connecting(fd),
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH
                    | libc::EHOSTUNREACH
                    | libc::ETIMEDOUT,
                ) => self.retry(Some(fd)),
                _ => {
                    error!("Connector::connect to {}: {}", self.server_addr, err);
                    drop(fd);
                }
            },
        }
    }

    /// The connect is in flight: watch for write readiness to learn the
    /// outcome.
    fn connecting(&self, fd: OwnedFd) {
        self.state.set(State::Connecting);
        assert!(self.channel.borrow().is_none());
        let channel = Channel::new(self.event_loop.clone(), fd.as_raw_fd());

        let weak = self.weak_self.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.weak_self.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });

        channel.enable_writing();
        *self.sock.borrow_mut() = Some(fd);
        *self.channel.borrow_mut() = Some(channel);
    }

    /// Detaches the watch channel and surrenders the in-flight socket.
    /// Dispatch still holds the channel alive until its callback returns.
    fn remove_and_reset_channel(&self) -> Option<OwnedFd> {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        self.sock.borrow_mut().take()
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write {:?}", self.state.get());
        if self.state.get() != State::Connecting {
            // stop() got here first.
            assert_eq!(self.state.get(), State::Disconnected);
            return;
        }
        let fd = match self.remove_and_reset_channel() {
            Some(fd) => fd,
            None => return,
        };
        let err = net::socket_error(fd.as_raw_fd());
        if err != 0 {
            warn!(
                "Connector::handle_write - SO_ERROR = {}",
                io::Error::from_raw_os_error(err)
            );
            self.retry(Some(fd));
        } else if net::is_self_connected(fd.as_raw_fd()) {
            warn!("Connector::handle_write - self connect");
            self.retry(Some(fd));
        } else {
            self.state.set(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                if let Some(callback) = &*self.new_connection_callback.borrow() {
                    callback(fd);
                }
            } else {
                drop(fd);
            }
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error state = {:?}", self.state.get());
        if self.state.get() == State::Connecting {
            let fd = self.remove_and_reset_channel();
            if let Some(fd) = &fd {
                let err = net::socket_error(fd.as_raw_fd());
                trace!("SO_ERROR = {}", io::Error::from_raw_os_error(err));
            }
            self.retry(fd);
        }
    }

    /// Closes the failed socket and schedules the next attempt, doubling
    /// the delay up to the cap.
    fn retry(&self, fd: Option<OwnedFd>) {
        drop(fd);
        self.state.set(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = self.retry_delay.get();
            info!(
                "Connector::retry - retry connecting to {} in {:?}",
                self.server_addr, delay
            );
            let weak = self.weak_self.clone();
            self.owner_loop().run_after(delay, move || {
                if let Some(connector) = weak.upgrade() {
                    if connector.state.get() == State::Disconnected {
                        connector.start_in_loop();
                    }
                }
            });
            self.retry_delay.set((delay * 2).min(MAX_RETRY_DELAY));
        } else {
            debug!("Connector::retry - do not connect");
        }
    }
}
