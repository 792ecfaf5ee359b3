use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{LoopHandle, LoopInner, Token};
use crate::socket::Socket;
use crate::sys::net;

/// Invoked when a connection comes up and again when it goes down; check
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Invoked on data arrival with the input buffer and the poll return time.
/// The callback decides how much of the buffer to consume.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync>;
/// Invoked each time the output buffer drains completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Invoked with the new output-buffer size when it grows across the
/// high-water mark, exactly once per upward crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnection, usize) + Send + Sync>;
/// Internal: bound by the owning server/client to unregister the
/// connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// The connection state machine. Transitions are one-directional; a
/// `Disconnected` connection never comes back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

fn state_from_u8(value: u8) -> ConnectionState {
    match value {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Disconnecting,
        _ => ConnectionState::Disconnected,
    }
}

/// The cross-thread half of a connection; see `TcpConnection`.
pub(crate) struct ConnShared {
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    event_loop: LoopHandle,
    // Set once the loop-confined core is registered on the owning loop.
    core: OnceLock<Token>,
    high_water_mark: AtomicUsize,
}

impl ConnShared {
    pub(crate) fn new(
        name: String,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        event_loop: LoopHandle,
    ) -> ConnShared {
        ConnShared {
            name,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            event_loop,
            core: OnceLock::new(),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
        }
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The callbacks wired into a connection by its owning server or client.
#[derive(Clone)]
pub(crate) struct ConnectionCallbacks {
    pub(crate) connection: ConnectionCallback,
    pub(crate) message: MessageCallback,
    pub(crate) write_complete: Option<WriteCompleteCallback>,
    pub(crate) high_water_mark: Option<HighWaterMarkCallback>,
    pub(crate) close: Option<CloseCallback>,
}

/// A handle to one TCP connection.
///
/// Handles are cheap to clone and may be used from any thread: operations
/// invoked off the owning loop post themselves onto it. Callbacks receive a
/// borrowed handle and may clone and stash it; the connection's internals
/// outlive every callback in flight and are reclaimed on the owning loop
/// after the close sequence finishes.
///
/// Every operation on a `Disconnected` connection is a silent no-op.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<ConnShared>,
}

/// The loop-confined half: socket, channel and buffers. Owned by the
/// loop's slot registry and kept alive during dispatch by the channel
/// callbacks' upgraded references. The loop back-pointer is weak: the
/// registry lives inside the loop, a strong pointer would cycle.
pub(crate) struct ConnCore {
    event_loop: Weak<LoopInner>,
    shared: Arc<ConnShared>,
    socket: Socket,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    callbacks: ConnectionCallbacks,
}

impl TcpConnection {
    pub(crate) fn from_shared(shared: Arc<ConnShared>) -> TcpConnection {
        TcpConnection { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A handle to the loop this connection lives on.
    pub fn loop_handle(&self) -> LoopHandle {
        self.shared.event_loop.clone()
    }

    /// Sends `data`, directly when possible, buffered otherwise.
    ///
    /// On the owning loop thread as much as the kernel accepts is written
    /// immediately and the remainder buffered; from any other thread the
    /// bytes are copied and the write posted. Dropped silently unless
    /// `Connected`.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.shared.event_loop.is_in_loop_thread() {
            if let Some(core) = self.core() {
                core.send_in_loop(data);
            }
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.shared.event_loop.queue_in_loop(move || {
                if let Some(core) = conn.core() {
                    core.send_in_loop(&data);
                }
            });
        }
    }

    /// Closes the write side once the output buffer drains; the read side
    /// stays open until the peer closes. Returns immediately.
    pub fn shutdown(&self) {
        if self
            .shared
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            let conn = self.clone();
            self.shared.event_loop.run_in_loop(move || {
                if let Some(core) = conn.core() {
                    core.shutdown_in_loop();
                }
            });
        }
    }

    /// Tears the connection down without waiting for buffered output.
    pub fn force_close(&self) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.shared.set_state(ConnectionState::Disconnecting);
            let conn = self.clone();
            self.shared.event_loop.queue_in_loop(move || {
                if conn.state() == ConnectionState::Disconnecting {
                    if let Some(core) = conn.core() {
                        core.handle_close();
                    }
                }
            });
        }
    }

    /// Output-buffer size that triggers the high-water-mark callback.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.shared.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.with_core(move |core| {
            if let Err(err) = core.socket.set_tcp_no_delay(on) {
                warn!("set_tcp_no_delay: {}", err);
            }
        });
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.with_core(move |core| {
            if let Err(err) = core.socket.set_keep_alive(on) {
                warn!("set_keep_alive: {}", err);
            }
        });
    }

    /// Posts `connect_destroyed` onto the owning loop; the final step of
    /// the two-hop removal dance.
    pub(crate) fn queue_destroy(&self) {
        let conn = self.clone();
        self.shared.event_loop.queue_in_loop(move || {
            if let Some(core) = conn.core() {
                core.connect_destroyed();
            }
        });
    }

    fn with_core(&self, f: impl FnOnce(&Rc<ConnCore>) + Send + 'static) {
        let conn = self.clone();
        self.shared.event_loop.run_in_loop(move || {
            if let Some(core) = conn.core() {
                f(&core);
            }
        });
    }

    /// Looks up the loop-confined core; loop thread only. `None` once the
    /// connection has been destroyed.
    fn core(&self) -> Option<Rc<ConnCore>> {
        let token = *self.shared.core.get()?;
        let event_loop = LoopInner::current()?;
        event_loop.slot(token)?.downcast::<ConnCore>().ok()
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnCore {
    /// The owning loop. The registry entry and every dispatch reference
    /// live inside the loop, so an upgrade cannot fail while the core is
    /// reachable.
    fn owner_loop(&self) -> Rc<LoopInner> {
        self.event_loop.upgrade().expect("loop outlives its connections")
    }

    /// Builds the loop-confined core around a freshly connected descriptor,
    /// wires its channel and fires the connected callback. Runs on the
    /// owning loop.
    pub(crate) fn establish(
        event_loop: &Rc<LoopInner>,
        fd: OwnedFd,
        shared: Arc<ConnShared>,
        callbacks: ConnectionCallbacks,
    ) {
        event_loop.assert_in_loop_thread();
        let socket = Socket::from_owned(fd);
        let channel = Channel::new(Rc::downgrade(event_loop), socket.as_raw_fd());
        let core = Rc::new(ConnCore {
            event_loop: Rc::downgrade(event_loop),
            shared: shared.clone(),
            socket,
            channel,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            callbacks,
        });

        let token = event_loop.register_slot(core.clone());
        assert!(shared.core.set(token).is_ok());

        let weak = Rc::downgrade(&core);
        core.channel.set_read_callback(move |receive_time| {
            if let Some(core) = weak.upgrade() {
                core.handle_read(receive_time);
            }
        });
        let weak = Rc::downgrade(&core);
        core.channel.set_write_callback(move || {
            if let Some(core) = weak.upgrade() {
                core.handle_write();
            }
        });
        let weak = Rc::downgrade(&core);
        core.channel.set_close_callback(move || {
            if let Some(core) = weak.upgrade() {
                core.handle_close();
            }
        });
        let weak = Rc::downgrade(&core);
        core.channel.set_error_callback(move || {
            if let Some(core) = weak.upgrade() {
                core.handle_error();
            }
        });

        core.connect_established();
    }

    fn connection(&self) -> TcpConnection {
        TcpConnection {
            shared: self.shared.clone(),
        }
    }

    fn connect_established(&self) {
        self.owner_loop().assert_in_loop_thread();
        assert_eq!(self.shared.state(), ConnectionState::Connecting);
        self.shared.set_state(ConnectionState::Connected);
        self.channel.enable_reading();
        (self.callbacks.connection)(&self.connection());
    }

    /// The final point that may touch the channel; afterwards the core is
    /// unregistered and dropped once in-flight dispatch lets go.
    fn connect_destroyed(&self) {
        self.owner_loop().assert_in_loop_thread();
        let state = self.shared.state();
        trace!("TcpConnection::connect_destroyed [{}] state = {:?}", self.shared.name, state);
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            // Destroyed without going through the close path (owner torn
            // down while the connection was still up).
            self.shared.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            (self.callbacks.connection)(&self.connection());
        }
        self.channel.remove();
        if let Some(&token) = self.shared.core.get() {
            self.owner_loop().take_slot(token);
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.owner_loop().assert_in_loop_thread();
        let result = self.input.borrow_mut().read_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let conn = self.connection();
                let mut input = self.input.borrow_mut();
                (self.callbacks.message)(&conn, &mut input, receive_time);
            }
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.shared.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.owner_loop().assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(
                "TcpConnection::handle_write [{}] is down, no more writing",
                self.shared.name
            );
            return;
        }
        let mut output = self.output.borrow_mut();
        match net::write(self.channel.fd(), output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = &self.callbacks.write_complete {
                        let cb = cb.clone();
                        let conn = self.connection();
                        self.owner_loop()
                            .queue_in_loop_local(Box::new(move || cb(&conn)));
                    }
                    if self.shared.state() == ConnectionState::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TcpConnection::handle_write [{}]: {}", self.shared.name, err),
        }
    }

    /// EOF from the peer, a fatal error, or a force close.
    fn handle_close(&self) {
        self.owner_loop().assert_in_loop_thread();
        let state = self.shared.state();
        trace!("TcpConnection::handle_close [{}] state = {:?}", self.shared.name, state);
        assert!(
            state == ConnectionState::Connected || state == ConnectionState::Disconnecting
        );
        self.shared.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let conn = self.connection();
        (self.callbacks.connection)(&conn);
        if let Some(cb) = &self.callbacks.close {
            cb(&conn);
        }
    }

    /// Harvests and logs `SO_ERROR`; the following read observes the EOF or
    /// error and takes the close path.
    fn handle_error(&self) {
        let err = net::socket_error(self.channel.fd());
        error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {}",
            self.shared.name,
            io::Error::from_raw_os_error(err)
        );
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.owner_loop().assert_in_loop_thread();
        if self.shared.state() == ConnectionState::Disconnected {
            warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.shared.name);
            return;
        }

        let mut wrote = 0;
        let mut fault = false;
        // Nothing queued: try the direct write first.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match net::write(self.channel.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        if let Some(cb) = &self.callbacks.write_complete {
                            let cb = cb.clone();
                            let conn = self.connection();
                            self.owner_loop()
                                .queue_in_loop_local(Box::new(move || cb(&conn)));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.shared.name, err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let mut output = self.output.borrow_mut();
            let old_len = output.readable_bytes();
            let mark = self.shared.high_water_mark.load(Ordering::Relaxed);
            if mark > 0 && old_len < mark && old_len + remaining >= mark {
                if let Some(cb) = &self.callbacks.high_water_mark {
                    let cb = cb.clone();
                    let conn = self.connection();
                    let size = old_len + remaining;
                    self.owner_loop()
                        .queue_in_loop_local(Box::new(move || cb(&conn, size)));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Issues the FIN now if the output buffer is empty, otherwise leaves
    /// it to the write path once the buffer drains.
    fn shutdown_in_loop(&self) {
        self.owner_loop().assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown_in_loop [{}]: {}", self.shared.name, err);
            }
        }
    }
}

/// Logs the up/down transition; installed when the user does not care.
pub(crate) fn default_connection_callback(conn: &TcpConnection) {
    debug!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "up" } else { "down" }
    );
}

/// Discards whatever arrived; installed when the user does not care.
pub(crate) fn default_message_callback(_conn: &TcpConnection, buffer: &mut Buffer, _when: Instant) {
    buffer.retrieve_all();
}
