use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::socket::Socket;

/// Owns a listening socket and hands freshly accepted descriptors to its
/// new-connection callback.
///
/// Lives entirely on its loop. The spare descriptor is the standard
/// mitigation for fd exhaustion: when `accept` fails with EMFILE the spare
/// is closed to free a slot, the pending connection is accepted and
/// immediately closed (so the peer sees a reset instead of a hung socket),
/// and the spare is reopened.
pub(crate) struct Acceptor {
    event_loop: Rc<LoopInner>,
    socket: Socket,
    channel: Rc<Channel>,
    idle_fd: RefCell<Option<OwnedFd>>,
    listening: Cell<bool>,
    new_connection_callback: RefCell<Option<Box<dyn Fn(OwnedFd, SocketAddr)>>>,
}

impl Acceptor {
    pub(crate) fn new(event_loop: Rc<LoopInner>, addr: &SocketAddr) -> io::Result<Rc<Acceptor>> {
        let socket = Socket::new_stream(addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(addr)?;
        let channel = Channel::new(Rc::downgrade(&event_loop), socket.as_raw_fd());
        let acceptor = Rc::new(Acceptor {
            event_loop,
            socket,
            channel,
            idle_fd: RefCell::new(open_idle_fd()),
            listening: Cell::new(false),
            new_connection_callback: RefCell::new(None),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(
        &self,
        callback: impl Fn(OwnedFd, SocketAddr) + 'static,
    ) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        crate::sys::net::local_addr(self.socket.as_raw_fd())
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.listening.set(true);
        self.socket.listen()?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((fd, peer_addr)) => match &*self.new_connection_callback.borrow() {
                Some(callback) => callback(fd, peer_addr),
                None => drop(fd),
            },
            Err(err) => match err.raw_os_error() {
                Some(libc::EMFILE) => {
                    error!("Acceptor::handle_read: out of file descriptors");
                    self.drain_with_idle_fd();
                }
                Some(
                    libc::EAGAIN | libc::ECONNABORTED | libc::EINTR | libc::EPROTO | libc::EPERM,
                ) => {
                    warn!("Acceptor::handle_read: transient accept error: {}", err);
                }
                _ => panic!("Acceptor::handle_read: accept: {}", err),
            },
        }
    }

    /// Frees the spare descriptor, accepts-and-drops the pending connection
    /// and reopens the spare.
    fn drain_with_idle_fd(&self) {
        let mut idle_fd = self.idle_fd.borrow_mut();
        if idle_fd.take().is_none() {
            return;
        }
        if let Ok((fd, _)) = self.socket.accept() {
            drop(fd);
        }
        *idle_fd = open_idle_fd();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening.get() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}

fn open_idle_fd() -> Option<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))
    .ok()?;
    // SAFETY: `open(2)` ensures the fd is valid.
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}
