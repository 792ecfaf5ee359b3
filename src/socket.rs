use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::net;

/// An owned stream socket descriptor; closed on drop.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec TCP socket for `addr`'s family.
    pub(crate) fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        net::new_stream_socket(net::family(addr)).map(Socket::from_owned)
    }

    pub(crate) fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = net::socket_addr(addr);
        syscall!(bind(
            self.fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))
        .map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), 1024)).map(|_| ())
    }

    /// Accepts the next pending connection; the returned descriptor is
    /// non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` ensures the fd is valid.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let addr = net::from_socket_addr(&storage)?;
        Ok((fd, addr))
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        net::shutdown_write(self.fd.as_raw_fd())
    }

    pub(crate) fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    fn set_option(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
