use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// The loop's wakeup source: an `eventfd` counter surfaced as a readable
/// descriptor.
///
/// Foreign threads bump the counter to knock the poller out of its kernel
/// wait; the owning loop zeroes it again when the readiness event is
/// dispatched. The kernel only moves fixed 8-byte values through an
/// eventfd, in either direction.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds one to the counter.
    ///
    /// The write only blocks when the counter is about to overflow, i.e.
    /// nothing has drained it for 2^64 - 1 wakes; zero the counter and try
    /// once more. A second failure is a real error.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let value = 1u64.to_ne_bytes();
        match self.add(&value) {
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.drain()?;
                self.add(&value)
            }
            res => res,
        }
    }

    /// Zeroes the counter after a readiness event. An already-zero counter
    /// reads as would-block, which just means there is nothing to drain.
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut value = [0u8; 8];
        let res = syscall!(read(
            self.fd.as_raw_fd(),
            value.as_mut_ptr() as *mut libc::c_void,
            value.len()
        ));
        match res {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn add(&self, value: &[u8; 8]) -> io::Result<()> {
        syscall!(write(
            self.fd.as_raw_fd(),
            value.as_ptr() as *const libc::c_void,
            value.len()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
