use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{error, trace};

/// The kernel rejects a zero `it_value` as "disarm"; never arm for less.
const MIN_DELAY: Duration = Duration::from_micros(100);

/// A monotonic kernel timer that surfaces as a readable descriptor.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Re-arms the timer to fire at `when`, expressed on the caller's
    /// monotonic clock. A `when` in the past fires almost immediately.
    pub(crate) fn set_time(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(MIN_DELAY);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        )) {
            error!("timerfd_settime: {}", err);
        }
    }

    /// Drains the expiration counter after a readiness event.
    pub(crate) fn read(&self) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(_) => trace!(
                "timer fd {} fired {} time(s)",
                self.fd.as_raw_fd(),
                u64::from_ne_bytes(buf)
            ),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TimerFd::read: {}", err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
