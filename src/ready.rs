use std::fmt;
use std::ops;

/// The set of events a poller backend reported for one channel.
///
/// Both backends decode their native bits into this set so the channel's
/// dispatch logic is written once.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct Ready(u8);

const READABLE: u8 = 0b00_0001;
const WRITABLE: u8 = 0b00_0010;
const ERROR: u8 = 0b00_0100;
const HUP: u8 = 0b00_1000;
const PRIORITY: u8 = 0b01_0000;
const INVALID: u8 = 0b10_0000;

impl Ready {
    pub(crate) const EMPTY: Ready = Ready(0);

    pub(crate) fn from_poll(revents: libc::c_short) -> Ready {
        let mut ready = Ready(0);
        if revents & libc::POLLIN != 0 {
            ready.0 |= READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            ready.0 |= WRITABLE;
        }
        if revents & libc::POLLERR != 0 {
            ready.0 |= ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            ready.0 |= HUP;
        }
        if revents & libc::POLLPRI != 0 {
            ready.0 |= PRIORITY;
        }
        if revents & libc::POLLNVAL != 0 {
            ready.0 |= INVALID;
        }
        ready
    }

    pub(crate) fn from_epoll(events: u32) -> Ready {
        let events = events as libc::c_int;
        let mut ready = Ready(0);
        if events & libc::EPOLLIN != 0 {
            ready.0 |= READABLE;
        }
        if events & libc::EPOLLOUT != 0 {
            ready.0 |= WRITABLE;
        }
        if events & libc::EPOLLERR != 0 {
            ready.0 |= ERROR;
        }
        if events & libc::EPOLLHUP != 0 {
            ready.0 |= HUP;
        }
        if events & libc::EPOLLPRI != 0 {
            ready.0 |= PRIORITY;
        }
        ready
    }

    pub(crate) fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub(crate) fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub(crate) fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub(crate) fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    pub(crate) fn is_priority(self) -> bool {
        self.0 & PRIORITY != 0
    }

    pub(crate) fn is_invalid(self) -> bool {
        self.0 & INVALID != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (READABLE, "READABLE"),
            (WRITABLE, "WRITABLE"),
            (ERROR, "ERROR"),
            (HUP, "HUP"),
            (PRIORITY, "PRIORITY"),
            (INVALID, "INVALID"),
        ];
        for (flag, name) in flags {
            if self.0 & flag != 0 {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn poll_bits_decode() {
        let ready = Ready::from_poll(libc::POLLIN | libc::POLLOUT | libc::POLLHUP);
        assert!(ready.is_readable());
        assert!(ready.is_writable());
        assert!(ready.is_hup());
        assert!(!ready.is_error());
        assert!(!ready.is_invalid());
    }

    #[test]
    fn epoll_bits_decode() {
        let ready = Ready::from_epoll((libc::EPOLLIN | libc::EPOLLERR) as u32);
        assert!(ready.is_readable());
        assert!(ready.is_error());
        assert!(!ready.is_writable());
    }
}
