//! epoll(7) readiness backend.
//!
//! Mirrors the registration/`epoll_wait` pattern mio uses for its own epoll
//! selector, but reports whatever [`Interest`] the caller asked for rather
//! than unconditionally requesting edge-triggered I/O — §4.2 makes
//! level-vs-edge a backend *property* the endpoint queries, and epoll here
//! is level-triggered so `is_level_triggered()` returns `true`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Selector { ep: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interests_to_epoll(interests), u64: token.0 as u64 };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interests_to_epoll(interests), u64: token.0 as u64 };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        })
        .map(|_| ())
    }

    pub fn select(&self, events: &mut Vec<libc::epoll_event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| to.checked_add(Duration::from_nanos(999_999)).unwrap_or(to).as_millis() as libc::c_int)
            .unwrap_or(-1);

        events.clear();
        let n = loop {
            match cvt(unsafe {
                libc::epoll_wait(self.ep.as_raw_fd(), events.as_mut_ptr(), events.capacity() as i32, timeout_ms)
            }) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        unsafe { events.set_len(n as usize) };
        Ok(())
    }

    /// epoll is level-triggered here (no `EPOLLET`): §4.2 leaves trigger mode
    /// a backend property so endpoints can decide how to manage interest.
    pub const fn is_level_triggered(&self) -> bool {
        true
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;
    if interests.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interests.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

pub fn token(event: &libc::epoll_event) -> Token {
    Token(event.u64 as usize)
}

pub fn is_readable(event: &libc::epoll_event) -> bool {
    (event.events as libc::c_int) & (libc::EPOLLIN | libc::EPOLLPRI) != 0
}

pub fn is_writable(event: &libc::epoll_event) -> bool {
    (event.events as libc::c_int) & libc::EPOLLOUT != 0
}

pub fn is_error(event: &libc::epoll_event) -> bool {
    (event.events as libc::c_int) & libc::EPOLLERR != 0
}

pub fn is_hup(event: &libc::epoll_event) -> bool {
    (event.events as libc::c_int) & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0
}
