//! kqueue(2) readiness backend (BSD/macOS).

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
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
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = cvt(unsafe { libc::kqueue() })?;
        cvt(unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        Ok(Selector { kq })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.apply(fd, token, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        // Clear any previously registered filter for the opposite direction
        // so level-vs-edge bookkeeping in the caller stays accurate.
        let _ = self.apply(fd, token, Interest::READABLE, libc::EV_DELETE);
        let _ = self.apply(fd, token, Interest::WRITABLE, libc::EV_DELETE);
        self.apply(fd, token, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let _ = self.apply(fd, Token(0), Interest::READABLE, libc::EV_DELETE);
        let _ = self.apply(fd, Token(0), Interest::WRITABLE, libc::EV_DELETE);
        Ok(())
    }

    fn apply(&self, fd: RawFd, token: Token, interests: Interest, flags: u16) -> io::Result<()> {
        let mut changes: [MaybeUninit<libc::kevent>; 2] = [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n = 0;
        if interests.is_readable() {
            changes[n] = MaybeUninit::new(libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: libc::EVFILT_READ,
                flags,
                fflags: 0,
                data: 0,
                udata: token.0 as *mut libc::c_void,
            });
            n += 1;
        }
        if interests.is_writable() {
            changes[n] = MaybeUninit::new(libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: libc::EVFILT_WRITE,
                flags,
                fflags: 0,
                data: 0,
                udata: token.0 as *mut libc::c_void,
            });
            n += 1;
        }
        if n == 0 {
            return Ok(());
        }
        cvt(unsafe {
            libc::kevent(self.kq, changes[0].as_ptr(), n as libc::c_int, std::ptr::null_mut(), 0, std::ptr::null())
        })
        .map(|_| ())
    }

    pub fn select(&self, events: &mut Vec<libc::kevent>, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: to.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|s| s as *const _).unwrap_or(std::ptr::null());

        events.clear();
        let n = loop {
            match cvt(unsafe {
                libc::kevent(self.kq, std::ptr::null(), 0, events.as_mut_ptr(), events.capacity() as libc::c_int, ts_ptr)
            }) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        unsafe { events.set_len(n as usize) };
        Ok(())
    }

    /// kqueue is registered `EV_CLEAR` (edge-triggered) here.
    pub const fn is_level_triggered(&self) -> bool {
        false
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

pub fn token(event: &libc::kevent) -> Token {
    Token(event.udata as usize)
}

pub fn is_readable(event: &libc::kevent) -> bool {
    event.filter == libc::EVFILT_READ
}

pub fn is_writable(event: &libc::kevent) -> bool {
    event.filter == libc::EVFILT_WRITE
}

pub fn is_error(event: &libc::kevent) -> bool {
    event.flags & libc::EV_ERROR != 0
}

pub fn is_hup(event: &libc::kevent) -> bool {
    event.flags & libc::EV_EOF != 0
}
