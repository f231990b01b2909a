//! Notifier/waker: an eventfd on Linux, a self-pipe elsewhere on unix (§4.1,
//! §9 "Wake mechanism"). Registered for READ with the selector so the next
//! `step` unblocks as soon as one byte is written to it.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;

    #[derive(Debug)]
    pub struct WakerInner {
        fd: File,
    }

    impl WakerInner {
        pub fn new() -> io::Result<WakerInner> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(WakerInner { fd: unsafe { File::from_raw_fd(fd) } })
        }

        pub fn wake(&self) -> io::Result<()> {
            match (&self.fd).write(&1u64.to_ne_bytes()) {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.drain();
                    self.wake()
                }
                Err(e) => Err(e),
            }
        }

        pub fn drain(&self) {
            let mut buf = [0u8; 8];
            let _ = (&self.fd).read(&mut buf);
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::*;
    use std::io::{Read, Write};

    /// Self-pipe: write end wakes the poller, read end drains the byte.
    #[derive(Debug)]
    pub struct WakerInner {
        reader: std::fs::File,
        writer: std::fs::File,
    }

    impl WakerInner {
        pub fn new() -> io::Result<WakerInner> {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
            use std::os::fd::FromRawFd;
            Ok(WakerInner {
                reader: unsafe { std::fs::File::from_raw_fd(fds[0]) },
                writer: unsafe { std::fs::File::from_raw_fd(fds[1]) },
            })
        }

        pub fn wake(&self) -> io::Result<()> {
            match (&self.writer).write(&[1]) {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e),
            }
        }

        pub fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                match (&self.reader).read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) if n < buf.len() => break,
                    Ok(_) => continue,
                }
            }
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.reader.as_raw_fd()
        }
    }
}

/// Cross-platform wake handle: every loop owns exactly one, registered for
/// READ. Writing to it unblocks the next poller `wait`.
#[derive(Debug)]
pub struct Waker {
    inner: imp::WakerInner,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker { inner: imp::WakerInner::new()? })
    }

    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    pub fn drain(&self) {
        self.inner.drain()
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
