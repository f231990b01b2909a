#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::Selector;

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios",
))]
mod kqueue;
#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios",
))]
pub use kqueue::Selector;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::{is_error, is_hup, is_readable, is_writable, token};
#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios",
))]
pub use kqueue::{is_error, is_hup, is_readable, is_writable, token};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub type SysEvent = libc::epoll_event;
#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios",
))]
pub type SysEvent = libc::kevent;
