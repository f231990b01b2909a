#[cfg(unix)]
pub mod unix;
#[cfg(unix)]
pub use unix as imp;

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use windows as imp;

use crate::poller::Poller;
use std::io;
use std::sync::Arc;

/// Construct the platform's default poller backend: a readiness backend
/// (epoll/kqueue) on unix, a completion backend (IOCP) on Windows.
///
/// This is the one place a caller picks a backend implicitly; `EventLoop`
/// accepts an explicit `Arc<dyn Poller>` too, for embedders who want a loop
/// pool pinned to a specific backend (§9 "Single-thread vs multi-thread
/// dispatch").
pub fn default_poller() -> io::Result<Arc<dyn Poller>> {
    #[cfg(unix)]
    {
        Ok(Arc::new(unix::ReadinessPoller::new()?))
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(windows::CompletionPoller::new()?))
    }
    #[cfg(not(any(unix, windows)))]
    {
        compile_error!("vortexio requires unix or windows");
    }
}
