pub mod net;
mod selector;
mod waker;

pub use waker::Waker;

use crate::event::{Event, Events};
use crate::interest::Interest;
use crate::poller::{Op, Poller, RawFdLike};
use crate::token::Token;
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// The readiness backend (epoll/kqueue) wired up as a [`Poller`].
///
/// The loop's own notifier shares the same fd space: it is registered under
/// a reserved token and its readiness is swallowed before user events are
/// dispatched (§4.1, §9 "Wake mechanism").
pub struct ReadinessPoller {
    selector: selector::Selector,
    waker: Waker,
    waker_token: Token,
}

/// Reserved for the loop's own notifier; never handed out by callers.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

impl ReadinessPoller {
    pub fn new() -> io::Result<ReadinessPoller> {
        let selector = selector::Selector::new()?;
        let waker = Waker::new()?;
        selector.register(waker.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(ReadinessPoller { selector, waker, waker_token: WAKE_TOKEN })
    }
}

impl Poller for ReadinessPoller {
    fn register(&self, fd: RawFdLike, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.register(fd.0, token, interests)
    }

    fn reregister(&self, fd: RawFdLike, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.reregister(fd.0, token, interests)
    }

    fn unregister(&self, fd: RawFdLike) -> io::Result<()> {
        self.selector.deregister(fd.0)
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let mut sys_events: Vec<selector::SysEvent> = Vec::with_capacity(events.capacity().max(64));
        self.selector.select(&mut sys_events, timeout)?;

        events.clear();
        for sys_event in &sys_events {
            let token = selector::token(sys_event);
            if token == self.waker_token {
                self.waker.drain();
                continue;
            }
            events.push(Event::new(
                token,
                selector::is_readable(sys_event),
                selector::is_writable(sys_event),
                selector::is_error(sys_event),
                selector::is_hup(sys_event),
            ));
        }
        Ok(())
    }

    fn submit_op(&self, _fd: RawFdLike, _op: Op, _token: Token) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "readiness backend has no submit_op"))
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    fn is_level_triggered(&self) -> bool {
        self.selector.is_level_triggered()
    }
}
