use crate::token::Token;
use std::fmt;
use std::time::Duration;

/// The completion-specific payload of an [`Event`], populated only when the
/// backing poller is a completion backend (§4.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The completed operation, encoded the way the backend encoded it into
    /// the `events` field of the shared `IOCallback` signature.
    pub op: u8,
    /// Bytes transferred for READV/WRITEV/SENDMSG/RECVMSG, the accepted fd
    /// for ACCEPT, or a negative `errno` on failure.
    pub result: isize,
}

/// A readiness or completion event, paired with the [`Token`] supplied at
/// registration.
///
/// Readiness backends populate `readable`/`writable`/`error`/`hup` and leave
/// `completion` `None`. Completion backends populate `completion` and encode
/// the finished operation as the event mask per §4.2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    hup: bool,
    completion: Option<Completion>,
}

impl Event {
    pub(crate) fn new(token: Token, readable: bool, writable: bool, error: bool, hup: bool) -> Event {
        Event { token, readable, writable, error, hup, completion: None }
    }

    pub(crate) fn completion(token: Token, op: u8, result: isize) -> Event {
        Event {
            token,
            readable: false,
            writable: false,
            error: result < 0,
            hup: false,
            completion: Some(Completion { op, result }),
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.error
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.hup
    }

    /// `Some` only on completion backends: the finished operation and its
    /// result, per §4.2.
    #[inline]
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }
}

/// A buffer of events filled in by [`Poller::wait`].
///
/// [`Poller::wait`]: crate::poller::Poller::wait
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events { inner: Vec::with_capacity(capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    pub(crate) fn inner_mut(&mut self) -> &mut Vec<Event> {
        &mut self.inner
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

/// Clamp a caller-requested wait against the timer manager's next deadline,
/// per §4.1 step 2. `None` means "no caller limit".
pub(crate) fn clamp_wait(caller: Option<Duration>, timer_deadline: Option<Duration>) -> Duration {
    const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(256);
    match (caller, timer_deadline) {
        (Some(c), Some(t)) => c.min(t),
        (Some(c), None) => c,
        (None, Some(t)) => t,
        (None, None) => DEFAULT_MAX_WAIT,
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ token: {:?}, readable: {}, writable: {}, error: {}, hup: {} }}",
            self.token, self.readable, self.writable, self.error, self.hup
        )
    }
}
