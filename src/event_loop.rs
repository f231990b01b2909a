//! The event loop (§3 "Event Loop", §4.1).
//!
//! Owns the poller backend and the timer wheel exclusively; every other
//! endpoint in this crate holds only a [`LoopHandle`] (a weak reference) and
//! routes fd registration and task submission back through it. There is no
//! teacher analogue for this type — `mio::Poll` stops at the poller and
//! leaves the loop to the embedder — so its shape is grounded instead on how
//! the pack's other event-driven services structure a run loop: a single
//! owning thread, a cross-thread-safe task FIFO, and a poller `wait` that
//! also serves as the task-queue's wakeup signal.

use crate::error::{Error, Result};
use crate::event::{clamp_wait, Events};
use crate::interest::Interest;
use crate::poller::{Op, Poller, RawFdLike};
use crate::timer::TimerManager;
use crate::token::Token;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

/// Lifecycle state, per §4.1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Initialized = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            0 => LoopState::Initialized,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// Implemented by endpoints that must be drained before the loop tears down
/// (§4.1 "pending object list"): a socket flushing a final write, a stream
/// finishing a half-close.
pub trait PendingObject: Send + Sync {
    /// Whether this object still has work outstanding.
    fn is_pending(&self) -> bool;
    /// Called once, when the loop is stopping, regardless of `is_pending`.
    fn on_loop_exit(&self);
}

type IoCallback = Box<dyn FnMut(crate::event::Event) + Send>;
type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    poller: Arc<dyn Poller>,
    timers: TimerManager,
    state: AtomicU8,
    owner: Mutex<Option<ThreadId>>,
    callbacks: Mutex<HashMap<Token, IoCallback>>,
    tasks: Mutex<VecDeque<Task>>,
    pending: Mutex<Vec<Weak<dyn PendingObject>>>,
    next_token: AtomicUsize,
}

/// A weak, `Send + Sync` reference to a running loop. Endpoints are built
/// from a handle, never from `&EventLoop` directly, so they cannot outlive
/// the loop silently (`upgrade` fails once it's gone).
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<Shared>,
}

impl LoopHandle {
    fn upgrade(&self) -> Result<Arc<Shared>> {
        self.inner.upgrade().ok_or(Error::Destroyed)
    }

    /// Allocate a fresh token for a new registration. Tokens are never
    /// reused while an endpoint is alive; callers index their own state by
    /// this value.
    pub fn next_token(&self) -> Result<Token> {
        let shared = self.upgrade()?;
        Ok(Token(shared.next_token.fetch_add(1, Ordering::Relaxed)))
    }

    fn check_owner_thread(shared: &Shared) -> Result<()> {
        let owner = shared.owner.lock().unwrap();
        match *owner {
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(Error::InvalidState),
            None => Ok(()),
        }
    }

    /// Register a descriptor for readiness/completion events under `token`,
    /// dispatching to `callback` from the loop thread. Valid only from the
    /// loop's own thread (§4.1).
    pub fn register<F>(&self, fd: RawFdLike, token: Token, interests: Interest, callback: F) -> Result<()>
    where
        F: FnMut(crate::event::Event) + Send + 'static,
    {
        let shared = self.upgrade()?;
        Self::check_owner_thread(&shared)?;
        shared.callbacks.lock().unwrap().insert(token, Box::new(callback));
        shared.poller.register(fd, token, interests).map_err(Error::SockError)
    }

    pub fn reregister(&self, fd: RawFdLike, token: Token, interests: Interest) -> Result<()> {
        let shared = self.upgrade()?;
        Self::check_owner_thread(&shared)?;
        shared.poller.reregister(fd, token, interests).map_err(Error::SockError)
    }

    pub fn unregister(&self, fd: RawFdLike, token: Token) -> Result<()> {
        let shared = self.upgrade()?;
        Self::check_owner_thread(&shared)?;
        shared.callbacks.lock().unwrap().remove(&token);
        shared.poller.unregister(fd).map_err(Error::SockError)
    }

    pub fn submit_op(&self, fd: RawFdLike, op: Op, token: Token) -> Result<()> {
        let shared = self.upgrade()?;
        shared.poller.submit_op(fd, op, token).map_err(Error::SockError)
    }

    /// Whether the backing poller is completion-based (IOCP/io_uring) rather
    /// than readiness-based (epoll/kqueue). Endpoints use this to pick
    /// between the two I/O driving strategies of §4.2.
    pub fn is_completion_based(&self) -> Result<bool> {
        let shared = self.upgrade()?;
        Ok(shared.poller.is_completion_based())
    }

    /// Schedule `callback` relative to the loop's own timer wheel.
    pub fn schedule_timer<F>(
        &self,
        delay_ms: u64,
        mode: crate::timer::TimerMode,
        callback: F,
    ) -> Result<crate::timer::TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = self.upgrade()?;
        shared.timers.schedule(delay_ms, mode, callback)
    }

    /// Enqueue `task` to run on the loop thread at the next task-drain phase
    /// (§4.1 step 4). Safe to call from any thread; never blocks.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.upgrade()?;
        shared.tasks.lock().unwrap().push_back(Box::new(task));
        shared.poller.wake().map_err(Error::SockError)
    }

    /// Run `task` on the loop thread and block the caller for the result.
    ///
    /// Called from the loop thread itself, this runs `task` inline —
    /// re-entrant calls from within a dispatched callback must not deadlock
    /// against their own loop. Called from any other thread, it enqueues and
    /// blocks on a reply channel.
    pub fn call<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let shared = self.upgrade()?;
        let is_owner_thread =
            shared.owner.lock().unwrap().map(|id| id == std::thread::current().id()).unwrap_or(false);
        if is_owner_thread {
            return Ok(task());
        }
        let (tx, rx) = mpsc::channel();
        shared.tasks.lock().unwrap().push_back(Box::new(move || {
            let _ = tx.send(task());
        }));
        shared.poller.wake().map_err(Error::SockError)?;
        rx.recv().map_err(|_| Error::Destroyed)
    }

    /// Register a weak reference so the loop drains it before stopping
    /// (§4.1 "pending object list").
    pub fn track_pending(&self, obj: Weak<dyn PendingObject>) -> Result<()> {
        let shared = self.upgrade()?;
        shared.pending.lock().unwrap().push(obj);
        Ok(())
    }

    pub fn state(&self) -> Result<LoopState> {
        let shared = self.upgrade()?;
        Ok(LoopState::from_u8(shared.state.load(Ordering::Acquire)))
    }

    /// Request the loop stop after the current (or next) step completes.
    pub fn stop(&self) -> Result<()> {
        let shared = self.upgrade()?;
        shared.state.store(LoopState::Stopping as u8, Ordering::Release);
        shared.poller.wake().map_err(Error::SockError)
    }
}

/// A single-threaded reactor: one poller, one timer wheel, one task queue.
/// §4's "loop pool" is just several of these, each pinned to its own OS
/// thread and each handed an independent set of endpoints.
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new(poller: Arc<dyn Poller>) -> EventLoop {
        EventLoop {
            shared: Arc::new(Shared {
                poller,
                timers: TimerManager::new(),
                state: AtomicU8::new(LoopState::Initialized as u8),
                owner: Mutex::new(None),
                callbacks: Mutex::new(HashMap::new()),
                tasks: Mutex::new(VecDeque::new()),
                pending: Mutex::new(Vec::new()),
                next_token: AtomicUsize::new(1),
            }),
        }
    }

    /// Construct a loop backed by the platform's default poller (epoll or
    /// kqueue on unix, IOCP on Windows) — the common case; reach for
    /// [`EventLoop::new`] directly to pin a specific backend, e.g. a loop
    /// pool member that needs to match its siblings.
    pub fn with_default_poller() -> Result<EventLoop> {
        Ok(EventLoop::new(crate::sys::default_poller().map_err(Error::SockError)?))
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { inner: Arc::downgrade(&self.shared) }
    }

    fn bind_owner_thread(&self) {
        let mut owner = self.shared.owner.lock().unwrap();
        if owner.is_none() {
            *owner = Some(std::thread::current().id());
        }
    }

    /// One iteration of the loop per §4.1's six steps:
    /// 1. compute the nearest timer deadline
    /// 2. clamp the caller's `max_wait` against it (and the 256ms default)
    /// 3. block in the poller for that long
    /// 4. dispatch every ready I/O event to its registered callback
    /// 5. fire every timer whose deadline has passed
    /// 6. drain the cross-thread task queue
    pub fn step(&self, max_wait: Option<Duration>, now_ms: u64) -> Result<()> {
        self.bind_owner_thread();
        self.shared.state.compare_exchange(
            LoopState::Initialized as u8,
            LoopState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .ok();

        let timer_deadline = self.shared.timers.next_deadline_ms().map(Duration::from_millis);
        let wait = clamp_wait(max_wait, timer_deadline);

        let mut events = Events::with_capacity(256);
        self.shared.poller.wait(&mut events, Some(wait)).map_err(Error::SockError)?;

        {
            let mut callbacks = self.shared.callbacks.lock().unwrap();
            for event in events.iter() {
                if let Some(cb) = callbacks.get_mut(&event.token()) {
                    cb(*event);
                }
            }
        }

        self.shared.timers.check_expire(now_ms);

        loop {
            let task = self.shared.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }

        Ok(())
    }

    /// Run `step` until [`LoopHandle::stop`] is called, then drain pending
    /// objects and mark the loop `Stopped` (§4.1).
    pub fn run(&self, max_wait: Option<Duration>, mut clock_ms: impl FnMut() -> u64) -> Result<()> {
        loop {
            if self.shared.state.load(Ordering::Acquire) == LoopState::Stopping as u8 {
                break;
            }
            self.step(max_wait, clock_ms())?;
        }

        let pending = self.shared.pending.lock().unwrap();
        for weak in pending.iter() {
            if let Some(obj) = weak.upgrade() {
                obj.on_loop_exit();
            }
        }
        self.shared.state.store(LoopState::Stopped as u8, Ordering::Release);
        Ok(())
    }

    /// True while any tracked [`PendingObject`] still reports work
    /// outstanding; `run` callers may use this to delay a final `stop`.
    pub fn has_pending_objects(&self) -> bool {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.retain(|weak| weak.upgrade().is_some());
        pending.iter().any(|weak| weak.upgrade().map(|o| o.is_pending()).unwrap_or(false))
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;
    use std::sync::Mutex as StdMutex;

    struct NullPoller {
        woken: AU,
    }

    impl Poller for NullPoller {
        fn register(&self, _fd: RawFdLike, _t: Token, _i: Interest) -> std::io::Result<()> {
            Ok(())
        }
        fn reregister(&self, _fd: RawFdLike, _t: Token, _i: Interest) -> std::io::Result<()> {
            Ok(())
        }
        fn unregister(&self, _fd: RawFdLike) -> std::io::Result<()> {
            Ok(())
        }
        fn wait(&self, events: &mut Events, _timeout: Option<Duration>) -> std::io::Result<()> {
            events.clear();
            Ok(())
        }
        fn wake(&self) -> std::io::Result<()> {
            self.woken.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_level_triggered(&self) -> bool {
            true
        }
    }

    #[test]
    fn post_runs_on_next_step() {
        let poller: Arc<dyn Poller> = Arc::new(NullPoller { woken: AU::new(0) });
        let lp = EventLoop::new(poller);
        let handle = lp.handle();
        let ran = Arc::new(StdMutex::new(false));
        let r = ran.clone();
        handle.post(move || {
            *r.lock().unwrap() = true;
        }).unwrap();
        lp.step(Some(Duration::from_millis(0)), 0).unwrap();
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn stop_transitions_state_and_drains_pending() {
        let poller: Arc<dyn Poller> = Arc::new(NullPoller { woken: AU::new(0) });
        let lp = EventLoop::new(poller);
        let handle = lp.handle();

        struct Obj(AU);
        impl PendingObject for Obj {
            fn is_pending(&self) -> bool {
                self.0.load(Ordering::SeqCst) > 0
            }
            fn on_loop_exit(&self) {
                self.0.store(0, Ordering::SeqCst);
            }
        }
        let obj: Arc<dyn PendingObject> = Arc::new(Obj(AU::new(1)));
        handle.track_pending(Arc::downgrade(&obj)).unwrap();
        handle.stop().unwrap();
        lp.run(Some(Duration::from_millis(0)), || 0).unwrap();
        assert_eq!(lp.state(), LoopState::Stopped);
    }

    #[test]
    fn handle_upgrade_fails_after_loop_dropped() {
        let poller: Arc<dyn Poller> = Arc::new(NullPoller { woken: AU::new(0) });
        let handle = {
            let lp = EventLoop::new(poller);
            lp.handle()
        };
        assert!(handle.post(|| {}).is_err());
    }
}
