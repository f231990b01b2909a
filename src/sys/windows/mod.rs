//! Completion backend (I/O Completion Ports), grounded on mio's
//! `sys/windows/overlapped.rs`: each outstanding operation owns a boxed
//! `Overlapped` whose first field is a real `OVERLAPPED` so the completion
//! port can hand the pointer straight back to us, and whose trailing fields
//! carry the [`Token`]/[`Op`] needed to build the `Event` per §4.2.
//!
//! `AcceptEx`/`ConnectEx` are not part of the stable winsock surface; they
//! are resolved once per socket via `WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER)`,
//! the documented way to obtain them.

pub mod net;

use crate::event::{Event, Events};
use crate::interest::Interest;
use crate::poller::{Op, Poller, RawFdLike};
use crate::token::Token;
use std::io;
use std::mem::zeroed;
use std::os::windows::io::RawSocket;
use std::ptr;
use std::time::Duration;
use windows_sys::Win32::Networking::WinSock::*;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus, OVERLAPPED,
    OVERLAPPED_ENTRY,
};

/// Boxed and leaked for the duration of one outstanding operation; recovered
/// from the completion-port entry's `lpOverlapped` pointer.
#[repr(C)]
pub(crate) struct Overlapped {
    raw: OVERLAPPED,
    pub token: Token,
    pub op: Op,
    /// Set by `net::submit`'s `Accept` arm to the freshly created accepted
    /// socket; `-1` for every other op. `Event::completion`'s `result` field
    /// surfaces this instead of a byte count for `Op::Accept` (§4.2).
    pub accepted_fd: i64,
}

impl Overlapped {
    fn new(token: Token, op: Op) -> Box<Overlapped> {
        Box::new(Overlapped { raw: unsafe { zeroed() }, token, op, accepted_fd: -1 })
    }

    fn as_ptr(self: &mut Box<Overlapped>) -> *mut OVERLAPPED {
        &mut self.raw as *mut OVERLAPPED
    }
}

pub struct CompletionPoller {
    port: windows_sys::Win32::Foundation::HANDLE,
}

unsafe impl Send for CompletionPoller {}
unsafe impl Sync for CompletionPoller {}

impl CompletionPoller {
    pub fn new() -> io::Result<CompletionPoller> {
        let port = unsafe { CreateIoCompletionPort(windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionPoller { port })
    }

    pub fn raw_port(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.port
    }
}

impl Poller for CompletionPoller {
    fn register(&self, fd: RawFdLike, token: Token, _interests: Interest) -> io::Result<()> {
        let handle = fd.0 as windows_sys::Win32::Foundation::HANDLE;
        let res = unsafe { CreateIoCompletionPort(handle, self.port, token.0, 0) };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn reregister(&self, _fd: RawFdLike, _token: Token, _interests: Interest) -> io::Result<()> {
        // A completion handle's association cannot be changed once made; the
        // "interest" a completion backend expresses is entirely carried by
        // which `Op` gets submitted next (§4.2).
        Ok(())
    }

    fn unregister(&self, _fd: RawFdLike) -> io::Result<()> {
        // Completion association is torn down implicitly when the handle is
        // closed; there is no equivalent of `epoll_ctl(DEL)`.
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let mut entries: Vec<OVERLAPPED_ENTRY> = Vec::with_capacity(events.capacity().max(64));
        let cap = entries.capacity() as u32;
        let mut removed: u32 = 0;
        let timeout_ms = timeout.map(|d| d.as_millis().min(u32::MAX as u128) as u32).unwrap_or(u32::MAX);

        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                cap,
                &mut removed,
                timeout_ms,
                0,
            )
        };
        events.clear();
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(windows_sys::Win32::Foundation::WAIT_TIMEOUT as i32) {
                return Ok(());
            }
            return Err(err);
        }
        unsafe { entries.set_len(removed as usize) };

        for entry in &entries {
            if entry.lpOverlapped.is_null() {
                // A `wake()` posting carries no overlapped pointer.
                continue;
            }
            let overlapped = unsafe { &*(entry.lpOverlapped as *const Overlapped) };
            let result = if entry.Internal != 0 {
                -1
            } else if overlapped.op == Op::Accept {
                overlapped.accepted_fd as isize
            } else {
                entry.dwNumberOfBytesTransferred as isize
            };
            events.push(Event::completion(overlapped.token, overlapped.op as u8, result));
            // SAFETY: the box was leaked by `submit_op` on the assumption the
            // completion port would hand the pointer back exactly once.
            drop(unsafe { Box::from_raw(entry.lpOverlapped as *mut Overlapped) });
        }
        Ok(())
    }

    fn submit_op(&self, fd: RawFdLike, op: Op, token: Token) -> io::Result<()> {
        net::submit(fd.0 as RawSocket, op, token)
    }

    fn wake(&self) -> io::Result<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, 0, ptr::null_mut()) };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn is_level_triggered(&self) -> bool {
        false
    }

    fn is_completion_based(&self) -> bool {
        true
    }
}
