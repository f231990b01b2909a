//! Socket endpoints (§3 "TCP Socket", "TCP Acceptor", "UDP Socket").
//!
//! Both endpoint types are driven from an [`crate::event_loop::LoopHandle`]
//! and work the same way on a readiness backend (register for
//! READABLE/WRITABLE, re-check on every wakeup) or a completion backend
//! (issue one `Op` at a time via `submit_op`, let the next event carry the
//! result) — `LoopHandle::is_completion_based` picks the strategy once at
//! construction time so the hot path never branches on it again.

#[cfg(unix)]
pub(crate) use crate::sys::unix::net as sysnet;
#[cfg(windows)]
pub(crate) use crate::sys::windows::net as sysnet;

mod tcp;
mod udp;

pub use tcp::{TcpAcceptor, TcpConfig, TcpHandler, TcpSocket, TcpState};
pub use udp::{UdpConfig, UdpHandler, UdpSocket};
