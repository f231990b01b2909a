//! vortexio is a cross-platform, single-threaded-by-default event loop and
//! protocol stack: a readiness/completion-unifying poller and hierarchical
//! timer wheel at the bottom, TCP/UDP/TLS endpoints above it, and an
//! optional proxy/HTTP-1/HTTP-2/WebSocket protocol layer above that.
//!
//! Every layer is reachable through its own module and gated behind the
//! feature that names it — see below for what each one turns on. None of
//! them start a background thread on your behalf beyond what you ask for
//! ([`EventLoop::run`](event_loop::EventLoop::run) drives everything from
//! whichever thread calls it; [`resolver`] and the proxy/TLS adapters spin
//! up their own small worker pools only when actually used).
//!
//! # Features
//!
//! - `os-poll` — the event loop, poller backends and timer wheel.
//! - `net` — [`net`]: TCP/UDP sockets and acceptors.
//! - `tls` — [`tls`]: the `native-tls`-backed TLS adapter.
//! - `http1` — [`http1`]: the HTTP/1.x parser and message framer.
//! - `proxy` — [`proxy`]: the `CONNECT` tunnel adapter and its
//!   authenticators.
//! - `http2` — [`http2`]: the HTTP/2 connection, HPACK and flow control.
//! - `websocket` — [`ws`]: the WebSocket framer, handshake and connection.
//! - `permessage-deflate` — the `permessage-deflate` WebSocket extension.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;

#[cfg(feature = "os-poll")]
pub mod event;
#[cfg(feature = "os-poll")]
pub mod event_loop;
#[cfg(feature = "os-poll")]
pub mod interest;
#[cfg(feature = "os-poll")]
pub mod poller;
#[cfg(feature = "os-poll")]
pub mod timer;
#[cfg(feature = "os-poll")]
pub mod token;

#[cfg(feature = "os-poll")]
mod sys;

#[cfg(feature = "net")]
pub mod buffer;
#[cfg(feature = "net")]
pub mod net;
#[cfg(feature = "net")]
pub mod resolver;

#[cfg(feature = "tls")]
pub mod tls;

#[cfg(feature = "http1")]
pub mod http1;

#[cfg(feature = "proxy")]
pub mod proxy;

#[cfg(feature = "http2")]
pub mod http2;

#[cfg(feature = "websocket")]
pub mod ws;

pub use error::{Error, Result};

#[cfg(feature = "os-poll")]
pub use event_loop::{EventLoop, LoopHandle, LoopState};
