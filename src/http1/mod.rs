//! HTTP/1.x parser and message framer (§3 "HTTP/1 Parser and Message"),
//! grounded on the incremental state-machine shape of `rouille`'s
//! `Http1Handler` (`WaitingForRqLine`/`WaitingForHeaders`/body states driven
//! by repeatedly feeding more bytes into a pending buffer) — reworked here
//! around this crate's own [`crate::buffer::Chain`] instead of a raw
//! `Vec<u8>` shuffled in place, and extended with chunked transfer-encoding
//! and upgrade/tail-byte handoff that the grounding file marks `TODO`.

pub mod framer;
pub mod message;
pub mod parser;

pub use framer::OutgoingMessage;
pub use message::{Header, Method, StartLine, Version};
pub use parser::{ParseEvent, Parser, ParserConfig};
