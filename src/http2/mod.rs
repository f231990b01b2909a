//! HTTP/2 connection (§4.9), grounded on the module shape of `h2`
//! (`client.rs`/`server.rs` splitting connection-drive, stream and codec
//! concerns) but expressed as a synchronous, callback-driven state machine
//! over this crate's own socket layer instead of `h2`'s future-based poll
//! model — the same adaptation this crate already makes for TCP/TLS.

pub mod connection;
pub mod frame;
pub mod hpack;
pub mod settings;
pub mod stream;

pub use connection::{Connection, ConnectionHandler, Mode};
pub use frame::{Frame, FrameHeader, FrameType};
pub use settings::Settings;
pub use stream::{StreamState, H2Headers};
