use std::io;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The exhaustive error set returned by every public operation.
///
/// This mirrors the typed error table of the layer being wrapped rather than
/// leaking platform `errno` values: callers match on variants, not strings.
/// `AGAIN`/`EWOULDBLOCK` is deliberately absent here — partial I/O is
/// represented in return values, never as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unclassified failure: {0}")]
    Failed(String),

    #[error("non-recoverable error: {0}")]
    Fatal(String),

    #[error("operation rejected by caller policy")]
    Rejected,

    #[error("peer closed or local close in progress")]
    Closed,

    #[error("deadline elapsed")]
    Timeout,

    #[error("operation not valid in current state")]
    InvalidState,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid protocol data: {0}")]
    InvalidProto(String),

    #[error("already exists")]
    AlreadyExist,

    #[error("does not exist")]
    NotExist,

    #[error("socket error: {0}")]
    SockError(#[from] io::Error),

    #[error("poller error: {0}")]
    PollError(String),

    #[error("protocol error: {0}")]
    ProtoError(String),

    #[error("TLS error: {0}")]
    SslError(String),

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("buffer too long")]
    BufferTooLong,

    #[error("not supported")]
    NotSupported,

    #[error("not implemented")]
    NotImplemented,

    #[error("not authorized")]
    NotAuthorized,

    #[error("object destroyed during a re-entrant call")]
    Destroyed,
}

impl Error {
    /// True for errors that should tear the endpoint down immediately, as
    /// opposed to protocol-level errors that a layer may recover from.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, Error::SockError(_) | Error::PollError(_) | Error::Fatal(_))
    }
}
