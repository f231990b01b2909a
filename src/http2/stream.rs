//! Per-stream state machine (§4.9, RFC 7540 §5.1) and flow-control window.

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// A decoded HEADERS block, already HPACK-resolved into name/value pairs.
#[derive(Clone, Debug, Default)]
pub struct H2Headers {
    pub pairs: Vec<(String, String)>,
}

impl H2Headers {
    pub fn pseudo(&self, name: &str) -> Option<&str> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub send_window: i64,
    pub recv_window: i64,
    /// Non-control data queued because `send_window` (or the connection's)
    /// was insufficient (§4.9 "blocked_streams").
    pub send_blocked: bool,
}

impl Stream {
    pub fn new(id: u32, initial_window: u32) -> Stream {
        Stream { id, state: StreamState::Idle, send_window: initial_window as i64, recv_window: initial_window as i64, send_blocked: false }
    }

    pub fn is_server_initiated(id: u32) -> bool {
        id % 2 == 0
    }

    /// Local endpoint sends HEADERS: IDLE -> OPEN, or (push) RESERVED_LOCAL
    /// -> HALF_CLOSED_REMOTE.
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        self.state = match self.state {
            StreamState::Idle => {
                if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                }
            }
            StreamState::ReservedLocal => StreamState::HalfClosedRemote,
            other => return Err(invalid_transition(other, "send HEADERS")),
        };
        Ok(())
    }

    pub fn recv_headers(&mut self, end_stream: bool) -> Result<()> {
        self.state = match self.state {
            StreamState::Idle => {
                if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                }
            }
            StreamState::ReservedRemote => StreamState::HalfClosedLocal,
            StreamState::Open if end_stream => StreamState::HalfClosedRemote,
            other @ StreamState::Open => other,
            other => return Err(invalid_transition(other, "recv HEADERS")),
        };
        Ok(())
    }

    pub fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

fn invalid_transition(state: StreamState, action: &str) -> Error {
    Error::ProtoError(format!("cannot {action} in state {state:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_send_headers_moves_idle_to_open() {
        let mut s = Stream::new(1, 65_535);
        s.send_headers(false).unwrap();
        assert_eq!(s.state, StreamState::Open);
    }

    #[test]
    fn end_stream_on_both_sides_closes() {
        let mut s = Stream::new(1, 65_535);
        s.send_headers(false).unwrap();
        s.recv_end_stream();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        s.send_end_stream();
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn reset_drives_immediate_closed() {
        let mut s = Stream::new(1, 65_535);
        s.send_headers(false).unwrap();
        s.reset();
        assert!(s.is_closed());
    }

    #[test]
    fn push_promise_reservation_flow() {
        let mut s = Stream::new(2, 65_535);
        s.state = StreamState::ReservedLocal;
        s.send_headers(false).unwrap();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
    }
}
