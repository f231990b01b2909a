//! Incremental request/response parser (§4.8), grounded on the
//! feed-more-bytes-and-re-enter-the-state-machine shape of `rouille`'s
//! `Http1Handler::update` — here reworked as a pull-style parser: the caller
//! feeds bytes via [`Parser::feed`] and drains [`ParseEvent`]s via
//! [`Parser::poll`] rather than a push callback, since this crate's endpoint
//! types already own the dispatch loop.

use crate::buffer::Chain;
use crate::error::{Error, Result};
use crate::http1::message::{self, Header, StartLine, Version};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BodyMode {
    None,
    ContentLength(usize),
    Chunked,
    Eof,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData(usize),
    ChunkTrailer,
    Done,
    Upgraded,
    Error,
}

#[derive(Clone, Debug)]
pub struct ParserConfig {
    pub max_start_line: usize,
    pub max_headers: usize,
    pub max_header_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> ParserConfig {
        ParserConfig { max_start_line: 8 * 1024, max_headers: 128, max_header_bytes: 64 * 1024 }
    }
}

/// One unit of parsed progress handed back to the caller.
#[derive(Debug)]
pub enum ParseEvent {
    /// Start-line and headers are both complete.
    HeaderComplete { start_line: StartLine, headers: Vec<Header> },
    BodyChunk(Vec<u8>),
    /// Message fully parsed (including any chunked trailer).
    MessageComplete,
    /// An `Upgrade` was detected; `tail` is whatever bytes after the blank
    /// line were already buffered and belong to the upgraded protocol.
    Upgrade { token: String, tail: Vec<u8> },
}

/// Whether a response status code permits a body at all (§4.8 body
/// delimitation rule (d)).
fn response_forbids_body(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

pub struct Parser {
    state: State,
    config: ParserConfig,
    buf: Chain,
    is_request: bool,
    paused: bool,
    eof: bool,
    headers: Vec<Header>,
    start_line: Option<StartLine>,
    body_mode: BodyMode,
    body_remaining: usize,
    method_is_head: bool,
}

impl Parser {
    pub fn new_request(config: ParserConfig) -> Parser {
        Parser {
            state: State::StartLine,
            config,
            buf: Chain::new(),
            is_request: true,
            paused: false,
            eof: false,
            headers: Vec::new(),
            start_line: None,
            body_mode: BodyMode::None,
            body_remaining: 0,
            method_is_head: false,
        }
    }

    pub fn new_response(config: ParserConfig) -> Parser {
        let mut p = Parser::new_request(config);
        p.is_request = false;
        p
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Signal peer close. May resolve an EOF-delimited body into
    /// `MessageComplete`, or mark the parser as errored if content was still
    /// expected (content-length body cut short, mid-headers, etc.).
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.write(data);
    }

    /// Drain as many events as the currently buffered bytes allow. Returns
    /// an empty vec (not an error) when more bytes are needed.
    pub fn poll(&mut self) -> Result<Vec<ParseEvent>> {
        let mut events = Vec::new();
        if self.paused {
            return Ok(events);
        }
        loop {
            match self.state {
                State::StartLine => {
                    if !self.try_parse_start_line()? {
                        if self.eof {
                            self.state = State::Error;
                            return Err(Error::InvalidProto("connection closed before start line".into()));
                        }
                        break;
                    }
                }
                State::Headers => {
                    if let Some(done) = self.try_parse_headers()? {
                        if done {
                            let event = self.finish_headers()?;
                            events.push(event);
                        }
                    } else {
                        if self.eof {
                            self.state = State::Error;
                            return Err(Error::InvalidProto("connection closed while reading headers".into()));
                        }
                        break;
                    }
                }
                State::Body => {
                    if !self.pump_body(&mut events) {
                        break;
                    }
                }
                State::ChunkSize => {
                    if !self.pump_chunk_size(&mut events)? {
                        break;
                    }
                }
                State::ChunkData(_) => {
                    if !self.pump_chunk_data(&mut events) {
                        break;
                    }
                }
                State::ChunkTrailer => {
                    if !self.pump_chunk_trailer(&mut events)? {
                        break;
                    }
                }
                State::Done | State::Upgraded | State::Error => break,
            }
        }
        Ok(events)
    }

    fn peek_line(&self) -> Option<(Vec<u8>, usize)> {
        let slices = self.buf.peek_slices(usize::MAX);
        let joined: Vec<u8> = slices.into_iter().flatten().copied().collect();
        let pos = joined.windows(2).position(|w| w == b"\r\n")?;
        Some((joined[..pos].to_vec(), pos + 2))
    }

    fn try_parse_start_line(&mut self) -> Result<bool> {
        if self.buf.readable_len() > self.config.max_start_line {
            return Err(Error::InvalidProto("start line too long".into()));
        }
        let Some((line, consumed)) = self.peek_line() else { return Ok(false) };
        self.buf.consume(consumed);
        let text = String::from_utf8_lossy(&line).into_owned();
        let mut parts = text.splitn(3, ' ');
        let a = parts.next().ok_or_else(|| Error::InvalidProto("empty start line".into()))?;
        let b = parts.next().ok_or_else(|| Error::InvalidProto("malformed start line".into()))?;
        let c = parts.next().ok_or_else(|| Error::InvalidProto("malformed start line".into()))?;

        if self.is_request {
            let method = message::Method::parse(a);
            self.method_is_head = method == message::Method::Head;
            let (path, query) = message::split_path_and_query(b);
            let version = Version::parse(c)?;
            self.start_line = Some(StartLine::Request { method, raw_method: a.to_string(), path, query, version });
        } else {
            let version = Version::parse(a)?;
            let status: u16 = b.parse().map_err(|_| Error::InvalidProto("non-numeric status code".into()))?;
            self.start_line = Some(StartLine::Response { version, status, reason: c.to_string() });
        }
        self.state = State::Headers;
        Ok(true)
    }

    fn try_parse_headers(&mut self) -> Result<Option<bool>> {
        if self.buf.readable_len() > self.config.max_header_bytes {
            return Err(Error::InvalidProto("headers too large".into()));
        }
        let Some((line, consumed)) = self.peek_line() else { return Ok(None) };
        self.buf.consume(consumed);
        if line.is_empty() {
            return Ok(Some(true));
        }
        if self.headers.len() >= self.config.max_headers {
            return Err(Error::InvalidProto("too many headers".into()));
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let (name, value) = text.split_once(':').ok_or_else(|| Error::InvalidProto("malformed header line".into()))?;
        self.headers.push(Header::new(name.trim().to_string(), value.trim().to_string()));
        Ok(Some(false))
    }

    fn finish_headers(&mut self) -> Result<ParseEvent> {
        if let Some(token) = message::is_upgrade(&self.headers) {
            self.state = State::Upgraded;
            let tail = self.drain_remaining();
            return Ok(ParseEvent::Upgrade { token, tail });
        }

        self.body_mode = self.determine_body_mode()?;
        self.state = match self.body_mode {
            BodyMode::None => State::Done,
            BodyMode::ContentLength(n) => {
                self.body_remaining = n;
                if n == 0 { State::Done } else { State::Body }
            }
            BodyMode::Chunked => State::ChunkSize,
            BodyMode::Eof => State::Body,
        };

        let start_line = self.start_line.clone().ok_or_else(|| Error::InvalidProto("missing start line".into()))?;
        Ok(ParseEvent::HeaderComplete { start_line, headers: std::mem::take(&mut self.headers) })
    }

    fn determine_body_mode(&self) -> Result<BodyMode> {
        if self.method_is_head {
            return Ok(BodyMode::None);
        }
        if let StartLine::Response { status, .. } = self.start_line.as_ref().unwrap() {
            if response_forbids_body(*status) {
                return Ok(BodyMode::None);
            }
        }
        if let Some(te) = message::header_value(&self.headers, "transfer-encoding") {
            if te.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "chunked") {
                return Ok(BodyMode::Chunked);
            }
        }
        if let Some(len) = message::header_value(&self.headers, "content-length") {
            let n: usize = len.trim().parse().map_err(|_| Error::InvalidProto("non-numeric content-length".into()))?;
            return Ok(BodyMode::ContentLength(n));
        }
        if !self.is_request {
            return Ok(BodyMode::Eof);
        }
        Ok(BodyMode::None)
    }

    fn drain_remaining(&mut self) -> Vec<u8> {
        let len = self.buf.readable_len();
        let mut out = vec![0u8; len];
        self.buf.read(&mut out);
        out
    }

    fn pump_body(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        match self.body_mode {
            BodyMode::ContentLength(_) => {
                let take = self.body_remaining.min(self.buf.readable_len());
                if take == 0 {
                    if self.body_remaining == 0 {
                        self.state = State::Done;
                        events.push(ParseEvent::MessageComplete);
                        return true;
                    }
                    return false;
                }
                let mut chunk = vec![0u8; take];
                self.buf.read(&mut chunk);
                self.body_remaining -= take;
                events.push(ParseEvent::BodyChunk(chunk));
                if self.body_remaining == 0 {
                    self.state = State::Done;
                    events.push(ParseEvent::MessageComplete);
                }
                true
            }
            BodyMode::Eof => {
                let len = self.buf.readable_len();
                if len > 0 {
                    let mut chunk = vec![0u8; len];
                    self.buf.read(&mut chunk);
                    events.push(ParseEvent::BodyChunk(chunk));
                }
                if self.eof {
                    self.state = State::Done;
                    events.push(ParseEvent::MessageComplete);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn pump_chunk_size(&mut self, events: &mut Vec<ParseEvent>) -> Result<bool> {
        let Some((line, consumed)) = self.peek_line() else { return Ok(false) };
        self.buf.consume(consumed);
        let text = String::from_utf8_lossy(&line).into_owned();
        let size_token = text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16).map_err(|_| Error::InvalidProto("malformed chunk size".into()))?;
        if size == 0 {
            self.state = State::ChunkTrailer;
        } else {
            self.state = State::ChunkData(size);
        }
        let _ = events;
        Ok(true)
    }

    fn pump_chunk_data(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        let State::ChunkData(remaining) = self.state else { return false };
        if remaining > 0 {
            let take = remaining.min(self.buf.readable_len());
            if take == 0 {
                return false;
            }
            let mut chunk = vec![0u8; take];
            self.buf.read(&mut chunk);
            events.push(ParseEvent::BodyChunk(chunk));
            self.state = State::ChunkData(remaining - take);
            return true;
        }
        // `remaining == 0`: consume the trailing CRLF after the chunk data.
        let Some((_, consumed)) = self.peek_line() else { return false };
        self.buf.consume(consumed);
        self.state = State::ChunkSize;
        true
    }

    fn pump_chunk_trailer(&mut self, events: &mut Vec<ParseEvent>) -> Result<bool> {
        let Some((line, consumed)) = self.peek_line() else { return Ok(false) };
        self.buf.consume(consumed);
        if line.is_empty() {
            self.state = State::Done;
            events.push(ParseEvent::MessageComplete);
        }
        Ok(true)
    }

    /// Reset to parse the next message on the same connection
    /// (keep-alive pipelining).
    pub fn reset(&mut self) {
        self.state = State::StartLine;
        self.headers.clear();
        self.start_line = None;
        self.body_mode = BodyMode::None;
        self.body_remaining = 0;
        self.method_is_head = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_request() {
        let mut parser = Parser::new_request(ParserConfig::default());
        parser.feed(b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\n\r\n");
        let events = parser.poll().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParseEvent::HeaderComplete { start_line: StartLine::Request { path, query, .. }, .. } => {
                assert_eq!(path, "/hello");
                assert_eq!(query.get("x").unwrap(), "1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events[1], ParseEvent::MessageComplete));
    }

    #[test]
    fn parses_body_delivered_across_two_feeds() {
        let mut parser = Parser::new_request(ParserConfig::default());
        parser.feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
        let events = parser.poll().unwrap();
        assert!(matches!(events[0], ParseEvent::HeaderComplete { .. }));
        assert!(matches!(events[1], ParseEvent::BodyChunk(_)));
        assert_eq!(events.len(), 2);

        parser.feed(b"lo");
        let events = parser.poll().unwrap();
        assert!(matches!(events[0], ParseEvent::BodyChunk(_)));
        assert!(matches!(events[1], ParseEvent::MessageComplete));
    }

    #[test]
    fn parses_chunked_body() {
        let mut parser = Parser::new_request(ParserConfig::default());
        parser.feed(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n");
        let events = parser.poll().unwrap();
        let mut body = Vec::new();
        let mut saw_complete = false;
        for e in &events {
            if let ParseEvent::BodyChunk(c) = e {
                body.extend_from_slice(c);
            }
            if matches!(e, ParseEvent::MessageComplete) {
                saw_complete = true;
            }
        }
        assert_eq!(body, b"Wiki");
        assert!(saw_complete);
    }

    #[test]
    fn detects_upgrade_and_returns_tail_bytes() {
        let mut parser = Parser::new_request(ParserConfig::default());
        parser.feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nTAIL");
        let events = parser.poll().unwrap();
        match &events[0] {
            ParseEvent::Upgrade { token, tail } => {
                assert_eq!(token, "websocket");
                assert_eq!(tail, b"TAIL");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn head_response_has_no_body_even_with_content_length() {
        let mut parser = Parser::new_request(ParserConfig::default());
        parser.feed(b"HEAD /x HTTP/1.1\r\nContent-Length: 100\r\n\r\n");
        let events = parser.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ParseEvent::MessageComplete));
    }

    #[test]
    fn response_without_length_reads_until_eof() {
        let mut parser = Parser::new_response(ParserConfig::default());
        parser.feed(b"HTTP/1.1 200 OK\r\n\r\nsome bytes");
        let events = parser.poll().unwrap();
        assert!(matches!(events[1], ParseEvent::BodyChunk(_)));
        assert_eq!(events.len(), 2);

        parser.set_eof();
        let events = parser.poll().unwrap();
        assert!(matches!(events.last().unwrap(), ParseEvent::MessageComplete));
    }
}
