//! HTTP/2 connection state machine (§4.9): preface/SETTINGS handshake,
//! frame dispatch, HPACK-driven HEADERS/CONTINUATION reassembly, and
//! per-stream/per-connection flow control. Driven over a
//! [`crate::net::TcpSocket`] the same way [`crate::ws::WsConnection`] layers
//! its frame codec over one — a [`ConnectionHandler`] plays the role `h2`
//! gives `Connection`'s poll consumer, just delivered through callbacks
//! instead of futures.

use super::frame::{self, decode_one, encode_frame, flags, FrameType};
use super::hpack::{HpackDecoder, HpackEncoder, Indexing};
use super::settings::Settings;
use super::stream::{H2Headers, Stream, StreamState};
use crate::buffer::Chain;
use crate::error::{Error, Result};
use crate::net::{TcpConfig, TcpHandler, TcpSocket};
use crate::event_loop::LoopHandle;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

pub trait ConnectionHandler: Send {
    fn on_headers(&mut self, _conn: &Connection, _stream_id: u32, _headers: H2Headers, _end_stream: bool) {}
    fn on_data(&mut self, _conn: &Connection, _stream_id: u32, _data: Vec<u8>, _end_stream: bool) {}
    fn on_stream_closed(&mut self, _conn: &Connection, _stream_id: u32) {}
    fn on_writable(&mut self, _conn: &Connection, _stream_id: u32) {}
    fn on_goaway(&mut self, _conn: &Connection, _last_stream_id: u32, _error_code: u32) {}
    fn on_error(&mut self, _conn: &Connection, _err: Error) {}
}

struct PartialHeaders {
    stream_id: u32,
    end_stream: bool,
    block: Vec<u8>,
}

struct Inner {
    socket: TcpSocket,
    mode: Mode,
    recv_buf: Chain,
    preface_checked: bool,
    local_settings: Settings,
    remote_settings: Settings,
    local_settings_acked: bool,
    hpack_enc: HpackEncoder,
    hpack_dec: HpackDecoder,
    streams: HashMap<u32, Stream>,
    next_local_stream_id: u32,
    last_peer_stream_id: u32,
    conn_send_window: i64,
    conn_recv_window: i64,
    blocked_streams: VecDeque<u32>,
    promised: HashMap<u32, u32>,
    partial_headers: Option<PartialHeaders>,
    goaway_sent: bool,
    goaway_received: bool,
    handler: Box<dyn ConnectionHandler>,
}

/// An HTTP/2 connection over a single TCP socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<Inner>>,
}

impl Connection {
    pub fn from_socket(socket: TcpSocket, mode: Mode, local_settings: Settings, handler: Box<dyn ConnectionHandler>) -> Connection {
        let inner = Arc::new(Mutex::new(Inner {
            socket,
            mode,
            recv_buf: Chain::new(),
            preface_checked: mode == Mode::Client,
            local_settings,
            remote_settings: Settings::default(),
            local_settings_acked: false,
            hpack_enc: HpackEncoder::new(local_settings.header_table_size as usize),
            hpack_dec: HpackDecoder::new(local_settings.header_table_size as usize),
            streams: HashMap::new(),
            next_local_stream_id: if mode == Mode::Client { 1 } else { 2 },
            last_peer_stream_id: 0,
            conn_send_window: 65_535,
            conn_recv_window: 65_535,
            blocked_streams: VecDeque::new(),
            promised: HashMap::new(),
            partial_headers: None,
            goaway_sent: false,
            goaway_received: false,
            handler,
        }));
        let conn = Connection { inner };
        conn.send_preface_and_settings();
        conn
    }

    /// Open a client connection over a fresh TCP connect. Returns
    /// immediately; the slot is filled in once the preface/SETTINGS
    /// handshake has been kicked off (mirrors [`crate::ws::WsConnection::connect`]'s
    /// trampoline shape, since the underlying accept/connect callback is
    /// itself asynchronous).
    pub fn connect(loop_handle: LoopHandle, addr: SocketAddr, local_settings: Settings, handler: Box<dyn ConnectionHandler>) -> Result<Arc<Mutex<Option<Connection>>>> {
        let slot: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let trampoline = ConnectTrampoline { local_settings, handler: Some(handler), result: slot.clone() };
        TcpSocket::connect(loop_handle, addr, TcpConfig::default(), Box::new(trampoline))?;
        Ok(slot)
    }

    fn send_preface_and_settings(&self) {
        let mut guard = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if guard.mode == Mode::Client {
            out.extend_from_slice(frame::PREFACE);
        }
        let baseline = Settings::default();
        let local_settings = guard.local_settings;
        let payload = local_settings.encode(&baseline);
        encode_frame(FrameType::Settings, 0, 0, &payload, &mut out);
        let _ = guard.socket.send(&out);
    }

    /// Open a new locally-initiated stream id (odd for clients, even for
    /// servers), per RFC 7540 §5.1.1.
    pub fn open_stream(&self) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_local_stream_id;
        guard.next_local_stream_id += 2;
        let window = guard.local_settings.initial_window_size;
        guard.streams.insert(id, Stream::new(id, window));
        id
    }

    pub fn send_headers(&self, stream_id: u32, headers: Vec<(String, String)>, end_stream: bool) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let window = guard.local_settings.initial_window_size;
        let entries: Vec<(String, String, Indexing)> =
            headers.into_iter().map(|(n, v)| (n, v, Indexing::WithoutIndexing)).collect();
        let block = guard.hpack_enc.encode_header_block(&entries);
        {
            let stream = guard.streams.entry(stream_id).or_insert_with(|| Stream::new(stream_id, window));
            stream.send_headers(end_stream)?;
        }
        let mut flag = flags::END_HEADERS;
        if end_stream {
            flag |= flags::END_STREAM;
        }
        let mut out = Vec::new();
        encode_frame(FrameType::Headers, flag, stream_id, &block, &mut out);
        guard.socket.send(&out).map(|_| ())
    }

    /// Send up to `data.len()` bytes, bounded by the connection/stream
    /// windows and the peer's max frame size (§4.9 flow control). Returns
    /// the number of bytes actually written; the caller is responsible for
    /// retrying the remainder once [`ConnectionHandler::on_writable`] fires.
    pub fn send_data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        let max_frame = guard.remote_settings.max_frame_size as usize;
        let conn_window = guard.conn_send_window.max(0) as usize;
        let stream_window = {
            let stream = guard.streams.get(&stream_id).ok_or(Error::InvalidState)?;
            stream.send_window.max(0) as usize
        };
        let allowed = data.len().min(max_frame).min(conn_window).min(stream_window);

        if allowed > 0 {
            let mut out = Vec::new();
            let sent_end = end_stream && allowed == data.len();
            let flag = if sent_end { flags::END_STREAM } else { 0 };
            encode_frame(FrameType::Data, flag, stream_id, &data[..allowed], &mut out);
            guard.conn_send_window -= allowed as i64;
            if let Some(stream) = guard.streams.get_mut(&stream_id) {
                stream.send_window -= allowed as i64;
                if sent_end {
                    stream.send_end_stream();
                }
            }
            guard.socket.send(&out)?;
        }

        if allowed < data.len() {
            let stream = guard.streams.get_mut(&stream_id).ok_or(Error::InvalidState)?;
            if !stream.send_blocked {
                stream.send_blocked = true;
                guard.blocked_streams.push_back(stream_id);
            }
        }
        Ok(allowed)
    }

    pub fn send_rst_stream(&self, stream_id: u32, error_code: u32) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(stream) = guard.streams.get_mut(&stream_id) {
            stream.reset();
        }
        let mut out = Vec::new();
        encode_frame(FrameType::RstStream, 0, stream_id, &error_code.to_be_bytes(), &mut out);
        guard.socket.send(&out).map(|_| ())
    }

    pub fn send_ping(&self, payload: [u8; 8]) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let mut out = Vec::new();
        encode_frame(FrameType::Ping, 0, 0, &payload, &mut out);
        guard.socket.send(&out).map(|_| ())
    }

    pub fn send_goaway(&self, error_code: u32) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let last_id = guard.last_peer_stream_id;
        guard.goaway_sent = true;
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(last_id & 0x7fff_ffff).to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());
        let mut out = Vec::new();
        encode_frame(FrameType::GoAway, 0, 0, &payload, &mut out);
        guard.socket.send(&out).map(|_| ())
    }

    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.inner.lock().unwrap().streams.get(&stream_id).map(|s| s.state)
    }
}

impl TcpHandler for Connection {
    fn on_data(&mut self, _socket: &TcpSocket, data: &[u8]) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.recv_buf.write(data);
        }
        drain(self);
    }

    fn on_close(&mut self, _socket: &TcpSocket, err: Option<Error>) {
        if let Some(err) = err {
            let mut guard = self.inner.lock().unwrap();
            guard.handler.on_error(self, err);
        }
    }
}

fn drain(conn: &Connection) {
    loop {
        {
            let mut guard = conn.inner.lock().unwrap();
            if !guard.preface_checked {
                if guard.recv_buf.readable_len() < frame::PREFACE.len() {
                    return;
                }
                let slices = guard.recv_buf.peek_slices(frame::PREFACE.len());
                let joined: Vec<u8> = slices.into_iter().flatten().copied().collect();
                if joined != frame::PREFACE {
                    drop(guard);
                    conn.inner.lock().unwrap().handler.on_error(conn, Error::InvalidProto("bad HTTP/2 preface".into()));
                    return;
                }
                guard.recv_buf.consume(frame::PREFACE.len());
                guard.preface_checked = true;
            }
        }

        let frame = {
            let guard = conn.inner.lock().unwrap();
            let slices = guard.recv_buf.peek_slices(usize::MAX);
            let joined: Vec<u8> = slices.into_iter().flatten().copied().collect();
            let max_frame_size = guard.local_settings.max_frame_size;
            match decode_one(&joined, max_frame_size) {
                Ok(Some((f, consumed))) => {
                    drop(guard);
                    conn.inner.lock().unwrap().recv_buf.consume(consumed);
                    Some(f)
                }
                Ok(None) => None,
                Err(e) => {
                    drop(guard);
                    conn.inner.lock().unwrap().handler.on_error(conn, e);
                    return;
                }
            }
        };
        let Some(frame) = frame else { return };
        if let Err(e) = handle_frame(conn, frame) {
            conn.inner.lock().unwrap().handler.on_error(conn, e);
            return;
        }
    }
}

fn handle_frame(conn: &Connection, frame: frame::Frame) -> Result<()> {
    match frame.header.frame_type {
        FrameType::Settings => handle_settings(conn, &frame),
        FrameType::Ping => handle_ping(conn, &frame),
        FrameType::WindowUpdate => handle_window_update(conn, &frame),
        FrameType::Headers => handle_headers_or_continuation(conn, &frame, true),
        FrameType::Continuation => handle_headers_or_continuation(conn, &frame, false),
        FrameType::Data => handle_data(conn, &frame),
        FrameType::RstStream => handle_rst_stream(conn, &frame),
        FrameType::GoAway => handle_goaway(conn, &frame),
        FrameType::Priority => Ok(()),
        FrameType::PushPromise => handle_push_promise(conn, &frame),
        FrameType::Unknown(_) => Ok(()),
    }
}

fn handle_settings(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    let mut guard = conn.inner.lock().unwrap();
    if frame.header.has_flag(flags::ACK) {
        guard.local_settings_acked = true;
        return Ok(());
    }
    let old_window = guard.remote_settings.apply(&frame.payload)?;
    let new_window = guard.remote_settings.initial_window_size;
    if new_window != old_window {
        let delta = new_window as i64 - old_window as i64;
        for stream in guard.streams.values_mut() {
            stream.send_window += delta;
        }
    }
    let mut out = Vec::new();
    encode_frame(FrameType::Settings, flags::ACK, 0, &[], &mut out);
    guard.socket.send(&out)?;
    drop(guard);
    flush_blocked(conn);
    Ok(())
}

fn handle_ping(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    if frame.header.has_flag(flags::ACK) {
        return Ok(());
    }
    let guard = conn.inner.lock().unwrap();
    let mut out = Vec::new();
    encode_frame(FrameType::Ping, flags::ACK, 0, &frame.payload, &mut out);
    guard.socket.send(&out).map(|_| ())
}

fn handle_window_update(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    if frame.payload.len() != 4 {
        return Err(Error::ProtoError("malformed WINDOW_UPDATE".into()));
    }
    let increment = u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]) & 0x7fff_ffff;
    let mut guard = conn.inner.lock().unwrap();
    if frame.header.stream_id == 0 {
        guard.conn_send_window += increment as i64;
    } else if let Some(stream) = guard.streams.get_mut(&frame.header.stream_id) {
        stream.send_window += increment as i64;
    }
    drop(guard);
    flush_blocked(conn);
    Ok(())
}

/// Notify every blocked stream, in FIFO insertion order, that the
/// connection window (or their own) may have opened back up (§4.9
/// WINDOW_UPDATE handler).
fn flush_blocked(conn: &Connection) {
    let ids: Vec<u32> = {
        let mut guard = conn.inner.lock().unwrap();
        std::mem::take(&mut guard.blocked_streams).into_iter().collect()
    };
    for id in ids {
        {
            let mut guard = conn.inner.lock().unwrap();
            if let Some(stream) = guard.streams.get_mut(&id) {
                stream.send_blocked = false;
            }
        }
        conn.inner.lock().unwrap().handler.on_writable(conn, id);
    }
}

fn handle_headers_or_continuation(conn: &Connection, frame: &frame::Frame, is_headers: bool) -> Result<()> {
    let stream_id = frame.header.stream_id;
    if stream_id == 0 {
        return Err(Error::ProtoError("HEADERS/CONTINUATION on stream 0".into()));
    }

    if is_headers {
        let end_stream = frame.header.has_flag(flags::END_STREAM);
        let end_headers = frame.header.has_flag(flags::END_HEADERS);
        let block = strip_padding_and_priority(frame)?;
        {
            let mut guard = conn.inner.lock().unwrap();
            if guard.partial_headers.is_some() {
                return Err(Error::ProtoError("HEADERS received before prior block's CONTINUATION finished".into()));
            }
            if stream_id > guard.last_peer_stream_id {
                guard.last_peer_stream_id = stream_id;
            }
            if !end_headers {
                guard.partial_headers = Some(PartialHeaders { stream_id, end_stream, block: block.clone() });
            }
        }
        if end_headers {
            finish_headers(conn, stream_id, end_stream, block)?;
        }
    } else {
        let end_headers = frame.header.has_flag(flags::END_HEADERS);
        let finished = {
            let mut guard = conn.inner.lock().unwrap();
            let Some(partial) = guard.partial_headers.as_mut() else {
                return Err(Error::ProtoError("CONTINUATION without a preceding HEADERS".into()));
            };
            if partial.stream_id != stream_id {
                return Err(Error::ProtoError("CONTINUATION stream id mismatch".into()));
            }
            partial.block.extend_from_slice(&frame.payload);
            if end_headers {
                guard.partial_headers.take()
            } else {
                None
            }
        };
        if let Some(partial) = finished {
            finish_headers(conn, partial.stream_id, partial.end_stream, partial.block)?;
        }
    }
    Ok(())
}

/// Decode a completed HEADERS(+CONTINUATION...) block via HPACK, drive the
/// stream's state transition, and deliver it to the handler (§4.9 HEADERS
/// handler).
fn finish_headers(conn: &Connection, stream_id: u32, end_stream: bool, block: Vec<u8>) -> Result<()> {
    let (pairs, closed) = {
        let mut guard = conn.inner.lock().unwrap();
        let pairs = guard.hpack_dec.decode_header_block(&block)?;
        let window = guard.local_settings.initial_window_size;
        let stream = guard.streams.entry(stream_id).or_insert_with(|| Stream::new(stream_id, window));
        stream.recv_headers(end_stream)?;
        (pairs, stream.is_closed())
    };
    let headers = H2Headers { pairs };
    conn.inner.lock().unwrap().handler.on_headers(conn, stream_id, headers, end_stream);
    if closed {
        conn.inner.lock().unwrap().handler.on_stream_closed(conn, stream_id);
    }
    Ok(())
}

fn strip_padding_and_priority(frame: &frame::Frame) -> Result<Vec<u8>> {
    let mut payload = frame.payload.as_slice();
    let mut pad_len = 0usize;
    if frame.header.has_flag(flags::PADDED) {
        let Some((&len, rest)) = payload.split_first() else {
            return Err(Error::ProtoError("HEADERS padding length missing".into()));
        };
        pad_len = len as usize;
        payload = rest;
    }
    if frame.header.has_flag(flags::PRIORITY) {
        if payload.len() < 5 {
            return Err(Error::ProtoError("HEADERS priority fields truncated".into()));
        }
        payload = &payload[5..];
    }
    if pad_len > payload.len() {
        return Err(Error::ProtoError("HEADERS padding exceeds payload".into()));
    }
    Ok(payload[..payload.len() - pad_len].to_vec())
}

fn handle_data(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    let mut guard = conn.inner.lock().unwrap();
    let stream_id = frame.header.stream_id;
    let end_stream = frame.header.has_flag(flags::END_STREAM);
    let len = frame.payload.len() as i64;
    guard.conn_recv_window -= len;
    if let Some(stream) = guard.streams.get_mut(&stream_id) {
        stream.recv_window -= len;
        if end_stream {
            stream.recv_end_stream();
        }
    }

    let initial = guard.local_settings.initial_window_size as i64;
    let mut window_updates = Vec::new();
    if guard.conn_recv_window < initial / 2 {
        let increment = (initial - guard.conn_recv_window) as u32;
        guard.conn_recv_window = initial;
        window_updates.push((0u32, increment));
    }
    if let Some(stream) = guard.streams.get(&stream_id) {
        if stream.recv_window < initial / 2 {
            let increment = (initial - stream.recv_window) as u32;
            if let Some(stream) = guard.streams.get_mut(&stream_id) {
                stream.recv_window = initial;
            }
            window_updates.push((stream_id, increment));
        }
    }
    for (id, increment) in window_updates {
        let mut out = Vec::new();
        encode_frame(FrameType::WindowUpdate, 0, id, &increment.to_be_bytes(), &mut out);
        guard.socket.send(&out)?;
    }

    drop(guard);
    conn.inner.lock().unwrap().handler.on_data(conn, stream_id, frame.payload.clone(), end_stream);
    if end_stream {
        let closed = conn.inner.lock().unwrap().streams.get(&stream_id).map(|s| s.is_closed()).unwrap_or(false);
        if closed {
            conn.inner.lock().unwrap().handler.on_stream_closed(conn, stream_id);
        }
    }
    Ok(())
}

fn handle_rst_stream(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    if frame.payload.len() != 4 {
        return Err(Error::ProtoError("malformed RST_STREAM".into()));
    }
    let stream_id = frame.header.stream_id;
    {
        let mut guard = conn.inner.lock().unwrap();
        if let Some(stream) = guard.streams.get_mut(&stream_id) {
            stream.reset();
        }
    }
    conn.inner.lock().unwrap().handler.on_stream_closed(conn, stream_id);
    Ok(())
}

fn handle_goaway(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    if frame.payload.len() < 8 {
        return Err(Error::ProtoError("malformed GOAWAY".into()));
    }
    let last_stream_id = u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]) & 0x7fff_ffff;
    let error_code = u32::from_be_bytes([frame.payload[4], frame.payload[5], frame.payload[6], frame.payload[7]]);
    let to_close: Vec<u32> = {
        let mut guard = conn.inner.lock().unwrap();
        guard.goaway_received = true;
        let ids: Vec<u32> = guard.streams.keys().copied().filter(|id| *id <= last_stream_id).collect();
        for id in &ids {
            if let Some(s) = guard.streams.get_mut(id) {
                s.reset();
            }
        }
        ids
    };
    conn.inner.lock().unwrap().handler.on_goaway(conn, last_stream_id, error_code);
    for id in to_close {
        conn.inner.lock().unwrap().handler.on_stream_closed(conn, id);
    }
    Ok(())
}

fn handle_push_promise(conn: &Connection, frame: &frame::Frame) -> Result<()> {
    let mut guard = conn.inner.lock().unwrap();
    if !guard.local_settings.enable_push {
        let stream_id = frame.header.stream_id;
        drop(guard);
        conn.send_rst_stream(stream_id, 0x7 /* REFUSED_STREAM */)?;
        return Ok(());
    }
    if frame.payload.len() < 4 {
        return Err(Error::ProtoError("malformed PUSH_PROMISE".into()));
    }
    let promised_id = u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]) & 0x7fff_ffff;
    guard.promised.insert(promised_id, frame.header.stream_id);
    let window = guard.local_settings.initial_window_size;
    guard.streams.entry(promised_id).or_insert_with(|| {
        let mut s = Stream::new(promised_id, window);
        s.state = StreamState::ReservedRemote;
        s
    });
    Ok(())
}

/// Drives the client-side handshake: write the preface+SETTINGS on
/// connect, wait for the server's own SETTINGS before handing control to
/// [`Connection`].
struct ConnectTrampoline {
    local_settings: Settings,
    handler: Option<Box<dyn ConnectionHandler>>,
    result: Arc<Mutex<Option<Connection>>>,
}

impl TcpHandler for ConnectTrampoline {
    fn on_connect(&mut self, socket: &TcpSocket) {
        let handler = self.handler.take().unwrap_or_else(|| Box::new(NullHandler));
        let conn = Connection::from_socket(socket.clone(), Mode::Client, self.local_settings, handler);
        socket.set_handler(Box::new(conn.clone()));
        *self.result.lock().unwrap() = Some(conn);
    }
}

struct NullHandler;
impl ConnectionHandler for NullHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_padding_and_priority_removes_both() {
        let mut payload = vec![2u8]; // pad length 2
        payload.extend_from_slice(&[0, 0, 0, 5]); // exclusive dependency
        payload.push(16); // weight
        payload.extend_from_slice(b"data");
        payload.extend_from_slice(&[0, 0]); // padding
        let frame = frame::Frame {
            header: frame::FrameHeader { length: payload.len() as u32, frame_type: FrameType::Headers, flags: flags::PADDED | flags::PRIORITY, stream_id: 1 },
            payload,
        };
        let stripped = strip_padding_and_priority(&frame).unwrap();
        assert_eq!(stripped, b"data");
    }
}
