//! WebSocket framer and connection (§3 "WebSocket"), built on
//! [`crate::net::TcpSocket`] the same way `fastwebsockets` layers its frame
//! codec over an arbitrary `AsyncRead + AsyncWrite` transport — here the
//! transport is this crate's own driven socket instead of an async trait
//! object, so the connection type below is a [`crate::net::TcpHandler`]
//! impl that re-dispatches decoded frames to a user [`WsHandler`].

pub mod frame;
pub mod handshake;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

use crate::buffer::Chain;
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::net::{TcpConfig, TcpHandler, TcpSocket};
use frame::{decode, encode, Frame, OpCode};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Debug)]
pub struct WsConfig {
    pub role: Role,
    /// Reject a message (after reassembling fragments) larger than this.
    pub max_message_size: usize,
    #[cfg(feature = "permessage-deflate")]
    pub deflate: Option<deflate::DeflateConfig>,
}

impl Default for WsConfig {
    fn default() -> WsConfig {
        WsConfig {
            role: Role::Client,
            max_message_size: 16 * 1024 * 1024,
            #[cfg(feature = "permessage-deflate")]
            deflate: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

pub trait WsHandler: Send {
    fn on_open(&mut self, _conn: &WsConnection) {}
    fn on_message(&mut self, _conn: &WsConnection, _message: WsMessage) {}
    fn on_close(&mut self, _conn: &WsConnection, _code: u16, _reason: String) {}
    fn on_error(&mut self, _conn: &WsConnection, _err: Error) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Open,
    CloseSent,
    Closed,
}

struct Assembly {
    opcode: OpCode,
    payload: Vec<u8>,
    compressed: bool,
}

struct Inner {
    socket: TcpSocket,
    recv_buf: Chain,
    handler: Box<dyn WsHandler>,
    role: Role,
    state: ConnState,
    assembly: Option<Assembly>,
    max_message_size: usize,
    #[cfg(feature = "permessage-deflate")]
    inflater: Option<deflate::Inflater>,
    #[cfg(feature = "permessage-deflate")]
    deflater: Option<deflate::Deflater>,
}

/// An established WebSocket connection (post-handshake).
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Mutex<Inner>>,
}

impl WsConnection {
    /// Wrap an already-connected [`TcpSocket`] (handshake already completed
    /// by the caller) as a WebSocket endpoint.
    pub fn from_socket(socket: TcpSocket, config: WsConfig, handler: Box<dyn WsHandler>) -> WsConnection {
        #[cfg(feature = "permessage-deflate")]
        let (inflater, deflater) = match &config.deflate {
            Some(d) => (
                Some(deflate::Inflater::new(match config.role {
                    Role::Client => d.server_no_context_takeover,
                    Role::Server => d.client_no_context_takeover,
                })),
                Some(deflate::Deflater::new(match config.role {
                    Role::Client => d.client_no_context_takeover,
                    Role::Server => d.server_no_context_takeover,
                })),
            ),
            None => (None, None),
        };

        let inner = Arc::new(Mutex::new(Inner {
            socket,
            recv_buf: Chain::new(),
            handler,
            role: config.role,
            state: ConnState::Open,
            assembly: None,
            max_message_size: config.max_message_size,
            #[cfg(feature = "permessage-deflate")]
            inflater,
            #[cfg(feature = "permessage-deflate")]
            deflater,
        }));
        let conn = WsConnection { inner };
        conn.inner.lock().unwrap().handler.on_open(&conn);
        conn
    }

    /// Open a client connection over a fresh TCP connect, driving the
    /// opening handshake (HTTP/1.1 GET + Upgrade) before handing control to
    /// `handler`. The handshake request/response exchange is done
    /// synchronously against the socket's nonblocking bytes via the
    /// underlying [`TcpHandler`] trampoline in [`ClientHandshake`].
    pub fn connect(
        loop_handle: LoopHandle,
        addr: SocketAddr,
        host: &str,
        path: &str,
        config: WsConfig,
        handler: Box<dyn WsHandler>,
    ) -> Result<Arc<Mutex<Option<WsConnection>>>> {
        let result_slot: Arc<Mutex<Option<WsConnection>>> = Arc::new(Mutex::new(None));
        let key = handshake::generate_key();
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        let trampoline = ClientHandshake {
            expected_accept: handshake::accept_key(&key),
            response_buf: Vec::new(),
            request: Some(request),
            config,
            handler: Some(handler),
            result: result_slot.clone(),
        };
        TcpSocket::connect(loop_handle, addr, TcpConfig::default(), Box::new(trampoline))?;
        Ok(result_slot)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(OpCode::Text, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_message(OpCode::Binary, data)
    }

    fn send_message(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.state != ConnState::Open {
            return Err(Error::InvalidState);
        }
        #[cfg(feature = "permessage-deflate")]
        let (rsv1, payload) = match guard.deflater.as_mut() {
            Some(deflater) => (true, deflater.compress_message(payload)?),
            None => (false, payload.to_vec()),
        };
        #[cfg(not(feature = "permessage-deflate"))]
        let (rsv1, payload) = (false, payload.to_vec());

        let mask = match guard.role {
            Role::Client => Some(client_mask_key()),
            Role::Server => None,
        };
        let frame = Frame { fin: true, rsv1, opcode, payload };
        let mut out = Vec::new();
        encode(&frame, mask, &mut out);
        guard.socket.send(&out).map(|_| ())
    }

    pub fn send_ping(&self, data: Vec<u8>) -> Result<()> {
        self.write_control(Frame::ping(data))
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.state != ConnState::Open {
            return Ok(());
        }
        guard.state = ConnState::CloseSent;
        drop(guard);
        self.write_control(Frame::close(code, reason))?;
        self.inner.lock().unwrap().socket.close()
    }

    fn write_control(&self, frame: Frame) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let mask = match guard.role {
            Role::Client => Some(client_mask_key()),
            Role::Server => None,
        };
        let mut out = Vec::new();
        encode(&frame, mask, &mut out);
        guard.socket.send(&out).map(|_| ())
    }
}

fn client_mask_key() -> [u8; 4] {
    use rand::Rng;
    rand::rng().random()
}

impl TcpHandler for WsConnection {
    fn on_data(&mut self, _socket: &TcpSocket, data: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        guard.recv_buf.write(data);
        drop(guard);
        drain_frames(self);
    }

    fn on_close(&mut self, _socket: &TcpSocket, err: Option<Error>) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = ConnState::Closed;
        drop(guard);
        if let Some(err) = err {
            let mut guard = self.inner.lock().unwrap();
            guard.handler.on_error(self, err);
        }
    }
}

fn drain_frames(conn: &WsConnection) {
    loop {
        let (available, consumed) = {
            let mut guard = conn.inner.lock().unwrap();
            let slices = guard.recv_buf.peek_slices(usize::MAX);
            let joined: Vec<u8> = slices.into_iter().flatten().copied().collect();
            match decode(&joined) {
                Ok(Some(decoded)) => {
                    guard.recv_buf.consume(decoded.consumed);
                    (Some(decoded.frame), decoded.consumed)
                }
                Ok(None) => (None, 0),
                Err(e) => {
                    drop(guard);
                    let mut guard = conn.inner.lock().unwrap();
                    guard.handler.on_error(conn, e);
                    return;
                }
            }
        };
        let _ = consumed;
        let Some(frame) = available else { return };
        if !handle_frame(conn, frame) {
            return;
        }
    }
}

/// Returns `false` to stop draining (connection closed or a fatal error).
fn handle_frame(conn: &WsConnection, frame: Frame) -> bool {
    match frame.opcode {
        OpCode::Ping => {
            let _ = conn.write_control(Frame::pong(frame.payload));
            true
        }
        OpCode::Pong => true,
        OpCode::Close => {
            let (code, reason) = parse_close_payload(&frame.payload);
            let already_sent = {
                let guard = conn.inner.lock().unwrap();
                guard.state == ConnState::CloseSent
            };
            if !already_sent {
                let _ = conn.write_control(Frame::close(code, &reason));
            }
            {
                let mut guard = conn.inner.lock().unwrap();
                guard.state = ConnState::Closed;
            }
            let _ = conn.inner.lock().unwrap().socket.close();
            conn.inner.lock().unwrap().handler.on_close(conn, code, reason);
            false
        }
        OpCode::Continuation => {
            let complete = {
                let mut guard = conn.inner.lock().unwrap();
                let Some(assembly) = guard.assembly.as_mut() else {
                    drop(guard);
                    conn.inner.lock().unwrap().handler.on_error(
                        conn,
                        Error::InvalidProto("continuation frame without a start".into()),
                    );
                    return true;
                };
                assembly.payload.extend_from_slice(&frame.payload);
                if assembly.payload.len() > guard.max_message_size {
                    drop(guard);
                    conn.inner.lock().unwrap().handler.on_error(conn, Error::BufferTooLong);
                    return true;
                }
                frame.fin
            };
            if complete {
                finish_message(conn);
            }
            true
        }
        OpCode::Text | OpCode::Binary => {
            if frame.fin {
                deliver_single(conn, frame);
            } else {
                let mut guard = conn.inner.lock().unwrap();
                guard.assembly = Some(Assembly { opcode: frame.opcode, payload: frame.payload, compressed: frame.rsv1 });
            }
            true
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (1000, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

fn finish_message(conn: &WsConnection) {
    let assembly = conn.inner.lock().unwrap().assembly.take();
    let Some(assembly) = assembly else { return };
    deliver_payload(conn, assembly.opcode, assembly.payload, assembly.compressed);
}

fn deliver_single(conn: &WsConnection, frame: Frame) {
    deliver_payload(conn, frame.opcode, frame.payload, frame.rsv1);
}

fn deliver_payload(conn: &WsConnection, opcode: OpCode, payload: Vec<u8>, compressed: bool) {
    #[cfg(feature = "permessage-deflate")]
    let payload = if compressed {
        let mut guard = conn.inner.lock().unwrap();
        let Some(inflater) = guard.inflater.as_mut() else {
            drop(guard);
            conn.inner
                .lock()
                .unwrap()
                .handler
                .on_error(conn, Error::InvalidProto("compressed frame without negotiated extension".into()));
            return;
        };
        match inflater.decompress_message(&payload) {
            Ok(p) => p,
            Err(e) => {
                drop(guard);
                conn.inner.lock().unwrap().handler.on_error(conn, e);
                return;
            }
        }
    } else {
        payload
    };
    #[cfg(not(feature = "permessage-deflate"))]
    let _ = compressed;

    let message = match opcode {
        OpCode::Text => match String::from_utf8(payload) {
            Ok(s) => WsMessage::Text(s),
            Err(_) => {
                conn.inner.lock().unwrap().handler.on_error(conn, Error::InvalidProto("invalid utf-8 in text frame".into()));
                return;
            }
        },
        _ => WsMessage::Binary(payload),
    };
    conn.inner.lock().unwrap().handler.on_message(conn, message);
}

/// Drives the client opening handshake over a freshly-connected
/// [`TcpSocket`]: writes the upgrade request on connect, parses the status
/// line and headers off the raw byte stream, validates
/// `Sec-WebSocket-Accept`, then reparents the socket onto a [`WsConnection`]
/// for the rest of the connection's life — any bytes read past the blank
/// line terminating the response are the start of the WebSocket stream and
/// must not be dropped.
struct ClientHandshake {
    expected_accept: String,
    response_buf: Vec<u8>,
    request: Option<String>,
    config: WsConfig,
    handler: Option<Box<dyn WsHandler>>,
    result: Arc<Mutex<Option<WsConnection>>>,
}

impl TcpHandler for ClientHandshake {
    fn on_connect(&mut self, socket: &TcpSocket) {
        if let Some(request) = self.request.take() {
            let _ = socket.send(request.as_bytes());
        }
    }

    fn on_data(&mut self, socket: &TcpSocket, data: &[u8]) {
        self.response_buf.extend_from_slice(data);
        let Some(header_end) = find_header_end(&self.response_buf) else { return };
        let header_text = String::from_utf8_lossy(&self.response_buf[..header_end]).into_owned();
        let tail = self.response_buf[header_end..].to_vec();

        let mut lines = header_text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let accepted = status_line.contains(" 101 ");
        let mut accept_value = None;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("sec-websocket-accept") {
                    accept_value = Some(value.trim().to_string());
                }
            }
        }

        if !accepted || accept_value.as_deref() != Some(self.expected_accept.as_str()) {
            let _ = socket.close();
            return;
        }

        let handler = self.handler.take().unwrap_or_else(|| Box::new(NullHandler));
        let conn = WsConnection::from_socket(socket.clone(), self.config.clone(), handler);
        socket.set_handler(Box::new(conn.clone()));
        if !tail.is_empty() {
            conn.inner.lock().unwrap().recv_buf.write(&tail);
            drain_frames(&conn);
        }
        *self.result.lock().unwrap() = Some(conn);
    }
}

struct NullHandler;
impl WsHandler for NullHandler {}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_payload_parses_code_and_reason() {
        let frame = Frame::close(1001, "going away");
        let (code, reason) = parse_close_payload(&frame.payload);
        assert_eq!(code, 1001);
        assert_eq!(reason, "going away");
    }

    #[test]
    fn close_payload_defaults_when_absent() {
        let (code, reason) = parse_close_payload(&[]);
        assert_eq!(code, 1000);
        assert_eq!(reason, "");
    }

    #[test]
    fn find_header_end_locates_blank_line() {
        let buf = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\ntrailing";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[end..], b"trailing");
    }
}
