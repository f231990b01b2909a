//! Proxy-aware connection adapter (§4.7): tunnels a TCP connection through
//! an HTTP proxy via `CONNECT`, driving the `Proxy-Authenticate`/407
//! challenge loop before handing the raw tunnel back to the caller, who
//! layers TLS on top via [`crate::tls`] for an HTTPS origin exactly as it
//! would for a direct connection.
//!
//! Grounded on the same "parse framed bytes off a raw `TcpSocket` before
//! handing control elsewhere" shape as [`crate::ws::ClientHandshake`], just
//! with a retry loop across 407 challenges instead of a single Upgrade.

pub mod auth;

use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::net::{TcpConfig, TcpHandler, TcpSocket};
use auth::{Authenticator, ProxyCredentials, RequestInfo};
use std::net::SocketAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Connecting,
    Authenticating,
    SslConnecting,
    Open,
    Closed,
}

/// The origin this tunnel is being opened to.
#[derive(Clone, Debug)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    /// Whether the caller intends to negotiate TLS over the tunnel once
    /// it's open. Purely informational here — it only decides whether the
    /// terminal state is reported as `SslConnecting` (TLS still to come,
    /// driven by the caller) or `Open` (plaintext, ready to use).
    pub use_tls: bool,
}

/// Delivered the raw tunnel once `CONNECT` succeeds, or an error if it
/// never will.
pub trait ProxyHandler: Send {
    fn on_tunnel_established(&mut self, _socket: &TcpSocket) {}
    fn on_error(&mut self, _err: Error) {}
}

struct NullProxyHandler;
impl ProxyHandler for NullProxyHandler {}

const SCHEME_PREFERENCE: &[&str] = &["negotiate", "ntlm", "digest", "basic"];

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

struct ParsedResponse {
    status: u16,
    proxy_authenticate: Vec<String>,
}

fn parse_response_headers(header_text: &str) -> Result<ParsedResponse> {
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().filter(|l| !l.is_empty()).ok_or_else(|| Error::InvalidProto("empty proxy response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidProto(format!("malformed proxy status line: {status_line}")))?;

    let mut proxy_authenticate = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("proxy-authenticate") {
                proxy_authenticate.push(value.trim().to_string());
            }
        }
    }
    Ok(ParsedResponse { status, proxy_authenticate })
}

/// Pick the strongest scheme the proxy offered that this crate knows how to
/// speak, splitting each challenge into its scheme token and (for schemes
/// with a follow-up leg) the base64 token that comes after it.
fn select_challenge(authenticates: &[String]) -> Option<(String, Option<String>)> {
    for preferred in SCHEME_PREFERENCE {
        for raw in authenticates {
            let mut it = raw.splitn(2, ' ');
            let scheme = it.next().unwrap_or("");
            if scheme.eq_ignore_ascii_case(preferred) {
                let token = it.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                return Some((scheme.to_string(), token));
            }
        }
    }
    None
}

/// Drives a single `CONNECT` tunnel attempt. Installed as the `TcpHandler`
/// on a freshly connected socket; on a 407 that needs a fresh connection
/// (NTLM, Negotiate) it closes its socket and reinstalls a new instance of
/// itself, carrying the in-progress authenticator and the caller's
/// [`ProxyHandler`], onto a brand new one (§4.7 `need_reconnect`).
pub struct ProxyConnector {
    loop_handle: LoopHandle,
    proxy_addr: SocketAddr,
    target: ProxyTarget,
    credentials: ProxyCredentials,
    authenticator: Option<Box<dyn Authenticator>>,
    attempts: u32,
    max_attempts: u32,
    state: ProxyState,
    response_buf: Vec<u8>,
    handler: Option<Box<dyn ProxyHandler>>,
}

impl ProxyConnector {
    /// Open a TCP connection to `proxy_addr` and tunnel it to `target` via
    /// `CONNECT`, authenticating against any `Proxy-Authenticate` challenge
    /// the proxy raises along the way. Returns once the first TCP connect
    /// attempt has been kicked off; `handler` hears about the outcome
    /// later, from the loop thread.
    pub fn connect(
        loop_handle: LoopHandle,
        proxy_addr: SocketAddr,
        target: ProxyTarget,
        credentials: ProxyCredentials,
        handler: Box<dyn ProxyHandler>,
    ) -> Result<TcpSocket> {
        let connector = ProxyConnector {
            loop_handle: loop_handle.clone(),
            proxy_addr,
            target,
            credentials,
            authenticator: None,
            attempts: 0,
            max_attempts: 3,
            state: ProxyState::Idle,
            response_buf: Vec::new(),
            handler: Some(handler),
        };
        TcpSocket::connect(loop_handle, proxy_addr, TcpConfig::default(), Box::new(connector))
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    fn send_connect_request(&self, socket: &TcpSocket) -> Result<()> {
        let mut req = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
            host = self.target.host,
            port = self.target.port
        );
        if let Some(auth) = &self.authenticator {
            if auth.has_header() {
                req.push_str("Proxy-Authorization: ");
                req.push_str(&auth.auth_header());
                req.push_str("\r\n");
            }
        }
        req.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
        socket.send(req.as_bytes()).map(|_| ())
    }

    fn fail(&mut self, socket: &TcpSocket, err: Error) {
        self.state = ProxyState::Closed;
        let _ = socket.close();
        if let Some(mut handler) = self.handler.take() {
            handler.on_error(err);
        }
    }

    /// Close the current socket and reinstall a fresh `ProxyConnector`,
    /// carrying the in-progress authenticator and handler over, on a brand
    /// new TCP connection (§4.7 `need_reconnect`). If the new connect
    /// attempt itself fails synchronously, the boxed handler was already
    /// moved into it and is lost with it — a known, rare limitation rather
    /// than a double-report.
    fn reconnect(&mut self, socket: &TcpSocket) {
        let _ = socket.close();
        let next = ProxyConnector {
            loop_handle: self.loop_handle.clone(),
            proxy_addr: self.proxy_addr,
            target: self.target.clone(),
            credentials: self.credentials.clone(),
            authenticator: self.authenticator.take(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            state: ProxyState::Authenticating,
            response_buf: Vec::new(),
            handler: self.handler.take(),
        };
        let _ = TcpSocket::connect(self.loop_handle.clone(), self.proxy_addr, TcpConfig::default(), Box::new(next));
    }
}

impl TcpHandler for ProxyConnector {
    fn on_connect(&mut self, socket: &TcpSocket) {
        if self.state == ProxyState::Idle {
            self.state = ProxyState::Connecting;
        }
        if let Err(e) = self.send_connect_request(socket) {
            self.fail(socket, e);
        }
    }

    fn on_data(&mut self, socket: &TcpSocket, data: &[u8]) {
        self.response_buf.extend_from_slice(data);
        let Some(header_end) = find_header_end(&self.response_buf) else { return };
        let header_text = String::from_utf8_lossy(&self.response_buf[..header_end]).into_owned();

        let parsed = match parse_response_headers(&header_text) {
            Ok(p) => p,
            Err(e) => {
                self.fail(socket, e);
                return;
            }
        };

        match parsed.status {
            200 => {
                self.state = if self.target.use_tls { ProxyState::SslConnecting } else { ProxyState::Open };
                let mut handler = self.handler.take().unwrap_or_else(|| Box::new(NullProxyHandler) as Box<dyn ProxyHandler>);
                handler.on_tunnel_established(socket);
            }
            407 => {
                self.response_buf.clear();
                self.attempts += 1;
                if self.attempts > self.max_attempts {
                    self.fail(socket, Error::NotAuthorized);
                    return;
                }
                let Some((scheme, token)) = select_challenge(&parsed.proxy_authenticate) else {
                    self.fail(socket, Error::ProtoError("407 without a recognized Proxy-Authenticate scheme".into()));
                    return;
                };
                if self.authenticator.is_none() {
                    let Some(mut candidate) = auth::make_authenticator(&scheme) else {
                        self.fail(socket, Error::NotSupported);
                        return;
                    };
                    let request_info =
                        RequestInfo { method: "CONNECT".into(), uri: format!("{}:{}", self.target.host, self.target.port) };
                    if !candidate.init(&self.credentials, &request_info) {
                        self.fail(socket, Error::NotSupported);
                        return;
                    }
                    self.authenticator = Some(candidate);
                }
                let accepted = self.authenticator.as_mut().unwrap().next_token(token.as_deref());
                if !accepted {
                    self.fail(socket, Error::NotAuthorized);
                    return;
                }
                self.state = ProxyState::Authenticating;
                if auth::scheme_requires_reconnect(&scheme) {
                    self.reconnect(socket);
                } else if let Err(e) = self.send_connect_request(socket) {
                    self.fail(socket, e);
                }
            }
            other => {
                self.fail(socket, Error::ProtoError(format!("proxy CONNECT failed with status {other}")));
            }
        }
    }

    fn on_close(&mut self, _socket: &TcpSocket, err: Option<Error>) {
        if self.state != ProxyState::Open && self.state != ProxyState::SslConnecting {
            if let Some(mut handler) = self.handler.take() {
                handler.on_error(err.unwrap_or(Error::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_double_crlf_header_terminator() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\n"), Some(19));
        assert_eq!(find_header_end(b"HTTP/1.1 200"), None);
    }

    #[test]
    fn parses_status_and_proxy_authenticate_headers() {
        let text = "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\nProxy-Authenticate: NTLM\r\n\r\n";
        let parsed = parse_response_headers(text).unwrap();
        assert_eq!(parsed.status, 407);
        assert_eq!(parsed.proxy_authenticate.len(), 2);
    }

    #[test]
    fn select_challenge_prefers_ntlm_over_basic() {
        let challenges = vec!["Basic realm=\"x\"".to_string(), "NTLM".to_string()];
        let (scheme, token) = select_challenge(&challenges).unwrap();
        assert_eq!(scheme, "NTLM");
        assert!(token.is_none());
    }

    #[test]
    fn select_challenge_carries_the_follow_up_token() {
        let challenges = vec!["NTLM TlRMTVNTUAACAAAA".to_string()];
        let (scheme, token) = select_challenge(&challenges).unwrap();
        assert_eq!(scheme, "NTLM");
        assert_eq!(token.as_deref(), Some("TlRMTVNTUAACAAAA"));
    }

    #[test]
    fn select_challenge_none_when_nothing_recognized() {
        let challenges = vec!["Bearer".to_string()];
        assert!(select_challenge(&challenges).is_none());
    }
}
