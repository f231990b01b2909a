//! Message types shared by the parser and the outgoing framer.

use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other,
}

impl Method {
    pub fn parse(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other => "GET",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    pub fn parse(token: &str) -> Result<Version> {
        let rest = token.strip_prefix("HTTP/").ok_or_else(|| Error::InvalidProto("missing HTTP version".into()))?;
        let (major, minor) = rest.split_once('.').ok_or_else(|| Error::InvalidProto("malformed HTTP version".into()))?;
        let major = major.parse().map_err(|_| Error::InvalidProto("non-numeric HTTP major version".into()))?;
        let minor = minor.parse().map_err(|_| Error::InvalidProto("non-numeric HTTP minor version".into()))?;
        Ok(Version { major, minor })
    }
}

#[derive(Clone, Debug)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Header {
        Header { name: name.into(), value: value.into() }
    }
}

/// A parsed request or response start-line plus headers and query map.
#[derive(Clone, Debug)]
pub enum StartLine {
    Request { method: Method, raw_method: String, path: String, query: HashMap<String, String>, version: Version },
    Response { version: Version, status: u16, reason: String },
}

/// Percent-decode a path/query component per RFC 3986 §2.1.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok().and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `GET /path?a=1&b=2` into `(decoded path, query map)`.
pub fn split_path_and_query(raw: &str) -> (String, HashMap<String, String>) {
    let mut query = HashMap::new();
    let (path, qs) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    if let Some(qs) = qs {
        for pair in qs.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(percent_decode(k), percent_decode(v));
        }
    }
    (percent_decode(path), query)
}

/// Whether headers name an upgrade request/response (case-insensitive,
/// comma-list `Connection` match per §4.8).
pub fn is_upgrade(headers: &[Header]) -> Option<String> {
    let mut upgrade_token = None;
    let mut has_connection_upgrade = false;
    for h in headers {
        if h.name.eq_ignore_ascii_case("upgrade") {
            upgrade_token = Some(h.value.trim().to_string());
        } else if h.name.eq_ignore_ascii_case("connection") {
            has_connection_upgrade = h.value.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "upgrade");
        }
    }
    if has_connection_upgrade { upgrade_token } else { None }
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_handles_escapes_and_plus() {
        assert_eq!(percent_decode("a%20b+c%2Fd"), "a b c/d");
    }

    #[test]
    fn split_path_and_query_extracts_map() {
        let (path, query) = split_path_and_query("/search?q=rust%20lang&page=2");
        assert_eq!(path, "/search");
        assert_eq!(query.get("q").unwrap(), "rust lang");
        assert_eq!(query.get("page").unwrap(), "2");
    }

    #[test]
    fn is_upgrade_requires_both_headers() {
        let headers = vec![Header::new("Upgrade", "websocket"), Header::new("Connection", "keep-alive, Upgrade")];
        assert_eq!(is_upgrade(&headers).as_deref(), Some("websocket"));

        let headers = vec![Header::new("Upgrade", "websocket")];
        assert_eq!(is_upgrade(&headers), None);
    }
}
