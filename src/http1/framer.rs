//! Outgoing message framer (§4.8), grounded on `rouille`'s
//! `write_status_and_headers` (status line + reason phrase table + header
//! write loop) but generalized to also frame requests and to support
//! chunked transfer-encoding, which the grounding file defers with a
//! `TODO: don't unwrap body_size`.

use crate::error::{Error, Result};
use crate::http1::message::{Header, Method, Version};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BodyEncoding {
    FixedLength,
    Chunked,
}

/// Builds a request or response, either as one shot (`Content-Length` known
/// up front) or streamed (`start_chunked` + repeated `send_data`).
pub struct OutgoingMessage {
    out: Vec<u8>,
    encoding: Option<BodyEncoding>,
    headers_written: bool,
}

impl OutgoingMessage {
    pub fn request(method: Method, raw_method: &str, target: &str, version: Version) -> OutgoingMessage {
        let mut out = Vec::new();
        let method_token = if method == Method::Other { raw_method } else { method.as_str() };
        out.extend_from_slice(method_token.as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.push(b' ');
        write_version(&mut out, version);
        out.extend_from_slice(b"\r\n");
        OutgoingMessage { out, encoding: None, headers_written: false }
    }

    pub fn response(version: Version, status: u16, reason: Option<&str>) -> OutgoingMessage {
        let mut out = Vec::new();
        write_version(&mut out, version);
        out.push(b' ');
        out.extend_from_slice(status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason.unwrap_or_else(|| reason_phrase(status)).as_bytes());
        out.extend_from_slice(b"\r\n");
        OutgoingMessage { out, encoding: None, headers_written: false }
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.out.extend_from_slice(name.as_bytes());
        self.out.extend_from_slice(b": ");
        self.out.extend_from_slice(value.as_bytes());
        self.out.extend_from_slice(b"\r\n");
        self
    }

    pub fn headers(&mut self, headers: &[Header]) -> &mut Self {
        for h in headers {
            self.header(&h.name, &h.value);
        }
        self
    }

    /// Finish headers with a known `Content-Length` and return the framer
    /// ready for exactly that many bytes of body via [`OutgoingMessage::send_data`].
    pub fn finish_headers_fixed_length(&mut self, content_length: usize) {
        self.header("Content-Length", &content_length.to_string());
        self.out.extend_from_slice(b"\r\n");
        self.encoding = Some(BodyEncoding::FixedLength);
        self.headers_written = true;
    }

    /// Finish headers announcing `Transfer-Encoding: chunked`.
    pub fn finish_headers_chunked(&mut self) {
        self.header("Transfer-Encoding", "chunked");
        self.out.extend_from_slice(b"\r\n");
        self.encoding = Some(BodyEncoding::Chunked);
        self.headers_written = true;
    }

    /// Finish headers with no body at all (e.g. a 204, or a HEAD response).
    pub fn finish_headers_no_body(&mut self) {
        self.out.extend_from_slice(b"\r\n");
        self.headers_written = true;
    }

    /// Append body bytes. For chunked encoding, call with an empty slice to
    /// mark completion (`send_data(&[])`), which emits the terminating
    /// `0\r\n\r\n`.
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if !self.headers_written {
            return Err(Error::InvalidState);
        }
        match self.encoding {
            Some(BodyEncoding::FixedLength) => {
                self.out.extend_from_slice(data);
                Ok(())
            }
            Some(BodyEncoding::Chunked) => {
                if data.is_empty() {
                    self.out.extend_from_slice(b"0\r\n\r\n");
                } else {
                    self.out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    self.out.extend_from_slice(data);
                    self.out.extend_from_slice(b"\r\n");
                }
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

fn write_version(out: &mut Vec<u8>, version: Version) {
    out.extend_from_slice(format!("HTTP/{}.{}", version.major, version.minor).as_bytes());
}

/// Reason phrase table, carried over verbatim from the grounding file's
/// `default_reason_phrase`.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_fixed_length_response() {
        let mut msg = OutgoingMessage::response(Version::HTTP_11, 200, None);
        msg.header("Content-Type", "text/plain");
        msg.finish_headers_fixed_length(5);
        msg.send_data(b"hello").unwrap();
        let bytes = msg.into_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn frames_chunked_body_with_terminator() {
        let mut msg = OutgoingMessage::response(Version::HTTP_11, 200, None);
        msg.finish_headers_chunked();
        msg.send_data(b"Wiki").unwrap();
        msg.send_data(&[]).unwrap();
        let text = String::from_utf8(msg.into_bytes()).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("4\r\nWiki\r\n0\r\n\r\n"));
    }

    #[test]
    fn frames_get_request() {
        let msg = OutgoingMessage::request(Method::Get, "GET", "/index.html", Version::HTTP_11);
        let text = String::from_utf8(msg.into_bytes()).unwrap();
        assert_eq!(text, "GET /index.html HTTP/1.1\r\n");
    }
}
