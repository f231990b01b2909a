//! Opening handshake (RFC 6455 §1.3/§4): the `Sec-WebSocket-Key` ->
//! `Sec-WebSocket-Accept` transform and client key generation.

use base64::Engine;
use sha1::{Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` from a client-sent `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Generate a fresh 16-byte, base64-encoded `Sec-WebSocket-Key` for a client
/// opening handshake.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::Rng::fill(&mut rand::rng(), &mut raw);
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Whether an incoming request's headers (pre-lowercased keys) name an
/// upgrade-to-websocket request per RFC 6455 §4.2.1.
pub fn is_upgrade_request<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
    let mut has_upgrade = false;
    let mut has_connection = false;
    let mut has_key = false;
    let mut has_version_13 = false;
    for (name, value) in headers {
        match name.to_ascii_lowercase().as_str() {
            "upgrade" => has_upgrade = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                has_connection = value.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "upgrade")
            }
            "sec-websocket-key" => has_key = !value.is_empty(),
            "sec-websocket-version" => has_version_13 = value.trim() == "13",
            _ => {}
        }
    }
    has_upgrade && has_connection && has_key && has_version_13
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn generated_key_is_16_bytes_decoded() {
        let key = generate_key();
        let decoded = base64::engine::general_purpose::STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn recognizes_well_formed_upgrade_request() {
        let headers = vec![
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "13"),
        ];
        assert!(is_upgrade_request(headers.into_iter()));
    }

    #[test]
    fn rejects_missing_version() {
        let headers =
            vec![("Upgrade", "websocket"), ("Connection", "Upgrade"), ("Sec-WebSocket-Key", "abc==")];
        assert!(!is_upgrade_request(headers.into_iter()));
    }
}
