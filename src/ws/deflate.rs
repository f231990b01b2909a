//! `permessage-deflate` (RFC 7692), layered on top of [`super::frame`] as a
//! message transform rather than folded into the frame codec itself — the
//! fastwebsockets module split keeps `frame`/`mask` free of extension
//! concerns and we follow that, since the crate those files belong to
//! doesn't implement this extension (its own doc comment says so) and this
//! module is authored directly against `flate2`'s raw-deflate streaming API
//! instead of being lifted from a grounding file.

use crate::error::{Error, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// The four bytes RFC 7692 §7.2.1 says to strip from a compressor's tail
/// (an empty stored DEFLATE block) before framing, and to re-append before
/// handing the bytes back to the inflater.
const TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Clone, Copy, Debug, Default)]
pub struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl DeflateConfig {
    /// Render as a `Sec-WebSocket-Extensions` offer/response parameter list.
    pub fn to_extension_params(&self) -> String {
        let mut parts = vec!["permessage-deflate".to_string()];
        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if let Some(bits) = self.server_max_window_bits {
            parts.push(format!("server_max_window_bits={bits}"));
        }
        if let Some(bits) = self.client_max_window_bits {
            parts.push(format!("client_max_window_bits={bits}"));
        }
        parts.join("; ")
    }
}

/// Per-direction codec state. One side deflates outgoing message payloads,
/// the other inflates incoming ones; a full-duplex connection holds one of
/// each.
pub struct Deflater {
    compress: Compress,
    no_context_takeover: bool,
}

impl Deflater {
    pub fn new(no_context_takeover: bool) -> Deflater {
        Deflater { compress: Compress::new(Compression::default(), false), no_context_takeover }
    }

    /// Compress one whole message payload, stripping the RFC 7692 tail.
    pub fn compress_message(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 16);
        let mut chunk = [0u8; 8192];

        let base_in = self.compress.total_in();
        let mut consumed = 0usize;
        while consumed < input.len() {
            let before_out = self.compress.total_out();
            self.compress
                .compress(&input[consumed..], &mut chunk, FlushCompress::None)
                .map_err(|e| Error::ProtoError(format!("deflate compress failed: {e}")))?;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            consumed = (self.compress.total_in() - base_in) as usize;
        }

        loop {
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(&[], &mut chunk, FlushCompress::Sync)
                .map_err(|e| Error::ProtoError(format!("deflate flush failed: {e}")))?;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if status == Status::StreamEnd || produced == 0 {
                break;
            }
        }

        if out.ends_with(&TAIL) {
            out.truncate(out.len() - TAIL.len());
        }
        if self.no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }
}

pub struct Inflater {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl Inflater {
    pub fn new(no_context_takeover: bool) -> Inflater {
        Inflater { decompress: Decompress::new(false), no_context_takeover }
    }

    /// Decompress one whole message payload. `input` must already have the
    /// RFC 7692 tail re-appended by the caller before this is called.
    pub fn decompress_message(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut with_tail = Vec::with_capacity(input.len() + TAIL.len());
        with_tail.extend_from_slice(input);
        with_tail.extend_from_slice(&TAIL);

        let mut out = Vec::with_capacity(input.len() * 3 + 16);
        let mut chunk = [0u8; 8192];
        let base_in = self.decompress.total_in();
        loop {
            let consumed = (self.decompress.total_in() - base_in) as usize;
            let before_out = self.decompress.total_out();
            if consumed >= with_tail.len() {
                break;
            }
            let status = self
                .decompress
                .decompress(&with_tail[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| Error::ProtoError(format!("inflate decompress failed: {e}")))?;
            let produced = (self.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if status == Status::StreamEnd {
                break;
            }
            if produced == 0 && (self.decompress.total_in() - base_in) as usize == consumed {
                return Err(Error::ProtoError("inflate made no progress".into()));
            }
        }
        if self.no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_and_decompresses_round_trip() {
        let mut deflater = Deflater::new(false);
        let mut inflater = Inflater::new(false);
        let message = b"the quick brown fox jumps over the lazy dog, repeatedly, repeatedly, repeatedly";
        let compressed = deflater.compress_message(message).unwrap();
        assert!(compressed.len() < message.len());
        let restored = inflater.decompress_message(&compressed).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn no_context_takeover_resets_state_between_messages() {
        let mut deflater = Deflater::new(true);
        let a = deflater.compress_message(b"hello world").unwrap();
        let b = deflater.compress_message(b"hello world").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn extension_params_render_requested_options() {
        let config = DeflateConfig { server_no_context_takeover: true, client_max_window_bits: Some(10), ..Default::default() };
        let rendered = config.to_extension_params();
        assert!(rendered.contains("server_no_context_takeover"));
        assert!(rendered.contains("client_max_window_bits=10"));
    }
}
