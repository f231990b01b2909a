//! SETTINGS frame parameters (§4.9, RFC 7540 §6.5.2).

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: super::frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    pub fn encode(&self, baseline: &Settings) -> Vec<u8> {
        let mut out = Vec::new();
        let mut push = |id: u16, value: u32, out: &mut Vec<u8>| {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        };
        if self.header_table_size != baseline.header_table_size {
            push(SETTINGS_HEADER_TABLE_SIZE, self.header_table_size, &mut out);
        }
        if self.enable_push != baseline.enable_push {
            push(SETTINGS_ENABLE_PUSH, self.enable_push as u32, &mut out);
        }
        if let Some(max) = self.max_concurrent_streams {
            push(SETTINGS_MAX_CONCURRENT_STREAMS, max, &mut out);
        }
        if self.initial_window_size != baseline.initial_window_size {
            push(SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size, &mut out);
        }
        if self.max_frame_size != baseline.max_frame_size {
            push(SETTINGS_MAX_FRAME_SIZE, self.max_frame_size, &mut out);
        }
        if let Some(max) = self.max_header_list_size {
            push(SETTINGS_MAX_HEADER_LIST_SIZE, max, &mut out);
        }
        out
    }

    /// Apply a decoded SETTINGS payload onto `self`. Returns the old
    /// `initial_window_size` so the caller can adjust every stream's send
    /// window by the delta (§4.9 SETTINGS handler).
    pub fn apply(&mut self, payload: &[u8]) -> Result<u32> {
        if payload.len() % 6 != 0 {
            return Err(Error::ProtoError("SETTINGS payload not a multiple of 6".into()));
        }
        let old_window = self.initial_window_size;
        for chunk in payload.chunks(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
                SETTINGS_ENABLE_PUSH => {
                    self.enable_push = match value {
                        0 => false,
                        1 => true,
                        _ => return Err(Error::ProtoError("invalid SETTINGS_ENABLE_PUSH value".into())),
                    }
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err(Error::ProtoError("SETTINGS_INITIAL_WINDOW_SIZE out of range".into()));
                    }
                    self.initial_window_size = value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(super::frame::DEFAULT_MAX_FRAME_SIZE..=super::frame::MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(Error::ProtoError("SETTINGS_MAX_FRAME_SIZE out of range".into()));
                    }
                    self.max_frame_size = value;
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(old_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_only_emits_changed_params() {
        let baseline = Settings::default();
        let mut changed = baseline;
        changed.initial_window_size = 1 << 20;
        let payload = changed.encode(&baseline);
        assert_eq!(payload.len(), 6);
    }

    #[test]
    fn apply_returns_previous_window_size() {
        let mut settings = Settings::default();
        let mut payload = Vec::new();
        payload.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        payload.extend_from_slice(&100_000u32.to_be_bytes());
        let old = settings.apply(&payload).unwrap();
        assert_eq!(old, 65_535);
        assert_eq!(settings.initial_window_size, 100_000);
    }

    #[test]
    fn rejects_malformed_payload_length() {
        let mut settings = Settings::default();
        assert!(settings.apply(&[1, 2, 3]).is_err());
    }
}
