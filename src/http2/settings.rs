use crate::config::Http2Settings;
use crate::error::Error;
use crate::http2::Http2ErrorCode;
use bytes::{BufMut, Bytes, BytesMut};

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Flow-control ceiling, 2^31 - 1.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Applies one `(identifier, value)` pair onto a settings block, enforcing
/// the RFC 9113 §6.5.2 validity rules. Unknown identifiers are ignored.
pub fn apply(settings: &mut Http2Settings, id: u16, value: u32) -> Result<(), Error> {
    match id {
        SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = value,
        SETTINGS_ENABLE_PUSH => match value {
            0 => settings.enable_push = false,
            1 => settings.enable_push = true,
            _ => {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "ENABLE_PUSH outside {0, 1}",
                ))
            }
        },
        SETTINGS_MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = value,
        SETTINGS_INITIAL_WINDOW_SIZE => {
            if value > MAX_WINDOW_SIZE {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::FlowControlError,
                    "INITIAL_WINDOW_SIZE above 2^31-1",
                ));
            }
            settings.initial_window_size = value;
        }
        SETTINGS_MAX_FRAME_SIZE => {
            if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "MAX_FRAME_SIZE outside [16384, 16777215]",
                ));
            }
            settings.max_frame_size = value;
        }
        SETTINGS_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = value,
        _ => {}
    }
    Ok(())
}

/// Parses a whole SETTINGS payload into an existing block.
pub fn decode(settings: &mut Http2Settings, payload: &[u8]) -> Result<(), Error> {
    if payload.len() % 6 != 0 {
        return Err(Error::Http2Connection(
            Http2ErrorCode::FrameSizeError,
            "SETTINGS payload not a multiple of 6",
        ));
    }
    for entry in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([entry[0], entry[1]]);
        let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
        apply(settings, id, value)?;
    }
    Ok(())
}

/// Serializes the block for the local SETTINGS announcement.
pub fn encode(settings: &Http2Settings) -> Bytes {
    let mut payload = BytesMut::with_capacity(6 * 6);
    let mut put = |id: u16, value: u32| {
        payload.put_u16(id);
        payload.put_u32(value);
    };
    put(SETTINGS_HEADER_TABLE_SIZE, settings.header_table_size);
    put(SETTINGS_ENABLE_PUSH, settings.enable_push as u32);
    put(
        SETTINGS_MAX_CONCURRENT_STREAMS,
        settings.max_concurrent_streams,
    );
    put(SETTINGS_INITIAL_WINDOW_SIZE, settings.initial_window_size);
    put(SETTINGS_MAX_FRAME_SIZE, settings.max_frame_size);
    put(SETTINGS_MAX_HEADER_LIST_SIZE, settings.max_header_list_size);
    payload.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut settings = Http2Settings::default();
        settings.max_concurrent_streams = 7;
        settings.initial_window_size = 1234;
        let wire = encode(&settings);
        let mut decoded = Http2Settings::default();
        decode(&mut decoded, &wire).unwrap();
        assert_eq!(decoded.max_concurrent_streams, 7);
        assert_eq!(decoded.initial_window_size, 1234);
        assert!(!decoded.enable_push);
    }

    #[test]
    fn test_window_size_ceiling() {
        let mut settings = Http2Settings::default();
        assert!(matches!(
            apply(&mut settings, SETTINGS_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE + 1),
            Err(Error::Http2Connection(Http2ErrorCode::FlowControlError, _))
        ));
        apply(&mut settings, SETTINGS_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE).unwrap();
    }

    #[test]
    fn test_max_frame_size_bounds() {
        let mut settings = Http2Settings::default();
        assert!(apply(&mut settings, SETTINGS_MAX_FRAME_SIZE, 16_383).is_err());
        assert!(apply(&mut settings, SETTINGS_MAX_FRAME_SIZE, 16_777_216).is_err());
        apply(&mut settings, SETTINGS_MAX_FRAME_SIZE, 65_536).unwrap();
        assert_eq!(settings.max_frame_size, 65_536);
    }

    #[test]
    fn test_enable_push_values() {
        let mut settings = Http2Settings::default();
        apply(&mut settings, SETTINGS_ENABLE_PUSH, 1).unwrap();
        assert!(settings.enable_push);
        assert!(apply(&mut settings, SETTINGS_ENABLE_PUSH, 2).is_err());
    }

    #[test]
    fn test_unknown_setting_ignored() {
        let mut settings = Http2Settings::default();
        apply(&mut settings, 0xff, 42).unwrap();
    }

    #[test]
    fn test_truncated_payload() {
        let mut settings = Http2Settings::default();
        assert!(decode(&mut settings, &[0, 1, 0]).is_err());
    }
}
