use crate::error::Error;
use crate::http2::Http2ErrorCode;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size: Length(24) Type(8) Flags(8) R(1) StreamId(31).
pub const FRAME_HEADER_SIZE: usize = 9;

/// The 24-byte client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame types the engine understands, including the two extension frames
/// from RFC 7838 (ALTSVC) and RFC 8336 (ORIGIN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Altsvc,
    Origin,
    /// Anything else; ignored per RFC 9113 §4.1.
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            0xa => FrameType::Altsvc,
            0xc => FrameType::Origin,
            other => FrameType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Altsvc => 0xa,
            FrameType::Origin => 0xc,
            FrameType::Unknown(other) => *other,
        }
    }
}

/// Well-known frame flag bits.
pub mod flags {
    /// DATA / HEADERS: end of stream.
    pub const END_STREAM: u8 = 0x01;
    /// SETTINGS / PING: acknowledgement.
    pub const ACK: u8 = 0x01;
    /// HEADERS / PUSH_PROMISE / CONTINUATION: end of header block.
    pub const END_HEADERS: u8 = 0x04;
    /// DATA / HEADERS / PUSH_PROMISE: payload is padded.
    pub const PADDED: u8 = 0x08;
    /// HEADERS: priority information present.
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, flags: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Tries to read one frame off the buffer. `max_frame_size` is the local
    /// SETTINGS_MAX_FRAME_SIZE; a longer frame is a connection error.
    pub fn decode(src: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, src[0], src[1], src[2]]) as usize;
        if length > max_frame_size as usize {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "frame above SETTINGS_MAX_FRAME_SIZE",
            ));
        }
        if src.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }
        let kind = FrameType::from_u8(src[3]);
        let frame_flags = src[4];
        // the high bit of the stream id is reserved and ignored on receipt
        let stream_id =
            u32::from_be_bytes([src[5] & 0x7f, src[6], src[7], src[8]]);
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            kind,
            flags: frame_flags,
            stream_id,
            payload,
        }))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let length = self.payload.len() as u32;
        dst.put_u8((length >> 16) as u8);
        dst.put_u8((length >> 8) as u8);
        dst.put_u8(length as u8);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
        dst.put_slice(&self.payload);
    }

    /// Strips padding from DATA / HEADERS payloads carrying the PADDED flag.
    pub fn unpad(&self) -> Result<Bytes, Error> {
        if !self.has_flag(flags::PADDED) {
            return Ok(self.payload.clone());
        }
        if self.payload.is_empty() {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "PADDED frame without a pad length",
            ));
        }
        let pad = self.payload[0] as usize;
        if pad + 1 > self.payload.len() {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "padding longer than the payload",
            ));
        }
        Ok(self.payload.slice(1..self.payload.len() - pad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let frame = Frame::new(
            FrameType::Headers,
            flags::END_HEADERS | flags::END_STREAM,
            1,
            Bytes::from_static(b"block"),
        );
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        assert_eq!(wire.len(), FRAME_HEADER_SIZE + 5);
        let decoded = Frame::decode(&mut wire, 16_384).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameType::Headers);
        assert!(decoded.has_flag(flags::END_HEADERS));
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(&decoded.payload[..], b"block");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = Frame::new(FrameType::Data, 0, 3, Bytes::from_static(b"abcd"));
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(Frame::decode(&mut partial, 16_384).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = Frame::new(FrameType::Data, 0, 1, Bytes::from(vec![0u8; 100]));
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        assert!(matches!(
            Frame::decode(&mut wire, 50),
            Err(Error::Http2Connection(Http2ErrorCode::FrameSizeError, _))
        ));
    }

    #[test]
    fn test_reserved_bit_masked() {
        let frame = Frame::new(FrameType::Ping, 0, 0x8000_0001, Bytes::new());
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        let decoded = Frame::decode(&mut wire, 16_384).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 1);
    }

    #[test]
    fn test_unpad() {
        // pad length 3, payload "ab", then 3 pad bytes
        let frame = Frame::new(
            FrameType::Data,
            flags::PADDED,
            1,
            Bytes::from_static(&[3, b'a', b'b', 0, 0, 0]),
        );
        assert_eq!(&frame.unpad().unwrap()[..], b"ab");
        let bad = Frame::new(FrameType::Data, flags::PADDED, 1, Bytes::from_static(&[9, 1]));
        assert!(bad.unpad().is_err());
    }

    #[test]
    fn test_unknown_frame_type_carried() {
        let decoded = FrameType::from_u8(0x42);
        assert_eq!(decoded, FrameType::Unknown(0x42));
        assert_eq!(decoded.as_u8(), 0x42);
    }
}
