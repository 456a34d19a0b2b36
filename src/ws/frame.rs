use crate::error::Error;
use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            // Unknown opcodes fail the connection with a protocol error
            _ => Err(Error::WsProtocol(CloseCode::Protocol, "unknown opcode")),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// RFC 6455 close status codes the stack works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    Protocol,
    Unsupported,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => *code,
        }
    }

    /// Builds a code from the wire. 1005 and 1006 are reserved for local use
    /// and must never travel in a close frame.
    pub fn from_u16(code: u16) -> Result<Self, Error> {
        match code {
            1000 => Ok(CloseCode::Normal),
            1001 => Ok(CloseCode::GoingAway),
            1002 => Ok(CloseCode::Protocol),
            1003 => Ok(CloseCode::Unsupported),
            1005 | 1006 => Err(Error::WsProtocol(
                CloseCode::Protocol,
                "reserved close code on the wire",
            )),
            1007 => Ok(CloseCode::InvalidPayload),
            1008 => Ok(CloseCode::PolicyViolation),
            1009 => Ok(CloseCode::MessageTooBig),
            1010 => Ok(CloseCode::MandatoryExtension),
            1011 => Ok(CloseCode::InternalError),
            code if (3000..5000).contains(&code) => Ok(CloseCode::Other(code)),
            _ => Err(Error::WsProtocol(
                CloseCode::Protocol,
                "close code outside the allowed ranges",
            )),
        }
    }
}

/// Which peer of the connection this codec sits on. Clients mask every
/// outgoing frame, servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }

    /// A close frame with the 2-byte status and UTF-8 reason in the payload.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        // Control frames carry at most 125 bytes, cut the reason down if the
        // caller got chatty
        payload.truncate(125);
        Frame::new(true, OpCode::Close, payload, false)
    }

    /// Reads the status code and reason out of a close frame payload.
    pub fn parse_close(payload: &[u8]) -> Result<(Option<CloseCode>, String), Error> {
        if payload.is_empty() {
            return Ok((None, String::new()));
        }
        if payload.len() == 1 {
            return Err(Error::WsProtocol(
                CloseCode::Protocol,
                "close payload of one byte",
            ));
        }
        let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]))?;
        let reason = String::from_utf8(payload[2..].to_vec())?;
        Ok((Some(code), reason))
    }
}

/// Frame-level codec. Decodes out of a byte buffer the caller keeps feeding,
/// encodes with the masking rules of the configured [`Role`].
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_payload_size: usize,
    /// RSV1 is only legal once permessage compression was negotiated.
    pub allow_rsv1: bool,
}

impl FrameCodec {
    pub fn new(role: Role, max_payload_size: usize, allow_rsv1: bool) -> Self {
        Self {
            role,
            max_payload_size,
            allow_rsv1,
        }
    }

    /// Tries to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when fewer bytes than the declared header+payload
    /// are present; the caller reads more and calls again. On success the
    /// consumed bytes are drained from `src` and the payload comes back
    /// unmasked.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        // The first bit in the first byte in the frame tells us whether the
        // current frame is the final fragment of a message
        let final_fragment = (src[0] & 0b10000000) != 0;
        let opcode = OpCode::from(src[0] & 0b00001111)?;

        // RSV bits are only used by negotiated extensions. RSV1 signals
        // per-message compression; RSV2/RSV3 have no negotiable meaning here
        // and always fail the connection when set.
        let rsv1 = (src[0] & 0b01000000) != 0;
        let rsv2 = (src[0] & 0b00100000) != 0;
        let rsv3 = (src[0] & 0b00010000) != 0;

        if rsv2 || rsv3 {
            return Err(Error::WsProtocol(CloseCode::Protocol, "RSV2/RSV3 set"));
        }
        if rsv1 && !self.allow_rsv1 {
            return Err(Error::WsProtocol(
                CloseCode::Protocol,
                "RSV1 set without a negotiated extension",
            ));
        }
        if rsv1 && opcode.is_control() {
            return Err(Error::WsProtocol(
                CloseCode::Protocol,
                "RSV1 on a control frame",
            ));
        }

        // As a rule in websockets protocol, if your opcode is a control
        // opcode (ping, pong, close), your message can't be fragmented
        if !final_fragment && opcode.is_control() {
            return Err(Error::WsProtocol(
                CloseCode::Protocol,
                "fragmented control frame",
            ));
        }

        let masked = (src[1] & 0b10000000) != 0;
        let mut length = (src[1] & 0b01111111) as usize;

        // Control frames are only allowed to have a payload up to and
        // including 125 octets
        if length > 125 && opcode.is_control() {
            return Err(Error::WsProtocol(
                CloseCode::Protocol,
                "control frame payload above 125 bytes",
            ));
        }

        // Frames sent from client to server must be masked, frames from
        // server to client must not
        match self.role {
            Role::Client if masked => {
                return Err(Error::WsProtocol(
                    CloseCode::Protocol,
                    "masked frame from a server",
                ));
            }
            Role::Server if !masked => {
                return Err(Error::WsProtocol(
                    CloseCode::Protocol,
                    "unmasked frame from a client",
                ));
            }
            _ => {}
        }

        let mut offset = 2;
        if length == 126 {
            if src.len() < offset + 2 {
                return Ok(None);
            }
            length = u16::from_be_bytes([src[2], src[3]]) as usize;
            offset += 2;
        } else if length == 127 {
            if src.len() < offset + 8 {
                return Ok(None);
            }
            let mut be_bytes = [0u8; 8];
            be_bytes.copy_from_slice(&src[2..10]);
            let wide = u64::from_be_bytes(be_bytes);
            if wide > self.max_payload_size as u64 {
                return Err(Error::WsProtocol(
                    CloseCode::MessageTooBig,
                    "declared payload above the configured maximum",
                ));
            }
            length = wide as usize;
            offset += 8;
        }

        if length > self.max_payload_size {
            return Err(Error::WsProtocol(
                CloseCode::MessageTooBig,
                "declared payload above the configured maximum",
            ));
        }

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let mut mask = [0u8; 4];
            mask.copy_from_slice(&src[offset..offset + 4]);
            offset += 4;
            Some(mask)
        } else {
            None
        };

        if src.len() < offset + length {
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(length).to_vec();

        // The mask is applied with a bitwise XOR, each payload byte against
        // the corresponding byte (modulo 4) of the masking key
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Some(Frame {
            final_fragment,
            opcode,
            payload,
            compressed: rsv1,
        }))
    }

    /// Serializes one frame into `dst`. `set_rsv1` marks the initial frame of
    /// a compressed message.
    pub fn encode(&self, frame: &Frame, set_rsv1: bool, dst: &mut BytesMut) {
        // The first byte carries the final fragment bit, the RSV bits and the
        // opcode: (fin << 7) | rsv1 | opcode
        let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
        if set_rsv1 {
            first_byte |= 0x40;
        }
        dst.put_u8(first_byte);

        let payload_len = frame.payload.len();
        let mask_bit = match self.role {
            Role::Client => 0b1000_0000,
            Role::Server => 0,
        };

        // Payload length uses the 7-bit short form up to 125 bytes, then the
        // 16-bit form up to 65535, then the full 64-bit form
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        match self.role {
            Role::Server => dst.put_slice(&frame.payload),
            Role::Client => {
                // Every client frame gets a fresh random 32-bit masking key
                let mut rng = StdRng::from_entropy();
                let mask: [u8; 4] = rng.gen();
                dst.put_slice(&mask);
                for (i, &byte) in frame.payload.iter().enumerate() {
                    dst.put_u8(byte ^ mask[i % 4]);
                }
            }
        }
    }
}
