use crate::compression::MessageDeflate;
use crate::crypto::PayloadCrypto;
use crate::error::Error;
use crate::ws::frame::{CloseCode, Frame, FrameCodec, OpCode, Role};
use crate::ws::handshake::Negotiated;
use crate::ws::Message;
use bytes::BytesMut;
use log::trace;

/// Events the pipeline hands to the connection layer once whole frames (and
/// whole messages) come out of the byte stream.
#[derive(Debug)]
pub enum WsEvent {
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseCode>, String),
}

#[derive(Clone)]
struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    compressed: bool,
}

/// Frame-to-message state machine for one connection direction pair.
///
/// Feeds on raw bytes, yields [`WsEvent`]s; encodes outgoing messages with
/// fragmentation, payload encryption and per-message compression. All
/// ordering rules of RFC 6455 (continuation discipline, control frame
/// interleave, close echo) live here. Crypto runs before compression on the
/// way out and after decompression on the way in; the cipher hint travels
/// in-band as the first payload byte of a tagged message.
pub struct MessagePipeline {
    codec: FrameCodec,
    deflate: Option<MessageDeflate>,
    crypto: Option<PayloadCrypto>,
    fragmented_message: Option<FragmentedMessage>,
    segment_size: usize,
    max_message_size: usize,
    close_sent: bool,
    close_received: bool,
}

impl MessagePipeline {
    pub fn new(
        role: Role,
        negotiated: &Negotiated,
        segment_size: usize,
        max_message_size: usize,
        crypto: Option<PayloadCrypto>,
    ) -> Self {
        let deflate = negotiated
            .extensions
            .as_ref()
            .filter(|extensions| extensions.permessage_deflate)
            .map(|extensions| MessageDeflate::new(extensions, role == Role::Client));
        Self {
            codec: FrameCodec::new(role, max_message_size, deflate.is_some()),
            deflate,
            crypto,
            fragmented_message: None,
            segment_size,
            max_message_size,
            close_sent: false,
            close_received: false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close_sent || self.close_received
    }

    /// Decodes every complete frame sitting in `buf` and appends the
    /// resulting events to `out`. Partial trailing frames stay in the buffer.
    pub fn feed(&mut self, buf: &mut BytesMut, out: &mut Vec<WsEvent>) -> Result<(), Error> {
        while let Some(frame) = self.codec.decode(buf)? {
            if let Some(event) = self.handle_frame(frame)? {
                out.push(event);
            }
            if self.close_received {
                break;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<WsEvent>, Error> {
        match frame.opcode {
            // An initial data frame with FIN=0 starts a fragmented message;
            // starting another while one is being assembled is a violation
            OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                if self.fragmented_message.is_some() {
                    return Err(Error::WsProtocol(
                        CloseCode::Protocol,
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                self.fragmented_message = Some(FragmentedMessage {
                    op_code: frame.opcode,
                    fragments: frame.payload,
                    compressed: frame.compressed,
                });
                Ok(None)
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragmented_message.is_some() {
                    return Err(Error::WsProtocol(
                        CloseCode::Protocol,
                        "unfragmented data frame inside a fragmented message",
                    ));
                }
                self.finish_message(frame.opcode, frame.payload, frame.compressed)
                    .map(Some)
            }
            // Continuation frames only ever follow an initial data frame
            OpCode::Continue => {
                let Some(fragmented) = self.fragmented_message.as_mut() else {
                    return Err(Error::WsProtocol(
                        CloseCode::Protocol,
                        "continuation without a message to continue",
                    ));
                };
                if frame.compressed {
                    return Err(Error::WsProtocol(
                        CloseCode::Protocol,
                        "RSV1 on a continuation frame",
                    ));
                }
                fragmented.fragments.extend_from_slice(&frame.payload);
                if fragmented.fragments.len() > self.max_message_size {
                    return Err(Error::WsProtocol(
                        CloseCode::MessageTooBig,
                        "reassembled message above the configured maximum",
                    ));
                }
                if frame.final_fragment {
                    let Some(fragmented) = self.fragmented_message.take() else {
                        return Ok(None);
                    };
                    self.finish_message(
                        fragmented.op_code,
                        fragmented.fragments,
                        fragmented.compressed,
                    )
                    .map(Some)
                } else {
                    Ok(None)
                }
            }
            OpCode::Close => {
                self.close_received = true;
                let (code, reason) = Frame::parse_close(&frame.payload)?;
                trace!("close frame received: {:?} {:?}", code, reason);
                Ok(Some(WsEvent::Close(code, reason)))
            }
            OpCode::Ping => Ok(Some(WsEvent::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(WsEvent::Pong(frame.payload))),
        }
    }

    fn finish_message(
        &mut self,
        op_code: OpCode,
        mut payload: Vec<u8>,
        compressed: bool,
    ) -> Result<WsEvent, Error> {
        if compressed {
            let Some(deflate) = self.deflate.as_mut() else {
                return Err(Error::WsProtocol(
                    CloseCode::Protocol,
                    "compressed frame without a negotiated extension",
                ));
            };
            payload = deflate.decoder.decompress(&payload, self.max_message_size)?;
        }
        // decryption runs after decompression; an untagged payload stays
        // as-is
        if let Some(crypto) = &self.crypto {
            payload = crypto.open_ws(&payload)?;
        }
        match op_code {
            // The text opcode MUST carry valid UTF-8
            OpCode::Text => Ok(WsEvent::Message(Message::Text(String::from_utf8(payload)?))),
            OpCode::Binary => Ok(WsEvent::Message(Message::Binary(payload))),
            _ => unreachable!("finish_message only sees data opcodes"),
        }
    }

    /// Serializes a user message, compressing and fragmenting as negotiated.
    /// Rejected once a close frame went out.
    pub fn encode_message(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Error> {
        if self.close_sent {
            return Err(Error::WsClosing);
        }
        let opcode = match &message {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        };
        let mut payload = message.into_payload();
        if payload.len() > self.max_message_size {
            return Err(Error::WsProtocol(
                CloseCode::MessageTooBig,
                "outgoing message above the configured maximum",
            ));
        }

        // encryption first, compression second; empty payloads skip both
        if let Some(crypto) = &self.crypto {
            if !payload.is_empty() {
                payload = crypto.seal_ws(&payload);
            }
        }
        let (payload, compressed) = match (&mut self.deflate, payload.is_empty()) {
            (Some(deflate), false) => {
                let squeezed = deflate.encoder.compress(&payload)?;
                // If compression expanded the message, send it plain
                if squeezed.len() < payload.len() {
                    (squeezed, true)
                } else {
                    (payload, false)
                }
            }
            _ => (payload, false),
        };

        // RSV1 only marks the initial frame of a compressed message
        let mut set_rsv1 = compressed;
        if payload.len() <= self.segment_size {
            self.codec
                .encode(&Frame::new(true, opcode, payload, compressed), set_rsv1, dst);
            return Ok(());
        }

        let chunks: Vec<&[u8]> = payload.chunks(self.segment_size).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let frame_opcode = if i == 0 { opcode } else { OpCode::Continue };
            let frame = Frame::new(i == last, frame_opcode, chunk.to_vec(), compressed && i == 0);
            self.codec.encode(&frame, set_rsv1, dst);
            set_rsv1 = false;
        }
        Ok(())
    }

    /// Sends a close frame once; repeated calls are no-ops so the echo path
    /// and the user path cannot double-close.
    pub fn encode_close(
        &mut self,
        code: CloseCode,
        reason: &str,
        dst: &mut BytesMut,
    ) -> Result<(), Error> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.codec.encode(&Frame::close(code, reason), false, dst);
        Ok(())
    }

    pub fn encode_ping(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<(), Error> {
        if self.close_sent {
            return Err(Error::WsClosing);
        }
        self.codec
            .encode(&Frame::new(true, OpCode::Ping, payload, false), false, dst);
        Ok(())
    }

    pub fn encode_pong(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<(), Error> {
        if self.close_sent {
            return Err(Error::WsClosing);
        }
        self.codec
            .encode(&Frame::new(true, OpCode::Pong, payload, false), false, dst);
        Ok(())
    }
}
