pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod pipeline;

use crate::error::Error;
use frame::{Frame, OpCode};

/// A complete, reassembled application message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a data frame into a Message variant
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            _ => Err(Error::WsProtocol(
                frame::CloseCode::Protocol,
                "control frame where a data frame was expected",
            )),
        }
    }

    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_binary().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_binary().is_empty()
    }
}
