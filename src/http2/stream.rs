use bytes::Bytes;
use std::collections::VecDeque;

/// RFC 9113 §5.1 stream states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    ReservedLocal,
    ReservedRemote,
}

/// Per-stream bookkeeping inside a session.
///
/// Windows are signed: a SETTINGS_INITIAL_WINDOW_SIZE shrink can legally push
/// a window negative, sends resume once updates bring it back over zero.
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub send_window: i64,
    pub recv_window: i64,
    /// HEADERS seen from the peer; DATA before this is a protocol error.
    pub headers_received: bool,
    /// An established RFC 8441 CONNECT tunnel carrying websocket frames.
    pub tunnel: bool,
    /// DATA waiting for window room, flushed in FIFO order.
    pub pending: VecDeque<Bytes>,
    /// END_STREAM still owed once `pending` drains.
    pub pending_end_stream: bool,
}

impl Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: send_window as i64,
            recv_window: recv_window as i64,
            headers_received: false,
            tunnel: false,
            pending: VecDeque::new(),
            pending_end_stream: false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    /// Local endpoint finished sending.
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    /// Peer finished sending.
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn can_send_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }
}
