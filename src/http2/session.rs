use crate::config::Http2Settings;
use crate::error::Error;
use crate::http2::frame::{flags, Frame, FrameType, CONNECTION_PREFACE};
use crate::http2::hpack::{HpackDecoder, HpackEncoder};
use crate::http2::settings;
use crate::http2::stream::{Stream, StreamState};
use crate::http2::Http2ErrorCode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::HashMap;

/// Events a session yields while digesting incoming bytes.
#[derive(Debug)]
pub enum Http2Event {
    /// A complete header block for a stream (request or response side).
    Headers {
        stream_id: u32,
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    StreamReset {
        stream_id: u32,
        code: Http2ErrorCode,
    },
    /// The peer's SETTINGS landed and were applied.
    RemoteSettings(Http2Settings),
    SettingsAck,
    Ping {
        payload: [u8; 8],
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        code: Http2ErrorCode,
        debug: String,
    },
    Altsvc {
        origin: String,
        value: String,
    },
    Origin(Vec<String>),
    /// An RFC 8441 extended CONNECT answered with `:status: 200`.
    TunnelEstablished {
        stream_id: u32,
    },
}

// In-flight HEADERS waiting for its CONTINUATION frames.
struct ContinuationState {
    stream_id: u32,
    end_stream: bool,
    fragment: BytesMut,
    /// A promised stream id to refuse once the block completes.
    refuse_promise: Option<u32>,
}

/// One HTTP/2 connection: the session state machine plus one state machine
/// per open stream.
///
/// The session is sans-io: `feed` consumes incoming bytes and produces
/// events, outgoing frames accumulate in an internal buffer the driver
/// drains with [`Http2Session::take_output`].
pub struct Http2Session {
    is_client: bool,
    local_settings: Http2Settings,
    remote_settings: Http2Settings,
    encoder: HpackEncoder,
    decoder: HpackDecoder,
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    highest_peer_stream: u32,
    conn_send_window: i64,
    conn_recv_window: i64,
    preface_pending: bool,
    continuation: Option<ContinuationState>,
    goaway_sent: Option<u32>,
    goaway_received: Option<u32>,
    out: BytesMut,
}

impl Http2Session {
    pub fn new(is_client: bool, local_settings: Http2Settings) -> Self {
        let remote_settings = Http2Settings::default();
        Self {
            is_client,
            encoder: HpackEncoder::new(remote_settings.header_table_size as usize),
            decoder: HpackDecoder::new(
                local_settings.header_table_size as usize,
                local_settings.max_header_list_size as usize,
            ),
            local_settings,
            remote_settings,
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            highest_peer_stream: 0,
            conn_send_window: 65_535,
            conn_recv_window: 65_535,
            preface_pending: true,
            continuation: None,
            goaway_sent: None,
            goaway_received: None,
            out: BytesMut::new(),
        }
    }

    /// Client: emits the 24-byte preface plus the local SETTINGS. Server:
    /// emits SETTINGS only and starts waiting for the peer's preface.
    pub fn start(&mut self) {
        if self.is_client {
            self.out.put_slice(CONNECTION_PREFACE);
            self.preface_pending = false;
        }
        let payload = settings::encode(&self.local_settings);
        Frame::new(FrameType::Settings, 0, 0, payload).encode(&mut self.out);
    }

    /// Drains the bytes queued for the peer.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn stream(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn open_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|stream| !stream.is_closed())
            .count()
    }

    pub fn goaway_received(&self) -> Option<u32> {
        self.goaway_received
    }

    /// An orderly shutdown is complete once a GOAWAY went out and nothing
    /// fenced-in is still running.
    pub fn drained(&self) -> bool {
        self.goaway_sent.is_some() && self.open_streams() == 0
    }

    /// Consumes incoming bytes, appending decoded events to `out_events`.
    pub fn feed(
        &mut self,
        src: &mut BytesMut,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        if self.preface_pending && !self.is_client {
            if src.len() < CONNECTION_PREFACE.len() {
                return Ok(());
            }
            if &src[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "bad connection preface",
                ));
            }
            src.advance(CONNECTION_PREFACE.len());
            self.preface_pending = false;
        }
        while let Some(frame) = Frame::decode(src, self.local_settings.max_frame_size)? {
            self.handle_frame(frame, out_events)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        trace!(
            "rx frame {:?} stream={} flags={:#04x} len={}",
            frame.kind,
            frame.stream_id,
            frame.flags,
            frame.payload.len()
        );
        // A header block must arrive back-to-back: anything but the matching
        // CONTINUATION while one is open breaks the connection
        if let Some(continuation) = &self.continuation {
            let matches = frame.kind == FrameType::Continuation
                && frame.stream_id == continuation.stream_id;
            if !matches {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "frame interleaved inside a header block",
                ));
            }
        }
        match frame.kind {
            FrameType::Settings => self.on_settings(frame, out_events),
            FrameType::Headers => self.on_headers(frame, out_events),
            FrameType::Continuation => self.on_continuation(frame, out_events),
            FrameType::Data => self.on_data(frame, out_events),
            FrameType::WindowUpdate => self.on_window_update(frame),
            FrameType::RstStream => self.on_rst_stream(frame, out_events),
            FrameType::Ping => self.on_ping(frame, out_events),
            FrameType::GoAway => self.on_goaway(frame, out_events),
            FrameType::PushPromise => self.on_push_promise(frame),
            FrameType::Priority => {
                if frame.payload.len() != 5 {
                    return Err(Error::Http2Connection(
                        Http2ErrorCode::FrameSizeError,
                        "PRIORITY payload must be 5 bytes",
                    ));
                }
                Ok(())
            }
            FrameType::Altsvc => self.on_altsvc(frame, out_events),
            FrameType::Origin => self.on_origin(frame, out_events),
            FrameType::Unknown(kind) => {
                debug!("ignoring unknown frame type {:#04x}", kind);
                Ok(())
            }
        }
    }

    fn on_settings(
        &mut self,
        frame: Frame,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        if frame.stream_id != 0 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "SETTINGS on a stream",
            ));
        }
        if frame.has_flag(flags::ACK) {
            if !frame.payload.is_empty() {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::FrameSizeError,
                    "SETTINGS ack with a payload",
                ));
            }
            out_events.push(Http2Event::SettingsAck);
            return Ok(());
        }
        let old_initial_window = self.remote_settings.initial_window_size;
        settings::decode(&mut self.remote_settings, &frame.payload)?;
        // the peer's table size bounds our encoder
        self.encoder
            .resize(self.remote_settings.header_table_size as usize);
        // a changed INITIAL_WINDOW_SIZE shifts every open stream's window
        let delta =
            self.remote_settings.initial_window_size as i64 - old_initial_window as i64;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window += delta;
            }
        }
        Frame::new(FrameType::Settings, flags::ACK, 0, Bytes::new()).encode(&mut self.out);
        out_events.push(Http2Event::RemoteSettings(self.remote_settings));
        self.flush_pending();
        Ok(())
    }

    fn on_headers(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.stream_id == 0 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "HEADERS on stream zero",
            ));
        }
        let mut block = frame.unpad()?;
        if frame.has_flag(flags::PRIORITY) {
            if block.len() < 5 {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::FrameSizeError,
                    "HEADERS priority fields truncated",
                ));
            }
            block = block.slice(5..);
        }
        let end_stream = frame.has_flag(flags::END_STREAM);
        if frame.has_flag(flags::END_HEADERS) {
            self.finish_header_block(frame.stream_id, &block, end_stream, false, out_events)
        } else {
            let mut fragment = BytesMut::new();
            fragment.extend_from_slice(&block);
            self.continuation = Some(ContinuationState {
                stream_id: frame.stream_id,
                end_stream,
                fragment,
                refuse_promise: None,
            });
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        frame: Frame,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        let Some(mut continuation) = self.continuation.take() else {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "CONTINUATION without a header block",
            ));
        };
        continuation.fragment.extend_from_slice(&frame.payload);
        if continuation.fragment.len() > self.local_settings.max_header_list_size as usize {
            return Err(Error::Http2Connection(
                Http2ErrorCode::EnhanceYourCalm,
                "header block grew past the configured list size",
            ));
        }
        if frame.has_flag(flags::END_HEADERS) {
            let block = continuation.fragment.freeze();
            if let Some(promised_id) = continuation.refuse_promise {
                // keep the shared HPACK state coherent, then refuse the push
                let _ = self.decoder.decode(&block)?;
                self.send_rst_stream(promised_id, Http2ErrorCode::RefusedStream);
                return Ok(());
            }
            self.finish_header_block(
                continuation.stream_id,
                &block,
                continuation.end_stream,
                false,
                out_events,
            )
        } else {
            self.continuation = Some(continuation);
            Ok(())
        }
    }

    fn finish_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        _push: bool,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        let headers = self
            .decoder
            .decode(block)
            .map_err(|_| Error::Http2Connection(
                Http2ErrorCode::CompressionError,
                "header block failed to decode",
            ))?;
        validate_pseudo_headers(&headers, self.is_client)?;

        // late HEADERS past a GOAWAY fence are dropped quietly
        if let Some(last) = self.goaway_sent {
            if self.peer_initiated(stream_id) && stream_id > last {
                return Ok(());
            }
        }

        if !self.streams.contains_key(&stream_id) {
            if !self.peer_initiated(stream_id) {
                // a response for a stream we never opened
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "HEADERS on an idle local stream",
                ));
            }
            // stream ids only ever grow; a replay is a protocol error
            if stream_id <= self.highest_peer_stream {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "peer reused a stream id",
                ));
            }
            self.highest_peer_stream = stream_id;
            let mut stream = Stream::new(
                stream_id,
                self.remote_settings.initial_window_size,
                self.local_settings.initial_window_size,
            );
            stream.state = StreamState::Open;
            self.streams.insert(stream_id, stream);
        }
        let mut tunnel = false;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.headers_received = true;
            tunnel = stream.tunnel;
        }

        // an extended CONNECT answered 200 switches the stream to tunnel mode
        let tunnel_established = self.is_client
            && tunnel
            && headers
                .iter()
                .any(|(name, value)| name == ":status" && value == "200");

        if end_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.close_remote();
            }
        }
        out_events.push(Http2Event::Headers {
            stream_id,
            headers,
            end_stream,
        });
        if tunnel_established {
            out_events.push(Http2Event::TunnelEstablished { stream_id });
        }
        Ok(())
    }

    fn on_data(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.stream_id == 0 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "DATA on stream zero",
            ));
        }
        let flow_len = frame.payload.len() as i64;
        self.conn_recv_window -= flow_len;
        if self.conn_recv_window < 0 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FlowControlError,
                "connection window underflow",
            ));
        }
        let end_stream = frame.has_flag(flags::END_STREAM);
        let data = frame.unpad()?;

        match self.streams.get_mut(&frame.stream_id) {
            // DATA before HEADERS closes the stream, not the connection
            Some(stream) if !stream.headers_received && !stream.tunnel => {
                warn!("DATA before HEADERS on stream {}", frame.stream_id);
                self.send_rst_stream(frame.stream_id, Http2ErrorCode::ProtocolError);
                self.replenish_connection_window(flow_len);
                return Ok(());
            }
            Some(stream) => {
                stream.recv_window -= flow_len;
                if stream.recv_window < 0 {
                    let id = stream.id;
                    self.send_rst_stream(id, Http2ErrorCode::FlowControlError);
                    self.replenish_connection_window(flow_len);
                    return Ok(());
                }
                if end_stream {
                    stream.close_remote();
                } else {
                    // keep the stream window topped up once half is consumed
                    let initial = self.local_settings.initial_window_size as i64;
                    if stream.recv_window < initial / 2 {
                        let delta = (initial - stream.recv_window) as u32;
                        stream.recv_window = initial;
                        let mut payload = BytesMut::with_capacity(4);
                        payload.put_u32(delta);
                        Frame::new(
                            FrameType::WindowUpdate,
                            0,
                            frame.stream_id,
                            payload.freeze(),
                        )
                        .encode(&mut self.out);
                    }
                }
                out_events.push(Http2Event::Data {
                    stream_id: frame.stream_id,
                    data,
                    end_stream,
                });
            }
            None => {
                warn!("DATA on unknown stream {}", frame.stream_id);
                self.send_rst_stream(frame.stream_id, Http2ErrorCode::ProtocolError);
            }
        }
        self.replenish_connection_window(flow_len);
        Ok(())
    }

    fn replenish_connection_window(&mut self, consumed: i64) {
        // connection-level credit is returned promptly; per-stream credit is
        // what actually applies backpressure
        self.conn_recv_window += consumed;
        if consumed > 0 {
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u32(consumed as u32);
            Frame::new(FrameType::WindowUpdate, 0, 0, payload.freeze()).encode(&mut self.out);
        }
    }

    fn on_window_update(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.payload.len() != 4 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "WINDOW_UPDATE payload must be 4 bytes",
            ));
        }
        let delta = u32::from_be_bytes([
            frame.payload[0] & 0x7f,
            frame.payload[1],
            frame.payload[2],
            frame.payload[3],
        ]);
        if delta == 0 {
            if frame.stream_id == 0 {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero delta",
                ));
            }
            self.send_rst_stream(frame.stream_id, Http2ErrorCode::ProtocolError);
            return Ok(());
        }
        if frame.stream_id == 0 {
            self.conn_send_window += delta as i64;
            if self.conn_send_window > settings::MAX_WINDOW_SIZE as i64 {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::FlowControlError,
                    "connection window above 2^31-1",
                ));
            }
        } else if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
            stream.send_window += delta as i64;
            if stream.send_window > settings::MAX_WINDOW_SIZE as i64 {
                let id = stream.id;
                self.send_rst_stream(id, Http2ErrorCode::FlowControlError);
                return Ok(());
            }
        }
        self.flush_pending();
        Ok(())
    }

    fn on_rst_stream(
        &mut self,
        frame: Frame,
        out_events: &mut Vec<Http2Event>,
    ) -> Result<(), Error> {
        if frame.stream_id == 0 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "RST_STREAM on stream zero",
            ));
        }
        if frame.payload.len() != 4 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "RST_STREAM payload must be 4 bytes",
            ));
        }
        let code = Http2ErrorCode::from_u32(u32::from_be_bytes([
            frame.payload[0],
            frame.payload[1],
            frame.payload[2],
            frame.payload[3],
        ]));
        if let Some(mut stream) = self.streams.remove(&frame.stream_id) {
            stream.state = StreamState::Closed;
        }
        out_events.push(Http2Event::StreamReset {
            stream_id: frame.stream_id,
            code,
        });
        Ok(())
    }

    fn on_ping(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.payload.len() != 8 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "PING payload must be 8 bytes",
            ));
        }
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&frame.payload);
        let ack = frame.has_flag(flags::ACK);
        if !ack {
            Frame::new(FrameType::Ping, flags::ACK, 0, frame.payload.clone())
                .encode(&mut self.out);
        }
        out_events.push(Http2Event::Ping { payload, ack });
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.payload.len() < 8 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "GOAWAY payload truncated",
            ));
        }
        let last_stream_id = u32::from_be_bytes([
            frame.payload[0] & 0x7f,
            frame.payload[1],
            frame.payload[2],
            frame.payload[3],
        ]);
        let code = Http2ErrorCode::from_u32(u32::from_be_bytes([
            frame.payload[4],
            frame.payload[5],
            frame.payload[6],
            frame.payload[7],
        ]));
        let debug_data = String::from_utf8_lossy(&frame.payload[8..]).to_string();
        self.goaway_received = Some(last_stream_id);
        // locally-initiated streams above the fence will never complete
        let is_client = self.is_client;
        self.streams
            .retain(|id, _| !Self::initiated_by(is_client, *id) || *id <= last_stream_id);
        out_events.push(Http2Event::GoAway {
            last_stream_id,
            code,
            debug: debug_data,
        });
        Ok(())
    }

    fn on_push_promise(&mut self, frame: Frame) -> Result<(), Error> {
        // pushes are disabled; a peer ignoring that gets every promised
        // stream refused (after the block fed the decoder)
        let block = frame.unpad()?;
        if block.len() < 4 {
            return Err(Error::Http2Connection(
                Http2ErrorCode::FrameSizeError,
                "PUSH_PROMISE payload truncated",
            ));
        }
        let promised_id = u32::from_be_bytes([block[0] & 0x7f, block[1], block[2], block[3]]);
        let fragment = block.slice(4..);
        if frame.has_flag(flags::END_HEADERS) {
            let _ = self.decoder.decode(&fragment)?;
            self.send_rst_stream(promised_id, Http2ErrorCode::RefusedStream);
        } else {
            let mut buffered = BytesMut::new();
            buffered.extend_from_slice(&fragment);
            self.continuation = Some(ContinuationState {
                stream_id: frame.stream_id,
                end_stream: false,
                fragment: buffered,
                refuse_promise: Some(promised_id),
            });
        }
        Ok(())
    }

    fn on_altsvc(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.payload.len() < 2 {
            return Ok(());
        }
        let origin_len = u16::from_be_bytes([frame.payload[0], frame.payload[1]]) as usize;
        if frame.payload.len() < 2 + origin_len {
            return Ok(());
        }
        let origin = String::from_utf8_lossy(&frame.payload[2..2 + origin_len]).to_string();
        let value = String::from_utf8_lossy(&frame.payload[2 + origin_len..]).to_string();
        out_events.push(Http2Event::Altsvc { origin, value });
        Ok(())
    }

    fn on_origin(&mut self, frame: Frame, out_events: &mut Vec<Http2Event>) -> Result<(), Error> {
        if frame.stream_id != 0 {
            // ORIGIN is connection-scoped; elsewhere it is ignored
            return Ok(());
        }
        let mut origins = Vec::new();
        let mut payload = &frame.payload[..];
        while payload.len() >= 2 {
            let length = u16::from_be_bytes([payload[0], payload[1]]) as usize;
            if payload.len() < 2 + length {
                break;
            }
            origins.push(String::from_utf8_lossy(&payload[2..2 + length]).to_string());
            payload = &payload[2 + length..];
        }
        out_events.push(Http2Event::Origin(origins));
        Ok(())
    }

    fn peer_initiated(&self, stream_id: u32) -> bool {
        Self::initiated_by(!self.is_client, stream_id)
    }

    fn initiated_by(client: bool, stream_id: u32) -> bool {
        if client {
            stream_id % 2 == 1
        } else {
            stream_id % 2 == 0 && stream_id != 0
        }
    }

    // ---- send side -------------------------------------------------------

    fn next_stream(&mut self) -> Result<u32, Error> {
        if let Some(last) = self.goaway_received {
            if self.next_stream_id > last {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::RefusedStream,
                    "peer sent GOAWAY, no new streams",
                ));
            }
        }
        let active = self
            .streams
            .values()
            .filter(|stream| !stream.is_closed() && Self::initiated_by(self.is_client, stream.id))
            .count() as u32;
        if active >= self.remote_settings.max_concurrent_streams {
            return Err(Error::Http2Connection(
                Http2ErrorCode::RefusedStream,
                "MAX_CONCURRENT_STREAMS reached",
            ));
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(id)
    }

    /// Opens a stream with a header block, splitting into CONTINUATION
    /// frames when the block exceeds the peer's MAX_FRAME_SIZE.
    pub fn send_headers(
        &mut self,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<u32, Error> {
        let stream_id = self.next_stream()?;
        let mut stream = Stream::new(
            stream_id,
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
        );
        stream.state = if end_stream {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        };
        stream.tunnel = headers
            .iter()
            .any(|(name, value)| name == ":protocol" && value == "websocket");
        self.streams.insert(stream_id, stream);
        self.write_header_block(stream_id, headers, end_stream);
        Ok(stream_id)
    }

    /// Answers a peer-opened stream (server side).
    pub fn send_response_headers(
        &mut self,
        stream_id: u32,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<(), Error> {
        if !self.streams.contains_key(&stream_id) {
            return Err(Error::Http2Stream(stream_id, Http2ErrorCode::StreamClosed));
        }
        self.write_header_block(stream_id, headers, end_stream);
        if end_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.close_local();
            }
        }
        Ok(())
    }

    fn write_header_block(
        &mut self,
        stream_id: u32,
        headers: &[(String, String)],
        end_stream: bool,
    ) {
        let block = self.encoder.encode(headers);
        let max = self.remote_settings.max_frame_size as usize;
        let mut flag_bits = if end_stream { flags::END_STREAM } else { 0 };
        if block.len() <= max {
            flag_bits |= flags::END_HEADERS;
            Frame::new(
                FrameType::Headers,
                flag_bits,
                stream_id,
                Bytes::from(block),
            )
            .encode(&mut self.out);
            return;
        }
        let chunks: Vec<&[u8]> = block.chunks(max).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let kind = if i == 0 {
                FrameType::Headers
            } else {
                FrameType::Continuation
            };
            let mut chunk_flags = 0;
            if i == 0 && end_stream {
                chunk_flags |= flags::END_STREAM;
            }
            if i == last {
                chunk_flags |= flags::END_HEADERS;
            }
            Frame::new(kind, chunk_flags, stream_id, Bytes::copy_from_slice(chunk))
                .encode(&mut self.out);
        }
    }

    /// Queues DATA; whatever the windows admit goes out now, the rest waits
    /// for WINDOW_UPDATE credit.
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), Error> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(Error::Http2Stream(stream_id, Http2ErrorCode::StreamClosed));
        };
        if !stream.can_send_data() && !stream.tunnel {
            return Err(Error::Http2Stream(stream_id, Http2ErrorCode::StreamClosed));
        }
        if !data.is_empty() {
            stream.pending.push_back(data);
        }
        stream.pending_end_stream |= end_stream;
        self.flush_pending();
        Ok(())
    }

    // Sends as much queued DATA as the stream windows, the connection
    // window, and MAX_FRAME_SIZE allow.
    fn flush_pending(&mut self) {
        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut ids: Vec<u32> = self
            .streams
            .values()
            .filter(|stream| stream.pending_len() > 0 || stream.pending_end_stream)
            .map(|stream| stream.id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            loop {
                let conn_window = self.conn_send_window;
                let Some(stream) = self.streams.get_mut(&id) else { break };
                if stream.pending.is_empty() {
                    if stream.pending_end_stream {
                        stream.pending_end_stream = false;
                        stream.close_local();
                        Frame::new(FrameType::Data, flags::END_STREAM, id, Bytes::new())
                            .encode(&mut self.out);
                    }
                    break;
                }
                let budget = stream
                    .send_window
                    .min(conn_window)
                    .min(max_frame as i64);
                if budget <= 0 {
                    break;
                }
                let Some(mut head) = stream.pending.pop_front() else {
                    break;
                };
                let take = head.len().min(budget as usize);
                let chunk = head.split_to(take);
                if !head.is_empty() {
                    stream.pending.push_front(head);
                }
                stream.send_window -= chunk.len() as i64;
                self.conn_send_window -= chunk.len() as i64;
                let is_last = stream.pending.is_empty() && stream.pending_end_stream;
                let frame_flags = if is_last { flags::END_STREAM } else { 0 };
                if is_last {
                    stream.pending_end_stream = false;
                    stream.close_local();
                }
                Frame::new(FrameType::Data, frame_flags, id, chunk).encode(&mut self.out);
            }
        }
    }

    pub fn send_ping(&mut self, payload: [u8; 8]) {
        Frame::new(FrameType::Ping, 0, 0, Bytes::copy_from_slice(&payload))
            .encode(&mut self.out);
    }

    pub fn send_rst_stream(&mut self, stream_id: u32, code: Http2ErrorCode) {
        self.streams.remove(&stream_id);
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code.as_u32());
        Frame::new(FrameType::RstStream, 0, stream_id, payload.freeze()).encode(&mut self.out);
    }

    /// Fences new peer streams and carries a short ASCII reason as debug
    /// data. In-flight streams at or below the fence may still finish.
    pub fn send_goaway(&mut self, code: Http2ErrorCode, reason: &str) {
        if self.goaway_sent.is_some() {
            return;
        }
        let last = self.highest_peer_stream;
        self.goaway_sent = Some(last);
        let mut payload = BytesMut::with_capacity(8 + reason.len());
        payload.put_u32(last & 0x7fff_ffff);
        payload.put_u32(code.as_u32());
        payload.put_slice(reason.as_bytes());
        Frame::new(FrameType::GoAway, 0, 0, payload.freeze()).encode(&mut self.out);
    }

    /// Re-announces the local settings after a live configuration change;
    /// the decoder ceiling follows immediately, senders follow on our ACK.
    pub fn update_local_settings(&mut self, local_settings: Http2Settings) {
        self.local_settings = local_settings;
        self.decoder
            .set_settings_max(local_settings.header_table_size as usize);
        let payload = settings::encode(&local_settings);
        Frame::new(FrameType::Settings, 0, 0, payload).encode(&mut self.out);
    }

    /// RFC 8441 extended CONNECT opening a websocket tunnel.
    pub fn connect_websocket(&mut self, authority: &str, path: &str) -> Result<u32, Error> {
        let headers = vec![
            (":method".to_string(), "CONNECT".to_string()),
            (":protocol".to_string(), "websocket".to_string()),
            (":scheme".to_string(), "https".to_string()),
            (":authority".to_string(), authority.to_string()),
            (":path".to_string(), path.to_string()),
        ];
        self.send_headers(&headers, false)
    }

    /// Marks a server-side stream as an accepted websocket tunnel.
    pub fn accept_tunnel(&mut self, stream_id: u32) -> Result<(), Error> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(Error::Http2Stream(stream_id, Http2ErrorCode::StreamClosed));
        };
        stream.tunnel = true;
        self.send_response_headers(
            stream_id,
            &[(":status".to_string(), "200".to_string())],
            false,
        )
    }
}

/// Pseudo-header discipline, RFC 9113 §8.3 plus the RFC 8441 CONNECT
/// extension.
fn validate_pseudo_headers(headers: &[(String, String)], is_client: bool) -> Result<(), Error> {
    let mut seen_regular = false;
    for (name, _) in headers {
        if name.starts_with(':') {
            if seen_regular {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "pseudo-header after a regular header",
                ));
            }
            if !matches!(
                name.as_str(),
                ":method" | ":scheme" | ":path" | ":authority" | ":status" | ":protocol"
            ) {
                return Err(Error::Http2Connection(
                    Http2ErrorCode::ProtocolError,
                    "unknown pseudo-header",
                ));
            }
        } else {
            seen_regular = true;
        }
    }
    let get = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, value)| value.as_str())
    };
    if is_client {
        // responses only need :status
        if get(":status").is_none() {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "response without :status",
            ));
        }
        return Ok(());
    }
    let method = get(":method").ok_or(Error::Http2Connection(
        Http2ErrorCode::ProtocolError,
        "request without :method",
    ))?;
    if method == "CONNECT" {
        if get(":authority").is_none() {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "CONNECT without :authority",
            ));
        }
        // extended CONNECT re-requires scheme and path
        if get(":protocol").is_some() && (get(":scheme").is_none() || get(":path").is_none()) {
            return Err(Error::Http2Connection(
                Http2ErrorCode::ProtocolError,
                "extended CONNECT without :scheme/:path",
            ));
        }
        return Ok(());
    }
    if get(":scheme").is_none() || get(":path").is_none() {
        return Err(Error::Http2Connection(
            Http2ErrorCode::ProtocolError,
            "request without :scheme/:path",
        ));
    }
    if get(":authority").is_none() {
        return Err(Error::Http2Connection(
            Http2ErrorCode::ProtocolError,
            "request without :authority",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Http2Session, Http2Session) {
        let mut client = Http2Session::new(true, Http2Settings::default());
        let mut server = Http2Session::new(false, Http2Settings::default());
        client.start();
        server.start();
        exchange(&mut client, &mut server);
        (client, server)
    }

    // Shuttles queued bytes both ways until both sides go quiet.
    fn exchange(client: &mut Http2Session, server: &mut Http2Session) -> (Vec<Http2Event>, Vec<Http2Event>) {
        let mut client_events = Vec::new();
        let mut server_events = Vec::new();
        loop {
            let to_server = client.take_output();
            let to_client = server.take_output();
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
            if !to_server.is_empty() {
                let mut buf = BytesMut::from(&to_server[..]);
                server.feed(&mut buf, &mut server_events).unwrap();
            }
            if !to_client.is_empty() {
                let mut buf = BytesMut::from(&to_client[..]);
                client.feed(&mut buf, &mut client_events).unwrap();
            }
        }
        (client_events, server_events)
    }

    fn request_headers() -> Vec<(String, String)> {
        vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), "https".to_string()),
            (":path".to_string(), "/".to_string()),
            (":authority".to_string(), "example.org".to_string()),
        ]
    }

    #[test]
    fn test_get_exchange_scenario() {
        // S4: GET answered with 200 + 4 bytes of DATA
        let (mut client, mut server) = pair();
        let stream_id = client.send_headers(&request_headers(), true).unwrap();
        assert_eq!(stream_id, 1);
        let (_, server_events) = exchange(&mut client, &mut server);
        assert!(server_events.iter().any(|event| matches!(
            event,
            Http2Event::Headers { stream_id: 1, end_stream: true, .. }
        )));

        server
            .send_response_headers(
                1,
                &[
                    (":status".to_string(), "200".to_string()),
                    ("content-length".to_string(), "4".to_string()),
                ],
                false,
            )
            .unwrap();
        server.send_data(1, Bytes::from_static(b"abcd"), true).unwrap();
        let (client_events, _) = exchange(&mut client, &mut server);
        let mut saw_headers = false;
        let mut body = Vec::new();
        for event in client_events {
            match event {
                Http2Event::Headers { stream_id: 1, headers, .. } => {
                    saw_headers = true;
                    assert!(headers.contains(&(":status".to_string(), "200".to_string())));
                }
                Http2Event::Data { stream_id: 1, data, .. } => body.extend_from_slice(&data),
                _ => {}
            }
        }
        assert!(saw_headers);
        assert_eq!(body, b"abcd");
        // the server spent exactly 4 bytes of stream-1 credit
        let stream = server.stream(1).unwrap();
        assert_eq!(
            stream.send_window,
            Http2Settings::default().initial_window_size as i64 - 4
        );
    }

    #[test]
    fn test_flow_control_partitions_data() {
        let mut local = Http2Settings::default();
        local.initial_window_size = 10;
        let mut client = Http2Session::new(true, local);
        let mut server = Http2Session::new(false, Http2Settings::default());
        client.start();
        server.start();
        exchange(&mut client, &mut server);

        let stream_id = client.send_headers(&request_headers(), true).unwrap();
        exchange(&mut client, &mut server);
        server
            .send_response_headers(stream_id, &[(":status".to_string(), "200".to_string())], false)
            .unwrap();
        // 25 bytes against a 10-byte window: only 10 may flow before credit
        server
            .send_data(stream_id, Bytes::from(vec![1u8; 25]), true)
            .unwrap();
        let (client_events, _) = exchange(&mut client, &mut server);
        let received: usize = client_events
            .iter()
            .filter_map(|event| match event {
                Http2Event::Data { data, .. } => Some(data.len()),
                _ => None,
            })
            .sum();
        // stream window replenishment tops up once below half, so everything
        // eventually arrives without ever exceeding the advertised credit
        assert_eq!(received, 25);
    }

    #[test]
    fn test_window_update_zero_on_connection_fails() {
        let (mut client, _) = pair();
        let mut payload = BytesMut::new();
        payload.put_u32(0);
        let mut wire = BytesMut::new();
        Frame::new(FrameType::WindowUpdate, 0, 0, payload.freeze()).encode(&mut wire);
        let mut events = Vec::new();
        assert!(matches!(
            client.feed(&mut wire, &mut events),
            Err(Error::Http2Connection(Http2ErrorCode::ProtocolError, _))
        ));
    }

    #[test]
    fn test_data_before_headers_resets_stream() {
        let (mut client, mut server) = pair();
        let stream_id = client.send_headers(&request_headers(), false).unwrap();
        exchange(&mut client, &mut server);
        // server answers with DATA before any HEADERS
        let mut wire = BytesMut::new();
        Frame::new(FrameType::Data, 0, stream_id, Bytes::from_static(b"rogue"))
            .encode(&mut wire);
        let mut events = Vec::new();
        client.feed(&mut wire, &mut events).unwrap();
        let (_, server_events) = exchange(&mut client, &mut server);
        assert!(server_events.iter().any(|event| matches!(
            event,
            Http2Event::StreamReset { code: Http2ErrorCode::ProtocolError, .. }
        )));
    }

    #[test]
    fn test_push_promise_refused() {
        let (mut client, mut server) = pair();
        let stream_id = client.send_headers(&request_headers(), false).unwrap();
        exchange(&mut client, &mut server);
        // a misbehaving server promises stream 2 regardless of ENABLE_PUSH=0
        let mut block = BytesMut::new();
        block.put_u32(2);
        block.extend_from_slice(&[0x82]); // :method GET, indexed
        let mut wire = BytesMut::new();
        Frame::new(
            FrameType::PushPromise,
            flags::END_HEADERS,
            stream_id,
            block.freeze(),
        )
        .encode(&mut wire);
        let mut events = Vec::new();
        client.feed(&mut wire, &mut events).unwrap();
        let (_, server_events) = exchange(&mut client, &mut server);
        assert!(server_events.iter().any(|event| matches!(
            event,
            Http2Event::StreamReset { stream_id: 2, code: Http2ErrorCode::RefusedStream }
        )));
    }

    #[test]
    fn test_interleaved_continuation_fails() {
        let (mut client, mut server) = pair();
        client.send_headers(&request_headers(), false).unwrap();
        exchange(&mut client, &mut server);
        // HEADERS without END_HEADERS followed by a PING is a protocol error
        let block = server.encoder.encode(&[(":status".to_string(), "200".to_string())]);
        let mut wire = BytesMut::new();
        Frame::new(FrameType::Headers, 0, 1, Bytes::from(block)).encode(&mut wire);
        Frame::new(FrameType::Ping, 0, 0, Bytes::from_static(&[0; 8])).encode(&mut wire);
        let mut events = Vec::new();
        assert!(matches!(
            client.feed(&mut wire, &mut events),
            Err(Error::Http2Connection(Http2ErrorCode::ProtocolError, _))
        ));
    }

    #[test]
    fn test_headers_plus_continuation_assemble() {
        let (mut client, mut server) = pair();
        client.send_headers(&request_headers(), false).unwrap();
        exchange(&mut client, &mut server);
        let block = server
            .encoder
            .encode(&[(":status".to_string(), "200".to_string()),
                      ("x-filler".to_string(), "y".repeat(64))]);
        let split_at = block.len() / 2;
        let mut wire = BytesMut::new();
        Frame::new(FrameType::Headers, 0, 1, Bytes::copy_from_slice(&block[..split_at]))
            .encode(&mut wire);
        Frame::new(
            FrameType::Continuation,
            flags::END_HEADERS,
            1,
            Bytes::copy_from_slice(&block[split_at..]),
        )
        .encode(&mut wire);
        let mut events = Vec::new();
        client.feed(&mut wire, &mut events).unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            Http2Event::Headers { stream_id: 1, headers, .. }
                if headers.iter().any(|(name, _)| name == "x-filler")
        )));
    }

    #[test]
    fn test_goaway_fences_new_streams() {
        let (mut client, mut server) = pair();
        server.send_goaway(Http2ErrorCode::NoError, "maintenance");
        exchange(&mut client, &mut server);
        assert!(matches!(
            client.send_headers(&request_headers(), true),
            Err(Error::Http2Connection(Http2ErrorCode::RefusedStream, _))
        ));
        assert_eq!(client.goaway_received(), Some(0));
    }

    #[test]
    fn test_websocket_tunnel_establishment() {
        let (mut client, mut server) = pair();
        let stream_id = client.connect_websocket("example.org", "/chat").unwrap();
        let (_, server_events) = exchange(&mut client, &mut server);
        let tunnel_request = server_events.iter().any(|event| matches!(
            event,
            Http2Event::Headers { headers, .. }
                if headers.contains(&(":protocol".to_string(), "websocket".to_string()))
        ));
        assert!(tunnel_request);
        server.accept_tunnel(stream_id).unwrap();
        let (client_events, _) = exchange(&mut client, &mut server);
        assert!(client_events
            .iter()
            .any(|event| matches!(event, Http2Event::TunnelEstablished { stream_id: id } if *id == stream_id)));
        // DATA now carries websocket frames verbatim in both directions
        client
            .send_data(stream_id, Bytes::from_static(b"\x81\x85fake!"), false)
            .unwrap();
        let (_, server_events) = exchange(&mut client, &mut server);
        assert!(server_events.iter().any(|event| matches!(
            event,
            Http2Event::Data { data, .. } if data.as_ref() == b"\x81\x85fake!"
        )));
    }

    #[test]
    fn test_ping_is_acked() {
        let (mut client, mut server) = pair();
        client.send_ping(*b"12345678");
        let (client_events, _) = exchange(&mut client, &mut server);
        assert!(client_events.iter().any(|event| matches!(
            event,
            Http2Event::Ping { payload, ack: true } if payload == b"12345678"
        )));
    }

    #[test]
    fn test_pseudo_header_after_regular_fails() {
        let headers = vec![
            (":method".to_string(), "GET".to_string()),
            ("accept".to_string(), "*/*".to_string()),
            (":path".to_string(), "/".to_string()),
        ];
        assert!(validate_pseudo_headers(&headers, false).is_err());
    }

    #[test]
    fn test_connect_needs_only_authority() {
        let headers = vec![
            (":method".to_string(), "CONNECT".to_string()),
            (":authority".to_string(), "example.org:443".to_string()),
        ];
        validate_pseudo_headers(&headers, false).unwrap();
        let missing = vec![(":method".to_string(), "CONNECT".to_string())];
        assert!(validate_pseudo_headers(&missing, false).is_err());
    }

    #[test]
    fn test_bad_preface_rejected() {
        let mut server = Http2Session::new(false, Http2Settings::default());
        server.start();
        let mut wire = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example\r\n\r\n"[..]);
        let mut events = Vec::new();
        assert!(server.feed(&mut wire, &mut events).is_err());
    }
}
