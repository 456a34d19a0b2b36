use crate::config::{Compressor, Http2Settings, SchemeConfig};
use crate::crypto::PayloadCrypto;
use crate::error::Error;
use crate::http::headers::Headers;
use crate::http::model::{
    accept_encoding_value, negotiate_encoding, open_body, seal_body, Identity, Request, Response,
    Version,
};
use crate::http1::emitter::{emit_request, emit_response};
use crate::http1::parser::Http1Parser;
use crate::http2::session::{Http2Event, Http2Session};
use crate::http2::Http2ErrorCode;
use crate::ws::frame::{CloseCode, Role};
use crate::ws::handshake::Negotiated;
use crate::ws::pipeline::{MessagePipeline, WsEvent};
use crate::ws::Message;
use bytes::BytesMut;
use log::{debug, trace};
use std::collections::HashMap;

/// What a caller can ask an engine to put on the wire.
#[derive(Debug)]
pub enum EngineMessage {
    /// Raw bytes, RAW protocol only.
    Data(Vec<u8>),
    Ws(Message),
    WsPing(Vec<u8>),
    WsClose(CloseCode, String),
    /// Client request; HTTP/1 serializes it, HTTP/2 opens a stream.
    Request(Box<Request>),
    /// Server response; the stream id is 0 on HTTP/1.
    Response(u32, Box<Response>),
}

/// What an engine hands back while digesting incoming bytes.
#[derive(Debug)]
pub enum EngineEvent {
    Message(Message),
    Pong(Vec<u8>),
    /// Peer close; the echo is already queued in the reply buffer.
    Close(Option<CloseCode>, String),
    /// Response headers arrived ahead of the body.
    Headers(Headers),
    /// A complete response (client side), body already decoded.
    Entity(Box<Response>),
    /// A complete request (server side).
    Request(Box<Request>),
    /// The current HTTP/1 exchange finished.
    Complete,
    /// An HTTP/2 stream finished.
    StreamEnd(u32),
    Origin(Vec<String>),
    Altsvc(String, String),
    RemoteSettings(Http2Settings),
}

/// The capability set every protocol engine implements; see the concrete
/// variants in [`Engine`].
pub trait ProtocolEngine: Send {
    /// Decodes whatever sits in `buf`, pushing events and writing any
    /// protocol-mandated replies (pong, acks, window updates) to `reply`.
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        reply: &mut BytesMut,
    ) -> Result<(), Error>;

    /// Serializes one outgoing message.
    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error>;

    /// Live HTTP/2 settings update; a no-op for the other engines.
    fn on_settings_change(&mut self, settings: &Http2Settings, dst: &mut BytesMut);

    /// The peer closed the transport. HTTP/1 finalizes a body that was
    /// delimited by connection close; everyone else has nothing to add.
    fn on_eof(&mut self, _out: &mut Vec<EngineEvent>) -> Result<(), Error> {
        Ok(())
    }

    /// Emits the protocol-appropriate close (WS close frame, GOAWAY).
    fn close(&mut self, dst: &mut BytesMut) -> Result<(), Error>;
}

// ---- RAW -----------------------------------------------------------------

/// Pass-through engine: every read chunk is a binary message.
pub struct RawEngine;

impl ProtocolEngine for RawEngine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        _reply: &mut BytesMut,
    ) -> Result<(), Error> {
        if !buf.is_empty() {
            out.push(EngineEvent::Message(Message::Binary(buf.split().to_vec())));
        }
        Ok(())
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        match message {
            EngineMessage::Data(data) => {
                dst.extend_from_slice(&data);
                Ok(())
            }
            EngineMessage::Ws(message) => {
                dst.extend_from_slice(message.as_binary());
                Ok(())
            }
            _ => Err(Error::Http1Malformed("message kind not valid for RAW")),
        }
    }

    fn on_settings_change(&mut self, _settings: &Http2Settings, _dst: &mut BytesMut) {}

    fn close(&mut self, _dst: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }
}

// ---- WebSocket over HTTP/1 ----------------------------------------------

/// Frame pipeline over an upgraded HTTP/1.1 connection.
pub struct Ws1Engine {
    pipeline: MessagePipeline,
}

impl Ws1Engine {
    pub fn new(role: Role, negotiated: &Negotiated, config: &SchemeConfig) -> Self {
        Self {
            pipeline: MessagePipeline::new(
                role,
                negotiated,
                config.segment_size,
                config.broker_available_size.max(1 << 20),
                config.encryption.as_ref().map(PayloadCrypto::new),
            ),
        }
    }
}

impl ProtocolEngine for Ws1Engine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        reply: &mut BytesMut,
    ) -> Result<(), Error> {
        let mut ws_events = Vec::new();
        self.pipeline.feed(buf, &mut ws_events)?;
        for event in ws_events {
            match event {
                WsEvent::Message(message) => out.push(EngineEvent::Message(message)),
                WsEvent::Ping(payload) => {
                    // a peer ping is answered in place, the user only
                    // observes the pong side
                    self.pipeline.encode_pong(payload, reply)?;
                }
                WsEvent::Pong(payload) => out.push(EngineEvent::Pong(payload)),
                WsEvent::Close(code, reason) => {
                    let echo = code.unwrap_or(CloseCode::Normal);
                    self.pipeline.encode_close(echo, "", reply)?;
                    out.push(EngineEvent::Close(code, reason));
                }
            }
        }
        Ok(())
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        match message {
            EngineMessage::Ws(message) => self.pipeline.encode_message(message, dst),
            EngineMessage::WsPing(payload) => self.pipeline.encode_ping(payload, dst),
            EngineMessage::WsClose(code, reason) => {
                self.pipeline.encode_close(code, &reason, dst)
            }
            EngineMessage::Data(data) => {
                self.pipeline.encode_message(Message::Binary(data), dst)
            }
            _ => Err(Error::Http1Malformed("message kind not valid for websocket")),
        }
    }

    fn on_settings_change(&mut self, _settings: &Http2Settings, _dst: &mut BytesMut) {}

    fn close(&mut self, dst: &mut BytesMut) -> Result<(), Error> {
        self.pipeline.encode_close(CloseCode::Normal, "", dst)
    }
}

// ---- HTTP/1.x ------------------------------------------------------------

/// Client-side HTTP/1.1 exchange engine: serializes requests, parses
/// responses incrementally, unseals bodies. Authentication headers belong
/// to the facade driving the retry loop, not to the engine.
pub struct Http1Engine {
    parser: Http1Parser,
    crypto: Option<PayloadCrypto>,
    compressors: Vec<Compressor>,
    identity: Identity,
    server: bool,
    /// Accept-Encoding of the request currently being answered.
    peer_accept: Option<String>,
}

impl Http1Engine {
    pub fn new(config: &SchemeConfig, server: bool) -> Self {
        Self {
            parser: if server {
                Http1Parser::new_request()
            } else {
                Http1Parser::new_response()
            },
            crypto: config.encryption.as_ref().map(PayloadCrypto::new),
            compressors: config.compressors.clone(),
            identity: Identity::default(),
            server,
            peer_accept: None,
        }
    }

    fn finish_response(&mut self) -> Result<Response, Error> {
        let body = open_body(
            &self.parser.headers,
            std::mem::take(&mut self.parser.body),
            self.crypto.as_ref(),
        )?;
        let response = Response {
            version: self.parser.version,
            status: self.parser.status,
            reason: std::mem::take(&mut self.parser.reason),
            headers: std::mem::take(&mut self.parser.headers),
            body,
        };
        self.parser.reset();
        Ok(response)
    }

    fn finish_request(&mut self) -> Result<Request, Error> {
        self.peer_accept = self
            .parser
            .headers
            .get("Accept-Encoding")
            .map(ToOwned::to_owned);
        let body = open_body(
            &self.parser.headers,
            std::mem::take(&mut self.parser.body),
            self.crypto.as_ref(),
        )?;
        let uri = std::mem::take(&mut self.parser.uri);
        let host = self.parser.headers.get("Host").unwrap_or("localhost");
        let url = url::Url::parse(&format!("http://{}{}", host, uri))?;
        let request = Request {
            method: std::mem::take(&mut self.parser.method),
            url,
            version: self.parser.version,
            headers: std::mem::take(&mut self.parser.headers),
            body,
        };
        self.parser.reset();
        Ok(request)
    }
}

impl ProtocolEngine for Http1Engine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        _reply: &mut BytesMut,
    ) -> Result<(), Error> {
        while !buf.is_empty() {
            let consumed = self.parser.parse(&buf[..])?;
            let _ = buf.split_to(consumed);
            if !self.parser.is_done() {
                break;
            }
            if self.server {
                let request = self.finish_request()?;
                trace!("parsed {} {}", request.method, request.url);
                out.push(EngineEvent::Request(Box::new(request)));
            } else {
                let response = self.finish_response()?;
                out.push(EngineEvent::Headers(response.headers.clone()));
                out.push(EngineEvent::Entity(Box::new(response)));
                out.push(EngineEvent::Complete);
            }
        }
        Ok(())
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        match message {
            EngineMessage::Request(mut request) => {
                request.headers.set("User-Agent", self.identity.agent());
                if let Some(accept) = accept_encoding_value(&self.compressors) {
                    request.headers.set("Accept-Encoding", accept);
                }
                let body = std::mem::take(&mut request.body);
                // requests seal the body but never content-encode it unless
                // the peer is known to accept; identity keeps it simple
                request.body =
                    seal_body(&mut request.headers, body, self.crypto.as_ref(), Compressor::None)?;
                dst.extend_from_slice(&emit_request(&request, &[]));
                Ok(())
            }
            EngineMessage::Response(_, mut response) => {
                response
                    .headers
                    .set("Server", self.identity.agent());
                // negotiate against what the request offered to accept
                let coding =
                    negotiate_encoding(self.peer_accept.as_deref(), &self.compressors);
                let body = std::mem::take(&mut response.body);
                response.body =
                    seal_body(&mut response.headers, body, self.crypto.as_ref(), coding)?;
                dst.extend_from_slice(&emit_response(&response, &[]));
                Ok(())
            }
            _ => Err(Error::Http1Malformed("message kind not valid for HTTP/1")),
        }
    }

    fn on_settings_change(&mut self, _settings: &Http2Settings, _dst: &mut BytesMut) {}

    fn on_eof(&mut self, out: &mut Vec<EngineEvent>) -> Result<(), Error> {
        use crate::http1::parser::State;
        // a response running to connection close completes here
        if !self.server && self.parser.state() == State::Body {
            self.parser.on_eof()?;
            let response = self.finish_response()?;
            out.push(EngineEvent::Headers(response.headers.clone()));
            out.push(EngineEvent::Entity(Box::new(response)));
            out.push(EngineEvent::Complete);
        }
        Ok(())
    }

    fn close(&mut self, _dst: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }
}

// ---- HTTP/2 --------------------------------------------------------------

struct PartialExchange {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// HTTP/2 engine over a single session; streams multiplex request/response
/// exchanges, bodies assemble per stream until END_STREAM.
pub struct Http2Engine {
    session: Http2Session,
    crypto: Option<PayloadCrypto>,
    compressors: Vec<Compressor>,
    identity: Identity,
    server: bool,
    partial: HashMap<u32, PartialExchange>,
    /// Per-stream Accept-Encoding of requests awaiting a response.
    peer_accept: HashMap<u32, String>,
}

impl Http2Engine {
    pub fn new(config: &SchemeConfig, server: bool) -> Self {
        let mut session = Http2Session::new(!server, config.http2);
        session.start();
        Self {
            session,
            crypto: config.encryption.as_ref().map(PayloadCrypto::new),
            compressors: config.compressors.clone(),
            identity: Identity::default(),
            server,
            partial: HashMap::new(),
            peer_accept: HashMap::new(),
        }
    }

    pub fn session_mut(&mut self) -> &mut Http2Session {
        &mut self.session
    }

    fn finish_exchange(
        &mut self,
        stream_id: u32,
        out: &mut Vec<EngineEvent>,
    ) -> Result<(), Error> {
        let Some(partial) = self.partial.remove(&stream_id) else {
            return Ok(());
        };
        let mut headers = Headers::new();
        let mut status = 0u16;
        let mut method = String::new();
        let mut authority = String::new();
        let mut scheme = "http".to_string();
        let mut path = "/".to_string();
        for (name, value) in &partial.headers {
            match name.as_str() {
                ":status" => status = value.parse().unwrap_or_default(),
                ":method" => method = value.clone(),
                ":authority" => authority = value.clone(),
                ":scheme" => scheme = value.clone(),
                ":path" => path = value.clone(),
                _ => headers.append(name.clone(), value.clone()),
            }
        }
        let body = open_body(&headers, partial.body, self.crypto.as_ref())?;
        if self.server {
            if let Some(accept) = headers.get("accept-encoding") {
                self.peer_accept.insert(stream_id, accept.to_string());
            }
            let url = url::Url::parse(&format!("{}://{}{}", scheme, authority, path))?;
            out.push(EngineEvent::Request(Box::new(Request {
                method,
                url,
                version: Version::Http2,
                headers,
                body,
            })));
        } else {
            out.push(EngineEvent::Headers(headers.clone()));
            out.push(EngineEvent::Entity(Box::new(Response {
                version: Version::Http2,
                status,
                reason: String::new(),
                headers,
                body,
            })));
        }
        out.push(EngineEvent::StreamEnd(stream_id));
        Ok(())
    }
}

impl ProtocolEngine for Http2Engine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        reply: &mut BytesMut,
    ) -> Result<(), Error> {
        let mut events = Vec::new();
        let fed = self.session.feed(buf, &mut events);
        // acks and window updates go out even when the feed failed
        reply.extend_from_slice(&self.session.take_output());
        fed?;
        for event in events {
            match event {
                Http2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    self.partial
                        .entry(stream_id)
                        .or_insert_with(|| PartialExchange {
                            headers: Vec::new(),
                            body: Vec::new(),
                        })
                        .headers
                        .extend(headers);
                    if end_stream {
                        self.finish_exchange(stream_id, out)?;
                    }
                }
                Http2Event::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if let Some(partial) = self.partial.get_mut(&stream_id) {
                        partial.body.extend_from_slice(&data);
                    }
                    if end_stream {
                        self.finish_exchange(stream_id, out)?;
                    }
                }
                Http2Event::StreamReset { stream_id, .. } => {
                    self.partial.remove(&stream_id);
                    out.push(EngineEvent::StreamEnd(stream_id));
                }
                Http2Event::GoAway { debug: reason, .. } => {
                    debug!("peer sent GOAWAY: {}", reason);
                    out.push(EngineEvent::Close(None, reason));
                }
                Http2Event::Altsvc { origin, value } => {
                    out.push(EngineEvent::Altsvc(origin, value))
                }
                Http2Event::Origin(origins) => out.push(EngineEvent::Origin(origins)),
                Http2Event::RemoteSettings(settings) => {
                    out.push(EngineEvent::RemoteSettings(settings))
                }
                Http2Event::SettingsAck
                | Http2Event::Ping { .. }
                | Http2Event::TunnelEstablished { .. } => {}
            }
        }
        reply.extend_from_slice(&self.session.take_output());
        Ok(())
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        match message {
            EngineMessage::Request(mut request) => {
                let body = std::mem::take(&mut request.body);
                let body = match self.crypto.as_ref() {
                    Some(crypto) if !body.is_empty() => {
                        request
                            .headers
                            .set(crate::crypto::ENCRYPTION_HEADER, crypto.bits().to_string());
                        crypto.encrypt(&body)
                    }
                    _ => body,
                };
                let mut header_list = vec![
                    (":method".to_string(), request.method.clone()),
                    (":scheme".to_string(), request.url.scheme().to_string()),
                    (":path".to_string(), request.request_target()),
                    (":authority".to_string(), request.host_field()?),
                ];
                if let Some(accept) = accept_encoding_value(&self.compressors) {
                    header_list.push(("accept-encoding".to_string(), accept));
                }
                header_list.push(("user-agent".to_string(), self.identity.agent()));
                for (name, value) in request.headers.iter() {
                    header_list.push((name.to_ascii_lowercase(), value.to_string()));
                }
                let stream_id = self.session.send_headers(&header_list, body.is_empty())?;
                if !body.is_empty() {
                    self.session
                        .send_data(stream_id, bytes::Bytes::from(body), true)?;
                }
                dst.extend_from_slice(&self.session.take_output());
                Ok(())
            }
            EngineMessage::Response(stream_id, mut response) => {
                let accept = self.peer_accept.remove(&stream_id);
                let coding = negotiate_encoding(accept.as_deref(), &self.compressors);
                let body = std::mem::take(&mut response.body);
                let body = seal_body(&mut response.headers, body, self.crypto.as_ref(), coding)?;
                let mut header_list =
                    vec![(":status".to_string(), response.status.to_string())];
                header_list.push(("server".to_string(), self.identity.agent()));
                for (name, value) in response.headers.iter() {
                    // connection-specific fields never travel in h2
                    if name.eq_ignore_ascii_case("Connection")
                        || name.eq_ignore_ascii_case("Transfer-Encoding")
                    {
                        continue;
                    }
                    header_list.push((name.to_ascii_lowercase(), value.to_string()));
                }
                self.session
                    .send_response_headers(stream_id, &header_list, body.is_empty())?;
                if !body.is_empty() {
                    self.session
                        .send_data(stream_id, bytes::Bytes::from(body), true)?;
                }
                dst.extend_from_slice(&self.session.take_output());
                Ok(())
            }
            _ => Err(Error::Http1Malformed("message kind not valid for HTTP/2")),
        }
    }

    fn on_settings_change(&mut self, settings: &Http2Settings, dst: &mut BytesMut) {
        self.session.update_local_settings(*settings);
        dst.extend_from_slice(&self.session.take_output());
    }

    fn close(&mut self, dst: &mut BytesMut) -> Result<(), Error> {
        self.session
            .send_goaway(Http2ErrorCode::NoError, "shutting down");
        dst.extend_from_slice(&self.session.take_output());
        Ok(())
    }
}

// ---- WebSocket over HTTP/2 (RFC 8441) ------------------------------------

/// WebSocket frames tunneled through an extended-CONNECT HTTP/2 stream:
/// DATA payloads carry frames verbatim.
pub struct Ws2Engine {
    session: Http2Session,
    pipeline: MessagePipeline,
    tunnel_stream: Option<u32>,
    frame_buf: BytesMut,
}

impl Ws2Engine {
    pub fn new(config: &SchemeConfig, negotiated: &Negotiated) -> Self {
        let mut session = Http2Session::new(true, config.http2);
        session.start();
        Self {
            session,
            pipeline: MessagePipeline::new(
                Role::Client,
                negotiated,
                config.segment_size,
                config.broker_available_size.max(1 << 20),
                config.encryption.as_ref().map(PayloadCrypto::new),
            ),
            tunnel_stream: None,
            frame_buf: BytesMut::new(),
        }
    }

    /// Opens the extended CONNECT; the tunnel is ready once the decode side
    /// observes `:status: 200`.
    pub fn open(&mut self, authority: &str, path: &str, dst: &mut BytesMut) -> Result<u32, Error> {
        let stream_id = self.session.connect_websocket(authority, path)?;
        self.tunnel_stream = Some(stream_id);
        dst.extend_from_slice(&self.session.take_output());
        Ok(stream_id)
    }

    pub fn tunnel_ready(&self) -> bool {
        self.tunnel_stream
            .and_then(|id| self.session.stream(id))
            .map_or(false, |stream| stream.tunnel && stream.headers_received)
    }
}

impl ProtocolEngine for Ws2Engine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        reply: &mut BytesMut,
    ) -> Result<(), Error> {
        let mut events = Vec::new();
        let fed = self.session.feed(buf, &mut events);
        reply.extend_from_slice(&self.session.take_output());
        fed?;
        for event in events {
            match event {
                Http2Event::Data { stream_id, data, .. }
                    if Some(stream_id) == self.tunnel_stream =>
                {
                    self.frame_buf.extend_from_slice(&data);
                    let mut ws_events = Vec::new();
                    self.pipeline.feed(&mut self.frame_buf, &mut ws_events)?;
                    let mut ws_reply = BytesMut::new();
                    for ws_event in ws_events {
                        match ws_event {
                            WsEvent::Message(message) => {
                                out.push(EngineEvent::Message(message))
                            }
                            WsEvent::Ping(payload) => {
                                self.pipeline.encode_pong(payload, &mut ws_reply)?
                            }
                            WsEvent::Pong(payload) => out.push(EngineEvent::Pong(payload)),
                            WsEvent::Close(code, reason) => {
                                self.pipeline.encode_close(
                                    code.unwrap_or(CloseCode::Normal),
                                    "",
                                    &mut ws_reply,
                                )?;
                                out.push(EngineEvent::Close(code, reason));
                            }
                        }
                    }
                    if !ws_reply.is_empty() {
                        self.session.send_data(
                            stream_id,
                            ws_reply.freeze(),
                            false,
                        )?;
                        reply.extend_from_slice(&self.session.take_output());
                    }
                }
                Http2Event::TunnelEstablished { stream_id } => {
                    debug!("websocket tunnel ready on stream {}", stream_id);
                }
                Http2Event::StreamReset { stream_id, .. }
                    if Some(stream_id) == self.tunnel_stream =>
                {
                    out.push(EngineEvent::Close(
                        Some(CloseCode::GoingAway),
                        "tunnel stream reset".to_string(),
                    ));
                }
                Http2Event::GoAway { debug: reason, .. } => {
                    out.push(EngineEvent::Close(None, reason))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        let Some(stream_id) = self.tunnel_stream else {
            return Err(Error::NoUpgrade);
        };
        let mut frames = BytesMut::new();
        match message {
            EngineMessage::Ws(message) => self.pipeline.encode_message(message, &mut frames)?,
            EngineMessage::WsPing(payload) => self.pipeline.encode_ping(payload, &mut frames)?,
            EngineMessage::WsClose(code, reason) => {
                self.pipeline.encode_close(code, &reason, &mut frames)?
            }
            EngineMessage::Data(data) => {
                self.pipeline.encode_message(Message::Binary(data), &mut frames)?
            }
            _ => return Err(Error::Http1Malformed("message kind not valid for websocket")),
        }
        self.session.send_data(stream_id, frames.freeze(), false)?;
        dst.extend_from_slice(&self.session.take_output());
        Ok(())
    }

    fn on_settings_change(&mut self, settings: &Http2Settings, dst: &mut BytesMut) {
        self.session.update_local_settings(*settings);
        dst.extend_from_slice(&self.session.take_output());
    }

    fn close(&mut self, dst: &mut BytesMut) -> Result<(), Error> {
        if let Some(stream_id) = self.tunnel_stream {
            let mut frames = BytesMut::new();
            self.pipeline
                .encode_close(CloseCode::Normal, "", &mut frames)?;
            self.session.send_data(stream_id, frames.freeze(), true)?;
        }
        self.session
            .send_goaway(Http2ErrorCode::NoError, "shutting down");
        dst.extend_from_slice(&self.session.take_output());
        Ok(())
    }
}

/// Tagged dispatch over the concrete engines, so a broker stores one value.
pub enum Engine {
    Raw(RawEngine),
    Http1(Http1Engine),
    Ws1(Ws1Engine),
    Http2(Http2Engine),
    Ws2(Box<Ws2Engine>),
}

impl Engine {
    fn inner(&mut self) -> &mut dyn ProtocolEngine {
        match self {
            Engine::Raw(engine) => engine,
            Engine::Http1(engine) => engine,
            Engine::Ws1(engine) => engine,
            Engine::Http2(engine) => engine,
            Engine::Ws2(engine) => engine.as_mut(),
        }
    }

    /// Bytes an engine owes the peer before any user traffic, e.g. the
    /// HTTP/2 connection preface and initial SETTINGS.
    pub fn startup(&mut self, dst: &mut BytesMut) {
        match self {
            Engine::Http2(engine) => dst.extend_from_slice(&engine.session.take_output()),
            Engine::Ws2(engine) => dst.extend_from_slice(&engine.session.take_output()),
            _ => {}
        }
    }
}

impl ProtocolEngine for Engine {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<EngineEvent>,
        reply: &mut BytesMut,
    ) -> Result<(), Error> {
        self.inner().decode(buf, out, reply)
    }

    fn encode(&mut self, message: EngineMessage, dst: &mut BytesMut) -> Result<(), Error> {
        self.inner().encode(message, dst)
    }

    fn on_settings_change(&mut self, settings: &Http2Settings, dst: &mut BytesMut) {
        self.inner().on_settings_change(settings, dst)
    }

    fn on_eof(&mut self, out: &mut Vec<EngineEvent>) -> Result<(), Error> {
        self.inner().on_eof(out)
    }

    fn close(&mut self, dst: &mut BytesMut) -> Result<(), Error> {
        self.inner().close(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> SchemeConfig {
        SchemeConfig::default()
    }

    #[test]
    fn test_raw_engine_passthrough() {
        let mut engine = RawEngine;
        let mut out = Vec::new();
        let mut reply = BytesMut::new();
        let mut buf = BytesMut::from(&b"hello"[..]);
        engine.decode(&mut buf, &mut out, &mut reply).unwrap();
        assert!(matches!(
            out.as_slice(),
            [EngineEvent::Message(Message::Binary(data))] if data == b"hello"
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ws1_ping_answered_in_reply() {
        let negotiated = Negotiated::default();
        let mut server = Ws1Engine::new(Role::Server, &negotiated, &scheme());
        // a client ping, masked
        let client_codec =
            crate::ws::frame::FrameCodec::new(Role::Client, usize::MAX, false);
        let mut wire = BytesMut::new();
        client_codec.encode(
            &crate::ws::frame::Frame::new(
                true,
                crate::ws::frame::OpCode::Ping,
                b"hb".to_vec(),
                false,
            ),
            false,
            &mut wire,
        );
        let mut out = Vec::new();
        let mut reply = BytesMut::new();
        server.decode(&mut wire, &mut out, &mut reply).unwrap();
        assert!(out.is_empty());
        // the reply buffer holds an unmasked pong with the same payload
        let client_decoder =
            crate::ws::frame::FrameCodec::new(Role::Client, usize::MAX, false);
        let pong = client_decoder.decode(&mut reply).unwrap().unwrap();
        assert_eq!(pong.opcode, crate::ws::frame::OpCode::Pong);
        assert_eq!(pong.payload, b"hb");
    }

    #[test]
    fn test_http1_client_roundtrip() {
        let mut engine = Http1Engine::new(&scheme(), false);
        let request = Request::new("GET", url::Url::parse("http://h/x").unwrap());
        let mut wire = BytesMut::new();
        engine
            .encode(EngineMessage::Request(Box::new(request)), &mut wire)
            .unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(text.contains("User-Agent: "));

        let mut out = Vec::new();
        let mut reply = BytesMut::new();
        let mut response = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..],
        );
        engine.decode(&mut response, &mut out, &mut reply).unwrap();
        assert!(out.iter().any(|event| matches!(
            event,
            EngineEvent::Entity(response) if response.status == 200 && response.body == b"ok"
        )));
        assert!(out.iter().any(|event| matches!(event, EngineEvent::Complete)));
    }

    #[test]
    fn test_http1_server_parses_request() {
        let mut engine = Http1Engine::new(&scheme(), true);
        let mut out = Vec::new();
        let mut reply = BytesMut::new();
        let mut wire = BytesMut::from(
            &b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabc"[..],
        );
        engine.decode(&mut wire, &mut out, &mut reply).unwrap();
        assert!(matches!(
            out.as_slice(),
            [EngineEvent::Request(request)]
                if request.method == "POST" && request.body == b"abc"
        ));
    }

    #[test]
    fn test_http2_engines_exchange() {
        let mut client = Http2Engine::new(&scheme(), false);
        let mut server = Http2Engine::new(&scheme(), true);

        let mut to_server = BytesMut::new();
        to_server.extend_from_slice(&client.session.take_output());
        let request = Request::new("GET", url::Url::parse("https://example.org/").unwrap());
        client
            .encode(EngineMessage::Request(Box::new(request)), &mut to_server)
            .unwrap();

        let mut server_events = Vec::new();
        let mut server_reply = BytesMut::new();
        server_reply.extend_from_slice(&server.session.take_output());
        server
            .decode(&mut to_server, &mut server_events, &mut server_reply)
            .unwrap();
        let stream_id = server_events
            .iter()
            .find_map(|event| match event {
                EngineEvent::Request(request) => {
                    assert_eq!(request.method, "GET");
                    Some(1)
                }
                _ => None,
            })
            .expect("server saw the request");

        let mut response = Response::new(200);
        response.body = b"abcd".to_vec();
        server
            .encode(EngineMessage::Response(stream_id, Box::new(response)), &mut server_reply)
            .unwrap();

        let mut client_events = Vec::new();
        let mut client_reply = BytesMut::new();
        client
            .decode(&mut server_reply, &mut client_events, &mut client_reply)
            .unwrap();
        assert!(client_events.iter().any(|event| matches!(
            event,
            EngineEvent::Entity(response) if response.status == 200 && response.body == b"abcd"
        )));
        assert!(client_events
            .iter()
            .any(|event| matches!(event, EngineEvent::StreamEnd(1))));
    }
}
