use crate::http2::Http2ErrorCode;
use crate::ws::frame::CloseCode;
use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

/// Coarse error classification surfaced through the `error` callback,
/// one per subsystem of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Tls,
    Dns,
    ProtocolHttp1,
    ProtocolHttp2,
    ProtocolWs,
    Proxy,
    Auth,
    Encryption,
    Compression,
    Resource,
}

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    #[error("transport `{0}` is not supported on this platform")]
    UnsupportedTransport(&'static str),

    #[error("operation not permitted on an open broker")]
    BrokerOpen,

    #[error("unknown broker id: {0}")]
    UnknownBroker(u64),

    #[error("unknown scheme id: {0}")]
    UnknownScheme(u64),

    // TLS Errors
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    // DNS Errors
    #[error("DNS query for `{0}` timed out")]
    DnsTimeout(String),

    #[error("DNS resolution failed for `{0}`: {1}")]
    ResolveError(String, String),

    // URL / HTTP Errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("malformed HTTP/1 message: {0}")]
    Http1Malformed(&'static str),

    #[error("HTTP/1 limit exceeded: {0}")]
    Http1Oversize(&'static str),

    // HTTP/2 Errors
    #[error("HTTP/2 connection error {0:?}: {1}")]
    Http2Connection(Http2ErrorCode, &'static str),

    #[error("HTTP/2 stream {0} error {1:?}")]
    Http2Stream(u32, Http2ErrorCode),

    #[error("HPACK decoding failed: {0}")]
    Hpack(&'static str),

    // Handshake Errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Sever didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("no offered subprotocol was selected by the server")]
    NoSubprotocol,

    #[error("unknown parameter `{0}` inside a negotiated extension")]
    UnknownExtensionParameter(String),

    // WebSocket Framing Errors
    #[error("websocket protocol violation ({1})")]
    WsProtocol(CloseCode, &'static str),

    #[error("connection already closing, frame rejected")]
    WsClosing,

    // Proxy Errors
    #[error("proxy negotiation failed: {0}")]
    ProxyNegotiation(String),

    #[error("proxy requires authentication (407)")]
    ProxyAuthRequired,

    #[error("SOCKS5 request rejected with code {0:#04x}")]
    SocksReply(u8),

    // Authentication Errors
    #[error("credentials rejected after {0} attempts")]
    AuthExhausted(usize),

    #[error("malformed authentication challenge")]
    AuthChallenge,

    // Encryption / Compression Errors
    #[error("payload decryption failed")]
    DecryptFailed,

    #[error("inflate failed: {0}")]
    InflateFailed(String),

    #[error("deflate failed: {0}")]
    DeflateFailed(String),

    // Resource Errors
    #[error("payload queue is full, {0} bytes rejected")]
    QueueFull(usize),
}

impl Error {
    /// Maps the error onto the subsystem kind reported via the `error`
    /// callback.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout { .. }
            | Error::IOError { .. }
            | Error::CommunicationError
            | Error::UnsupportedTransport(_)
            | Error::BrokerOpen
            | Error::UnknownBroker(_)
            | Error::UnknownScheme(_) => ErrorKind::Transport,
            Error::DomainError { .. } | Error::TlsHandshake(_) => ErrorKind::Tls,
            Error::DnsTimeout(_) | Error::ResolveError(..) => ErrorKind::Dns,
            Error::URLParseError { .. }
            | Error::InvalidSchemeURL
            | Error::URLNoHost
            | Error::HttpParseError { .. }
            | Error::Http1Malformed(_)
            | Error::Http1Oversize(_) => ErrorKind::ProtocolHttp1,
            Error::Http2Connection(..) | Error::Http2Stream(..) | Error::Hpack(_) => {
                ErrorKind::ProtocolHttp2
            }
            Error::InvalidHTTPHandshake
            | Error::NoUpgrade
            | Error::InvalidAcceptKey
            | Error::NoSecWebsocketKey
            | Error::NoSubprotocol
            | Error::UnknownExtensionParameter(_)
            | Error::FromUtf8Error { .. }
            | Error::WsProtocol(..)
            | Error::WsClosing => ErrorKind::ProtocolWs,
            Error::ProxyNegotiation(_) | Error::ProxyAuthRequired | Error::SocksReply(_) => {
                ErrorKind::Proxy
            }
            Error::AuthExhausted(_) | Error::AuthChallenge => ErrorKind::Auth,
            Error::DecryptFailed => ErrorKind::Encryption,
            Error::InflateFailed(_) | Error::DeflateFailed(_) => ErrorKind::Compression,
            Error::QueueFull(_) => ErrorKind::Resource,
        }
    }

    /// The RFC 6455 close code a websocket peer should observe for this error,
    /// when one applies.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::WsProtocol(code, _) => Some(*code),
            Error::FromUtf8Error { .. } => Some(CloseCode::InvalidPayload),
            Error::InflateFailed(_) => Some(CloseCode::InvalidPayload),
            Error::QueueFull(_) => Some(CloseCode::MessageTooBig),
            _ => None,
        }
    }
}
