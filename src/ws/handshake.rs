use crate::error::Error;
use crate::http::headers::Headers;
use crate::ws::extensions::{
    extensions_header_value, merge_extensions, parse_extensions, Extensions,
};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use log::debug;
use rand::random;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use url::Url;

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub(crate) const WS_VERSION: &str = "13";

const MAX_HANDSHAKE_HEAD: usize = 1024 * 16;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = random();
    BASE64_STANDARD.encode(random_bytes)
}

/// Everything the handshake settled on, handed to the message pipeline.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    pub extensions: Option<Extensions>,
    pub subprotocol: Option<String>,
}

/// Client side of the upgrade: owns the nonce, builds the request head and
/// validates the 101 response against the offer.
pub struct ClientHandshake {
    pub key: String,
    url: Url,
    offer: Option<Extensions>,
    subprotocols: Vec<String>,
    user_agent: String,
}

impl ClientHandshake {
    pub fn new(
        url: Url,
        offer: Option<Extensions>,
        subprotocols: Vec<String>,
        user_agent: String,
    ) -> Self {
        Self {
            key: generate_websocket_key(),
            url,
            offer,
            subprotocols,
            user_agent,
        }
    }

    /// The `Host` field value: port is omitted when the URL carries none.
    fn host_field(&self) -> Result<String, Error> {
        let host = self.url.host_str().ok_or(Error::URLNoHost)?;
        Ok(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// Builds the upgrade request head. Everything is already known, so the
    /// head is assembled as a string and converted to bytes at send time.
    pub fn request(&self) -> Result<String, Error> {
        let request_path = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nUser-Agent: {}\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: {}\r\n",
            request_path,
            self.host_field()?,
            self.user_agent,
            self.key,
            WS_VERSION,
        );
        if !self.subprotocols.is_empty() {
            request.push_str(&format!(
                "Sec-WebSocket-Protocol: {}\r\n",
                self.subprotocols.join(", ")
            ));
        }
        if let Some(offer) = &self.offer {
            if let Some(value) = extensions_header_value(offer) {
                request.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", value));
            }
        }
        request.push_str("\r\n");
        Ok(request)
    }

    /// Validates the server's answer: status 101, the accept digest, at most
    /// one negotiated extension and at most one of the offered subprotocols.
    pub fn validate_response(&self, status: u16, headers: &Headers) -> Result<Negotiated, Error> {
        if status != 101 {
            return Err(Error::NoUpgrade);
        }
        if !headers.has_token("Connection", "upgrade")
            || !headers
                .get("Upgrade")
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        {
            return Err(Error::NoUpgrade);
        }
        let accept = headers.get("Sec-WebSocket-Accept").unwrap_or_default();
        if accept != generate_websocket_accept_value(&self.key) {
            return Err(Error::InvalidAcceptKey);
        }

        let extensions = match headers.get("Sec-WebSocket-Extensions") {
            // The client only honors what it actually offered
            Some(value) if self.offer.is_some() => parse_extensions(value)?,
            Some(_) => None,
            None => None,
        };

        let subprotocol = match headers.get("Sec-WebSocket-Protocol") {
            Some(answer) => {
                if !self
                    .subprotocols
                    .iter()
                    .any(|offered| offered.eq_ignore_ascii_case(answer))
                {
                    // The server invented a subprotocol we never offered
                    return Err(Error::NoSubprotocol);
                }
                Some(answer.to_string())
            }
            None if !self.subprotocols.is_empty() => {
                // A client that requires a subprotocol closes with 1002;
                // surfaced here so the caller can emit the close frame
                return Err(Error::NoSubprotocol);
            }
            None => None,
        };

        debug!(
            "websocket upgrade accepted, extensions: {:?}, subprotocol: {:?}",
            extensions, subprotocol
        );
        Ok(Negotiated {
            extensions,
            subprotocol,
        })
    }
}

/// Server side: answers an upgrade request, merging the client's extension
/// offer with the locally configured defaults.
pub struct ServerHandshake {
    pub defaults: Option<Extensions>,
    pub subprotocols: Vec<String>,
    pub server_name: String,
}

impl ServerHandshake {
    /// Validates the request head and builds the 101 response. Returns the
    /// response head plus what was negotiated.
    pub fn accept(
        &self,
        method: &str,
        headers: &Headers,
    ) -> Result<(String, Negotiated), Error> {
        if !method.eq_ignore_ascii_case("GET") {
            return Err(Error::InvalidHTTPHandshake);
        }
        if !headers.has_token("Connection", "upgrade")
            || !headers
                .get("Upgrade")
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        {
            return Err(Error::InvalidHTTPHandshake);
        }
        let key = headers
            .get("Sec-WebSocket-Key")
            .ok_or(Error::NoSecWebsocketKey)?;

        let client_extensions = match headers.get("Sec-WebSocket-Extensions") {
            Some(value) => parse_extensions(value)?,
            None => None,
        };
        let extensions = merge_extensions(self.defaults.clone(), client_extensions);

        // The server selects exactly one offered subprotocol or none
        let subprotocol = headers
            .get("Sec-WebSocket-Protocol")
            .and_then(|offered| {
                offered.split(',').map(str::trim).find(|candidate| {
                    self.subprotocols
                        .iter()
                        .any(|own| own.eq_ignore_ascii_case(candidate))
                })
            })
            .map(ToOwned::to_owned);

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nServer: {}\r\nSec-WebSocket-Accept: {}\r\n",
            self.server_name,
            generate_websocket_accept_value(key),
        );
        if let Some(extensions) = &extensions {
            if let Some(value) = extensions_header_value(extensions) {
                response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", value));
            }
        }
        if let Some(subprotocol) = &subprotocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocol));
        }
        response.push_str("\r\n");

        Ok((
            response,
            Negotiated {
                extensions,
                subprotocol,
            },
        ))
    }
}

/// Reads one HTTP message head off the stream, bounded in size and time so a
/// frozen or malicious peer cannot park the task forever.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BytesMut, Error> {
    let mut head = BytesMut::with_capacity(1024);
    timeout(HANDSHAKE_TIMEOUT, async {
        let mut tmp_buf = vec![0u8; 1024];
        loop {
            let n = stream.read(&mut tmp_buf).await?;
            if n == 0 {
                return Err(Error::Http1Malformed("connection closed during handshake"));
            }
            head.extend_from_slice(&tmp_buf[..n]);
            if head.windows(4).any(|window| window == b"\r\n\r\n") {
                return Ok(());
            }
            if head.len() > MAX_HANDSHAKE_HEAD {
                return Err(Error::Http1Oversize("handshake head above 16 KiB"));
            }
        }
    })
    .await??;
    Ok(head)
}

/// Parses a response head with httparse doing the line work. Returns
/// `(status, headers, consumed)`; bytes past `consumed` already belong to
/// the upgraded protocol.
pub fn parse_response_head(head: &[u8]) -> Result<(u16, Headers, usize), Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);
    match response.parse(head)? {
        httparse::Status::Partial => Err(Error::Http1Malformed("partial response head")),
        httparse::Status::Complete(consumed) => {
            let mut headers = Headers::new();
            for header in response.headers.iter() {
                headers.append(
                    header.name.to_string(),
                    String::from_utf8_lossy(header.value).to_string(),
                );
            }
            Ok((response.code.unwrap_or_default(), headers, consumed))
        }
    }
}

/// Parses a request head; returns `(method, path, headers, consumed)`.
pub fn parse_request_head(head: &[u8]) -> Result<(String, String, Headers, usize), Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut header_storage);
    match request.parse(head)? {
        httparse::Status::Partial => Err(Error::Http1Malformed("partial request head")),
        httparse::Status::Complete(consumed) => {
            let mut headers = Headers::new();
            for header in request.headers.iter() {
                headers.append(
                    header.name.to_string(),
                    String::from_utf8_lossy(header.value).to_string(),
                );
            }
            Ok((
                request.method.unwrap_or_default().to_string(),
                request.path.unwrap_or_default().to_string(),
                headers,
                consumed,
            ))
        }
    }
}

/// Drives a full client upgrade over an already connected stream. Returns
/// the negotiation outcome plus any frame bytes read past the head.
pub async fn client_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    handshake: &ClientHandshake,
) -> Result<(Negotiated, Vec<u8>), Error> {
    stream
        .write_all(handshake.request()?.as_bytes())
        .await?;
    stream.flush().await?;
    let head = read_head(stream).await?;
    let (status, headers, consumed) = parse_response_head(&head)?;
    let negotiated = handshake.validate_response(status, &headers)?;
    Ok((negotiated, head[consumed..].to_vec()))
}

/// Drives a full server-side upgrade over an accepted stream.
pub async fn server_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    handshake: &ServerHandshake,
) -> Result<(Negotiated, Vec<u8>), Error> {
    let head = read_head(stream).await?;
    let (method, _path, headers, consumed) = parse_request_head(&head)?;
    let (response, negotiated) = handshake.accept(&method, &headers)?;
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok((negotiated, head[consumed..].to_vec()))
}
