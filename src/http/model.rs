use crate::compression::{decode_body, encode_body};
use crate::config::Compressor;
use crate::crypto::{PayloadCrypto, ENCRYPTION_HEADER};
use crate::error::Error;
use crate::http::headers::Headers;
use url::Url;

/// Crate identity emitted in `User-Agent` / `Server` headers.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub short_name: String,
    pub version: String,
}

impl Default for Identity {
    fn default() -> Self {
        Identity {
            name: "wire-flow".to_string(),
            short_name: "wflow".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Identity {
    pub fn agent(&self) -> String {
        format!("{} ({}/{})", self.name, self.short_name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Http2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url,
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Path plus query, the request target of the start line.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Host[:port] for the Host header; default ports are dropped.
    pub fn host_field(&self) -> Result<String, Error> {
        let host = self.url.host_str().ok_or(Error::URLNoHost)?;
        Ok(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// The Accept-Encoding value advertising the configured codings in
/// preference order.
pub fn accept_encoding_value(compressors: &[Compressor]) -> Option<String> {
    let tokens: Vec<&str> = compressors
        .iter()
        .filter(|compressor| **compressor != Compressor::None)
        .map(Compressor::token)
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(", "))
    }
}

/// Picks the first configured coding the peer accepts.
pub fn negotiate_encoding(accept: Option<&str>, configured: &[Compressor]) -> Compressor {
    let Some(accept) = accept else {
        return Compressor::None;
    };
    let accepted: Vec<&str> = accept.split(',').map(str::trim).collect();
    for compressor in configured {
        if *compressor == Compressor::None {
            continue;
        }
        if accepted
            .iter()
            .any(|token| token.eq_ignore_ascii_case(compressor.token()))
        {
            return *compressor;
        }
    }
    Compressor::None
}

fn compressor_for_token(token: &str) -> Option<Compressor> {
    match token.trim().to_ascii_lowercase().as_str() {
        "deflate" => Some(Compressor::Deflate),
        "gzip" => Some(Compressor::Gzip),
        "br" => Some(Compressor::Brotli),
        "identity" => Some(Compressor::None),
        _ => None,
    }
}

/// Prepares a body for the wire: encryption first, then the content coding,
/// finally the framing headers. The caller's headers are updated in place.
pub fn seal_body(
    headers: &mut Headers,
    body: Vec<u8>,
    crypto: Option<&PayloadCrypto>,
    compressor: Compressor,
) -> Result<Vec<u8>, Error> {
    let mut body = body;
    if let Some(crypto) = crypto {
        if !body.is_empty() {
            body = crypto.encrypt(&body);
            headers.set(ENCRYPTION_HEADER, crypto.bits().to_string());
        }
    }
    if compressor != Compressor::None && !body.is_empty() {
        let encoded = encode_body(compressor, &body)?;
        // A coding that grows the body is dropped in favor of identity
        if encoded.len() < body.len() {
            body = encoded;
            headers.set("Content-Encoding", compressor.token());
        }
    }
    headers.set("Content-Length", body.len().to_string());
    Ok(body)
}

/// Reverses `seal_body` on a received message: content coding first, then
/// decryption when the peer advertised a cipher. A missing encryption header
/// leaves the payload as-is.
pub fn open_body(
    headers: &Headers,
    body: Vec<u8>,
    crypto: Option<&PayloadCrypto>,
) -> Result<Vec<u8>, Error> {
    let mut body = body;
    if let Some(value) = headers.get("Content-Encoding") {
        let compressor = compressor_for_token(value)
            .ok_or(Error::InflateFailed(format!("unknown coding `{}`", value)))?;
        body = decode_body(compressor, &body)?;
    }
    if let Some(crypto) = crypto {
        let hint = headers
            .get(ENCRYPTION_HEADER)
            .and_then(|value| value.trim().parse::<u16>().ok());
        body = crypto.decrypt_hinted(hint, &body)?;
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AesSize, Encryption};

    #[test]
    fn test_request_target_and_host() {
        let request = Request::new("get", Url::parse("http://example.org:8080/a/b?c=d").unwrap());
        assert_eq!(request.method, "GET");
        assert_eq!(request.request_target(), "/a/b?c=d");
        assert_eq!(request.host_field().unwrap(), "example.org:8080");
        let plain = Request::new("GET", Url::parse("http://example.org/").unwrap());
        assert_eq!(plain.host_field().unwrap(), "example.org");
    }

    #[test]
    fn test_negotiate_encoding_prefers_configured_order() {
        let configured = [Compressor::Brotli, Compressor::Gzip];
        assert_eq!(
            negotiate_encoding(Some("gzip, br"), &configured),
            Compressor::Brotli
        );
        assert_eq!(
            negotiate_encoding(Some("gzip"), &configured),
            Compressor::Gzip
        );
        assert_eq!(
            negotiate_encoding(Some("deflate"), &configured),
            Compressor::None
        );
        assert_eq!(negotiate_encoding(None, &configured), Compressor::None);
    }

    #[test]
    fn test_accept_encoding_value() {
        assert_eq!(
            accept_encoding_value(&[Compressor::Gzip, Compressor::Brotli]).unwrap(),
            "gzip, br"
        );
        assert!(accept_encoding_value(&[Compressor::None]).is_none());
    }

    #[test]
    fn test_seal_open_roundtrip_with_crypto() {
        let crypto = PayloadCrypto::new(&Encryption {
            pass: "p".to_string(),
            salt: "s".to_string(),
            cipher: AesSize::Aes256,
        });
        let mut headers = Headers::new();
        let body = b"repetitive body ".repeat(64).to_vec();
        let sealed = seal_body(&mut headers, body.clone(), Some(&crypto), Compressor::Gzip).unwrap();
        assert_eq!(headers.get(ENCRYPTION_HEADER), Some("256"));
        assert_eq!(
            headers.get("Content-Length"),
            Some(sealed.len().to_string().as_str())
        );
        let opened = open_body(&headers, sealed, Some(&crypto)).unwrap();
        assert_eq!(opened, body);
    }

    #[test]
    fn test_open_without_hint_passes_through() {
        let crypto = PayloadCrypto::new(&Encryption {
            pass: "p".to_string(),
            salt: "s".to_string(),
            cipher: AesSize::Aes128,
        });
        let headers = Headers::new();
        let body = b"plain".to_vec();
        assert_eq!(open_body(&headers, body.clone(), Some(&crypto)).unwrap(), body);
    }

    #[test]
    fn test_incompressible_body_stays_identity() {
        let mut headers = Headers::new();
        // tiny bodies expand under every coding
        let body = b"x".to_vec();
        let sealed = seal_body(&mut headers, body.clone(), None, Compressor::Gzip).unwrap();
        assert_eq!(sealed, body);
        assert!(headers.get("Content-Encoding").is_none());
    }
}
