use crate::error::Error;
use crate::http::headers::Headers;
use crate::http::model::Version;
use log::trace;

/// Where the parser currently sits in the message grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    RequestLine,
    StatusLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Done,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Parser limits; exceeding any of them breaks the message.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Longest single line, which also bounds method and URI length.
    pub max_line: usize,
    pub max_headers: usize,
    /// Total size of start line plus headers.
    pub max_preamble: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_line: 8 * 1024,
            max_headers: 100,
            max_preamble: 64 * 1024,
        }
    }
}

// Sentinel for a response body that runs to connection close.
const READ_TO_EOF: u64 = u64::MAX;

/// Byte-wise incremental HTTP/1.x parser.
///
/// `parse` consumes as much of the input as it can and reports how many bytes
/// it took, so the caller can advance its buffer and call again once more
/// data arrived. All framing variants are handled: Content-Length bodies,
/// chunked transfer with trailers and folded lines, and responses delimited
/// by connection close.
pub struct Http1Parser {
    kind: MessageKind,
    state: State,
    limits: Limits,
    line: Vec<u8>,
    preamble_len: usize,

    pub method: String,
    pub uri: String,
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub trailers: Headers,
    pub body: Vec<u8>,

    chunked: bool,
    remaining: u64,
    // set once the zero chunk or the final body byte went through
    chunk_data_pending_crlf: bool,
}

impl Http1Parser {
    pub fn new(kind: MessageKind, limits: Limits) -> Self {
        Self {
            kind,
            state: match kind {
                MessageKind::Request => State::RequestLine,
                MessageKind::Response => State::StatusLine,
            },
            limits,
            line: Vec::new(),
            preamble_len: 0,
            method: String::new(),
            uri: String::new(),
            version: Version::Http11,
            status: 0,
            reason: String::new(),
            headers: Headers::new(),
            trailers: Headers::new(),
            body: Vec::new(),
            chunked: false,
            remaining: 0,
            chunk_data_pending_crlf: false,
        }
    }

    pub fn new_request() -> Self {
        Self::new(MessageKind::Request, Limits::default())
    }

    pub fn new_response() -> Self {
        Self::new(MessageKind::Response, Limits::default())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Resets for the next message on a kept-alive connection.
    pub fn reset(&mut self) {
        *self = Self::new(self.kind, self.limits);
    }

    /// Feeds bytes into the parser, returning how many were consumed. The
    /// remainder (anything after the end of a completed message) belongs to
    /// the next message or to the upgraded protocol.
    pub fn parse(&mut self, input: &[u8]) -> Result<usize, Error> {
        let mut consumed = 0;
        while consumed < input.len() && !matches!(self.state, State::Done | State::Broken) {
            match self.state {
                State::RequestLine | State::StatusLine | State::Headers
                | State::ChunkSize | State::ChunkTrailer => {
                    match self.take_line(&input[consumed..])? {
                        Some(taken) => {
                            consumed += taken;
                            let line = std::mem::take(&mut self.line);
                            self.process_line(&line).inspect_err(|_| {
                                self.state = State::Broken;
                            })?;
                        }
                        None => {
                            consumed = input.len();
                        }
                    }
                }
                State::Body => {
                    if self.remaining == READ_TO_EOF {
                        self.body.extend_from_slice(&input[consumed..]);
                        consumed = input.len();
                    } else {
                        let take =
                            std::cmp::min(self.remaining, (input.len() - consumed) as u64) as usize;
                        self.body.extend_from_slice(&input[consumed..consumed + take]);
                        consumed += take;
                        self.remaining -= take as u64;
                        if self.remaining == 0 {
                            self.state = State::Done;
                        }
                    }
                }
                State::ChunkData => {
                    if self.chunk_data_pending_crlf {
                        // swallow the CRLF that terminates every chunk
                        let rest = &input[consumed..];
                        if let Some(position) = rest.iter().position(|&byte| byte == b'\n') {
                            consumed += position + 1;
                            self.chunk_data_pending_crlf = false;
                            self.state = State::ChunkSize;
                        } else {
                            consumed = input.len();
                        }
                    } else {
                        let take =
                            std::cmp::min(self.remaining, (input.len() - consumed) as u64) as usize;
                        self.body.extend_from_slice(&input[consumed..consumed + take]);
                        consumed += take;
                        self.remaining -= take as u64;
                        if self.remaining == 0 {
                            self.chunk_data_pending_crlf = true;
                        }
                    }
                }
                State::Done | State::Broken => unreachable!(),
            }
        }
        Ok(consumed)
    }

    /// Finalizes a read-to-close response body when the peer hung up.
    pub fn on_eof(&mut self) -> Result<(), Error> {
        if self.state == State::Body && self.remaining == READ_TO_EOF {
            self.state = State::Done;
            return Ok(());
        }
        if self.state != State::Done {
            self.state = State::Broken;
            return Err(Error::Http1Malformed("connection closed mid-message"));
        }
        Ok(())
    }

    // Accumulates bytes up to and including a LF. Returns how many input
    // bytes were taken when a full line landed, None when more are needed.
    fn take_line(&mut self, input: &[u8]) -> Result<Option<usize>, Error> {
        match input.iter().position(|&byte| byte == b'\n') {
            Some(position) => {
                self.line.extend_from_slice(&input[..position]);
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                self.check_limits(position + 1)?;
                Ok(Some(position + 1))
            }
            None => {
                self.line.extend_from_slice(input);
                self.check_limits(input.len())?;
                Ok(None)
            }
        }
    }

    fn check_limits(&mut self, taken: usize) -> Result<(), Error> {
        if self.line.len() > self.limits.max_line {
            self.state = State::Broken;
            return Err(Error::Http1Oversize("line above the configured maximum"));
        }
        if matches!(
            self.state,
            State::RequestLine | State::StatusLine | State::Headers
        ) {
            self.preamble_len += taken;
            if self.preamble_len > self.limits.max_preamble {
                self.state = State::Broken;
                return Err(Error::Http1Oversize("preamble above the configured maximum"));
            }
        }
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), Error> {
        match self.state {
            State::RequestLine => {
                if line.is_empty() {
                    // tolerate a stray CRLF before the request line
                    return Ok(());
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::Http1Malformed("request line is not ASCII"))?;
                let mut parts = text.split_whitespace();
                self.method = parts
                    .next()
                    .ok_or(Error::Http1Malformed("missing method"))?
                    .to_string();
                self.uri = parts
                    .next()
                    .ok_or(Error::Http1Malformed("missing request target"))?
                    .to_string();
                self.version = parse_version(
                    parts
                        .next()
                        .ok_or(Error::Http1Malformed("missing HTTP version"))?,
                )?;
                self.state = State::Headers;
                Ok(())
            }
            State::StatusLine => {
                if line.is_empty() {
                    return Ok(());
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::Http1Malformed("status line is not ASCII"))?;
                let mut parts = text.splitn(3, ' ');
                self.version = parse_version(
                    parts
                        .next()
                        .ok_or(Error::Http1Malformed("missing HTTP version"))?,
                )?;
                self.status = parts
                    .next()
                    .and_then(|code| code.parse().ok())
                    .ok_or(Error::Http1Malformed("unparseable status code"))?;
                self.reason = parts.next().unwrap_or_default().to_string();
                self.state = State::Headers;
                Ok(())
            }
            State::Headers => {
                if line.is_empty() {
                    return self.headers_complete();
                }
                self.push_header_line(line, false)
            }
            State::ChunkSize => {
                if line.is_empty() {
                    // tolerate the empty line some encoders leave behind
                    return Ok(());
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::Http1Malformed("chunk size is not ASCII"))?;
                // chunk extensions after ';' are ignored
                let size_text = text.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size_text, 16)
                    .map_err(|_| Error::Http1Malformed("unparseable chunk size"))?;
                if size == 0 {
                    self.state = State::ChunkTrailer;
                } else {
                    self.remaining = size;
                    self.state = State::ChunkData;
                }
                Ok(())
            }
            State::ChunkTrailer => {
                if line.is_empty() {
                    trace!("chunked body complete, {} bytes", self.body.len());
                    self.state = State::Done;
                    return Ok(());
                }
                self.push_header_line(line, true)
            }
            _ => unreachable!("process_line in state {:?}", self.state),
        }
    }

    fn push_header_line(&mut self, line: &[u8], trailer: bool) -> Result<(), Error> {
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::Http1Malformed("header line is not ASCII"))?;
        let target = if trailer {
            &mut self.trailers
        } else {
            &mut self.headers
        };
        // A line starting with whitespace folds into the previous value
        if text.starts_with(' ') || text.starts_with('\t') {
            if target.is_empty() {
                return Err(Error::Http1Malformed("folded line without a header"));
            }
            target.extend_last(text);
            return Ok(());
        }
        let (name, value) = text
            .split_once(':')
            .ok_or(Error::Http1Malformed("header line without a colon"))?;
        if name.ends_with(' ') || name.ends_with('\t') {
            return Err(Error::Http1Malformed("whitespace before the header colon"));
        }
        target.append(name.to_string(), value.trim().to_string());
        if target.len() > self.limits.max_headers {
            return Err(Error::Http1Oversize("too many headers"));
        }
        Ok(())
    }

    fn headers_complete(&mut self) -> Result<(), Error> {
        // Transfer-Encoding: chunked overrides Content-Length
        self.chunked = self.headers.has_token("Transfer-Encoding", "chunked");
        if self.chunked {
            self.state = State::ChunkSize;
            return Ok(());
        }
        if let Some(value) = self.headers.get("Content-Length") {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::Http1Malformed("unparseable Content-Length"))?;
            if length == 0 {
                self.state = State::Done;
            } else {
                self.remaining = length;
                self.state = State::Body;
            }
            return Ok(());
        }
        match self.kind {
            // A request with neither framing header has no body
            MessageKind::Request => self.state = State::Done,
            MessageKind::Response => {
                // 1xx/204/304 never carry a body; everything else runs to
                // connection close
                if self.status < 200 || self.status == 204 || self.status == 304 {
                    self.state = State::Done;
                } else {
                    self.remaining = READ_TO_EOF;
                    self.state = State::Body;
                }
            }
        }
        Ok(())
    }
}

fn parse_version(token: &str) -> Result<Version, Error> {
    match token {
        "HTTP/1.1" => Ok(Version::Http11),
        "HTTP/1.0" => Ok(Version::Http10),
        _ => Err(Error::Http1Malformed("unknown HTTP version")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Http1Parser, wire: &[u8]) -> usize {
        parser.parse(wire).unwrap()
    }

    #[test]
    fn test_get_request_without_body() {
        let mut parser = Http1Parser::new_request();
        let wire = b"GET /index.html?x=1 HTTP/1.1\r\nHost: example.org\r\nAccept: */*\r\n\r\nEXTRA";
        let consumed = feed_all(&mut parser, wire);
        assert!(parser.is_done());
        // The trailing EXTRA belongs to the next message
        assert_eq!(consumed, wire.len() - 5);
        assert_eq!(parser.method, "GET");
        assert_eq!(parser.uri, "/index.html?x=1");
        assert_eq!(parser.headers.get("host"), Some("example.org"));
    }

    #[test]
    fn test_response_with_content_length() {
        let mut parser = Http1Parser::new_response();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nabcd";
        feed_all(&mut parser, wire);
        assert!(parser.is_done());
        assert_eq!(parser.status, 200);
        assert_eq!(parser.reason, "OK");
        assert_eq!(parser.body, b"abcd");
    }

    #[test]
    fn test_reentrant_byte_by_byte() {
        let mut parser = Http1Parser::new_request();
        let wire = b"POST /u HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyz";
        for &byte in wire.iter() {
            parser.parse(&[byte]).unwrap();
        }
        assert!(parser.is_done());
        assert_eq!(parser.body, b"xyz");
    }

    #[test]
    fn test_chunked_post_scenario() {
        // S3: three chunks assemble into one body
        let mut parser = Http1Parser::new_request();
        let wire = b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
                     4\r\naaaa\r\n4\r\nbbbb\r\n4\r\ncccc\r\n0\r\n\r\n";
        let consumed = feed_all(&mut parser, wire);
        assert_eq!(consumed, wire.len());
        assert!(parser.is_done());
        assert_eq!(parser.body, b"aaaabbbbcccc");
    }

    #[test]
    fn test_chunked_overrides_content_length() {
        let mut parser = Http1Parser::new_response();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 9999\r\nTransfer-Encoding: chunked\r\n\r\n\
                     2\r\nok\r\n0\r\n\r\n";
        feed_all(&mut parser, wire);
        assert!(parser.is_done());
        assert_eq!(parser.body, b"ok");
    }

    #[test]
    fn test_chunk_extension_and_trailer() {
        let mut parser = Http1Parser::new_response();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5;ext=1\r\nhello\r\n0\r\nX-Checksum: abc\r\n\r\n";
        feed_all(&mut parser, wire);
        assert!(parser.is_done());
        assert_eq!(parser.body, b"hello");
        assert_eq!(parser.trailers.get("x-checksum"), Some("abc"));
    }

    #[test]
    fn test_folded_header() {
        let mut parser = Http1Parser::new_request();
        let wire = b"GET / HTTP/1.1\r\nX-Long: part one\r\n  part two\r\n\r\n";
        feed_all(&mut parser, wire);
        assert!(parser.is_done());
        assert_eq!(parser.headers.get("x-long"), Some("part one part two"));
    }

    #[test]
    fn test_response_body_to_eof() {
        let mut parser = Http1Parser::new_response();
        feed_all(&mut parser, b"HTTP/1.1 200 OK\r\n\r\npartial body");
        assert!(!parser.is_done());
        parser.parse(b" and more").unwrap();
        parser.on_eof().unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.body, b"partial body and more");
    }

    #[test]
    fn test_no_body_status_codes() {
        for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
            let mut parser = Http1Parser::new_response();
            let wire = format!("HTTP/1.1 {}\r\n\r\n", status);
            feed_all(&mut parser, wire.as_bytes());
            assert!(parser.is_done(), "status {} should have no body", status);
        }
    }

    #[test]
    fn test_oversized_line_breaks_parser() {
        let limits = Limits {
            max_line: 64,
            ..Limits::default()
        };
        let mut parser = Http1Parser::new(MessageKind::Request, limits);
        let wire = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(200));
        assert!(matches!(
            parser.parse(wire.as_bytes()),
            Err(Error::Http1Oversize(_))
        ));
        assert_eq!(parser.state(), State::Broken);
    }

    #[test]
    fn test_eof_mid_message_is_an_error() {
        let mut parser = Http1Parser::new_response();
        feed_all(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert!(parser.on_eof().is_err());
        assert_eq!(parser.state(), State::Broken);
    }

    #[test]
    fn test_malformed_header_line() {
        let mut parser = Http1Parser::new_request();
        let wire = b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n";
        assert!(parser.parse(wire).is_err());
        assert_eq!(parser.state(), State::Broken);
    }
}
