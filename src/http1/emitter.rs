use crate::config::MIN_CHUNK_SIZE;
use crate::http::headers::Headers;
use crate::http::model::{Request, Response};

/// Serializes a request head plus body. Headers named in `suppress` are
/// managed elsewhere and never emitted from the user's map.
pub fn emit_request(request: &Request, suppress: &[&str]) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\n",
        request.method,
        request.request_target(),
        request.version.as_str()
    );
    if !request.headers.contains("Host") {
        if let Ok(host) = request.host_field() {
            head.push_str(&format!("Host: {}\r\n", host));
        }
    }
    emit_headers(&mut head, &request.headers, suppress);
    head.push_str("\r\n");
    let mut wire = head.into_bytes();
    wire.extend_from_slice(&request.body);
    wire
}

pub fn emit_response(response: &Response, suppress: &[&str]) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\n",
        response.version.as_str(),
        response.status,
        response.reason
    );
    emit_headers(&mut head, &response.headers, suppress);
    head.push_str("\r\n");
    let mut wire = head.into_bytes();
    wire.extend_from_slice(&response.body);
    wire
}

fn emit_headers(head: &mut String, headers: &Headers, suppress: &[&str]) {
    for (name, value) in headers.iter() {
        if suppress
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(name))
        {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
}

/// Frames a body into `Transfer-Encoding: chunked` pieces of a configured
/// size. The terminating zero chunk comes from `finish`.
pub struct ChunkedWriter {
    chunk_size: usize,
}

impl ChunkedWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        }
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(data.len() + 16);
        for chunk in data.chunks(self.chunk_size) {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
        }
        wire
    }

    pub fn finish(&self) -> &'static [u8] {
        b"0\r\n\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::parser::Http1Parser;
    use url::Url;

    #[test]
    fn test_emit_request_head() {
        let mut request = Request::new(
            "POST",
            Url::parse("http://example.org/upload?kind=raw").unwrap(),
        );
        request.headers.append("Content-Length", "3");
        request.body = b"abc".to_vec();
        let wire = emit_request(&request, &[]);
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("POST /upload?kind=raw HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_suppressed_headers_stay_out() {
        let mut request = Request::new("GET", Url::parse("http://h/").unwrap());
        request.headers.append("X-Secret", "1");
        request.headers.append("Accept", "*/*");
        let wire = emit_request(&request, &["x-secret"]);
        let text = String::from_utf8_lossy(&wire);
        assert!(!text.contains("X-Secret"));
        assert!(text.contains("Accept: */*\r\n"));
    }

    #[test]
    fn test_chunked_writer_parses_back() {
        let writer = ChunkedWriter::new(100);
        let body = vec![7u8; 450];
        let mut wire = writer.encode(&body);
        wire.extend_from_slice(writer.finish());

        let mut framed = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        framed.extend_from_slice(&wire);
        let mut parser = Http1Parser::new_request();
        parser.parse(&framed).unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.body, body);
    }

    #[test]
    fn test_chunk_size_floor() {
        let writer = ChunkedWriter::new(1);
        // sizes below the floor are bumped up to it
        let encoded = writer.encode(&[0u8; 300]);
        let first_line_end = encoded.iter().position(|&b| b == b'\r').unwrap();
        let declared =
            usize::from_str_radix(std::str::from_utf8(&encoded[..first_line_end]).unwrap(), 16)
                .unwrap();
        assert_eq!(declared, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_emit_response() {
        let mut response = Response::new(200);
        response.headers.append("Content-Length", "2");
        response.body = b"ok".to_vec();
        let wire = emit_response(&response, &[]);
        assert!(String::from_utf8_lossy(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
