use crate::error::Error;
use crate::http::auth::{AuthClient, AuthOutcome};
use crate::http1::parser::{Http1Parser, State};
use log::debug;

/// HTTP CONNECT tunnel client.
///
/// Builds the CONNECT request, parses the proxy's answer with the regular
/// HTTP/1 parser, and on 407 consults the authentication state to decide
/// whether re-issuing with credentials is worth it.
pub struct ConnectMachine {
    host: String,
    port: u16,
    auth: Option<AuthClient>,
    attempts_left: usize,
    parser: Http1Parser,
    established: bool,
}

impl ConnectMachine {
    pub fn new(host: &str, port: u16, auth: Option<AuthClient>, attempts: usize) -> Self {
        Self {
            host: host.to_string(),
            port,
            auth,
            attempts_left: attempts,
            parser: Http1Parser::new_response(),
            established: false,
        }
    }

    pub fn established(&self) -> bool {
        self.established
    }

    /// The CONNECT request head for the current attempt.
    pub fn request(&mut self) -> Vec<u8> {
        let mut head = format!(
            "CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\nProxy-Connection: keep-alive\r\n",
            self.host, self.port
        );
        let target = format!("{}:{}", self.host, self.port);
        if let Some(auth) = &mut self.auth {
            if let Some(value) = auth.header_value("CONNECT", &target) {
                head.push_str(&format!("Proxy-Authorization: {}\r\n", value));
            }
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Feeds proxy bytes. Returns `(consumed, retry_request)`: when
    /// `retry_request` is set the caller writes it and keeps reading; when
    /// the machine reports established, application traffic may start.
    pub fn advance(&mut self, input: &[u8]) -> Result<(usize, Option<Vec<u8>>), Error> {
        let consumed = self.parser.parse(input)?;
        // CONNECT success responses have no body; anything still streaming
        // in (an error page) completes before we judge the status
        if !matches!(self.parser.state(), State::Done | State::Body) {
            return Ok((consumed, None));
        }
        let status = self.parser.status;
        match status {
            200 => {
                debug!("proxy tunnel to {}:{} established", self.host, self.port);
                self.established = true;
                Ok((consumed, None))
            }
            407 => {
                let challenge = self
                    .parser
                    .headers
                    .get("Proxy-Authenticate")
                    .map(ToOwned::to_owned);
                let Some(auth) = &mut self.auth else {
                    return Err(Error::ProxyAuthRequired);
                };
                let Some(challenge) = challenge else {
                    return Err(Error::ProxyAuthRequired);
                };
                if self.attempts_left == 0 {
                    return Err(Error::AuthExhausted(0));
                }
                match auth.on_challenge(&challenge) {
                    AuthOutcome::Retry => {
                        self.attempts_left -= 1;
                        self.parser.reset();
                        Ok((consumed, Some(self.request())))
                    }
                    _ => Err(Error::ProxyAuthRequired),
                }
            }
            other => Err(Error::ProxyNegotiation(format!(
                "proxy answered {} to CONNECT",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthHash, AuthType};

    fn auth() -> AuthClient {
        AuthClient::new(AuthConfig {
            kind: AuthType::Basic,
            hash: AuthHash::Md5,
            user: "u".to_string(),
            pass: "p".to_string(),
        })
    }

    #[test]
    fn test_request_shape() {
        let mut machine = ConnectMachine::new("example.org", 443, None, 3);
        let request = String::from_utf8(machine.request()).unwrap();
        assert!(request.starts_with("CONNECT example.org:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.org:443\r\n"));
        assert!(request.contains("Proxy-Connection: keep-alive\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_basic_credentials_included() {
        let mut machine = ConnectMachine::new("h", 80, Some(auth()), 3);
        let request = String::from_utf8(machine.request()).unwrap();
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn test_200_establishes() {
        let mut machine = ConnectMachine::new("h", 443, None, 3);
        machine.request();
        let (_, retry) = machine
            .advance(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .unwrap();
        assert!(retry.is_none());
        assert!(machine.established());
    }

    #[test]
    fn test_407_retries_then_fails() {
        let mut machine = ConnectMachine::new("h", 443, Some(auth()), 3);
        machine.request();
        let reply = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n";
        let (_, retry) = machine.advance(reply).unwrap();
        let retry = retry.expect("one retry with credentials");
        assert!(String::from_utf8(retry).unwrap().contains("Proxy-Authorization"));
        // the second 407 means the credentials are bad
        assert!(machine.advance(reply).is_err());
    }

    #[test]
    fn test_407_without_credentials_fails() {
        let mut machine = ConnectMachine::new("h", 443, None, 3);
        machine.request();
        assert!(matches!(
            machine.advance(
                b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                  Proxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n"
            ),
            Err(Error::ProxyAuthRequired)
        ));
    }

    #[test]
    fn test_5xx_fails() {
        let mut machine = ConnectMachine::new("h", 443, None, 3);
        machine.request();
        assert!(matches!(
            machine.advance(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n"),
            Err(Error::ProxyNegotiation(_))
        ));
    }
}
