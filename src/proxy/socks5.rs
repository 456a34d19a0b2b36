use crate::error::Error;
use log::debug;
use std::net::IpAddr;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Where the SOCKS5 conversation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    GreetingSent,
    AuthSent,
    RequestSent,
    Established,
    End,
}

/// The CONNECT target, written in the address form the proxy expects.
#[derive(Debug, Clone)]
pub enum TargetAddr {
    Ip(IpAddr, u16),
    Domain(String, u16),
}

/// Sans-io SOCKS5 client (RFC 1928 + RFC 1929 user/password).
///
/// The caller writes whatever `start`/`advance` hand back and feeds replies
/// in; once [`Socks5State::Established`] is reached the same socket switches
/// from proxy negotiation to application traffic.
pub struct Socks5Machine {
    state: Socks5State,
    target: TargetAddr,
    credentials: Option<(String, String)>,
}

impl Socks5Machine {
    pub fn new(target: TargetAddr, credentials: Option<(String, String)>) -> Self {
        Self {
            state: Socks5State::GreetingSent,
            target,
            credentials,
        }
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// The greeting announcing the supported method: user/password when
    /// credentials are configured, otherwise no authentication.
    pub fn start(&self) -> Vec<u8> {
        match &self.credentials {
            Some(_) => vec![SOCKS_VERSION, 0x01, METHOD_USER_PASS],
            None => vec![SOCKS_VERSION, 0x01, METHOD_NO_AUTH],
        }
    }

    /// Feeds proxy bytes, returning `(consumed, reply)`; `reply` is the next
    /// thing to write, empty once nothing more is owed. `Ok((0, _))` with an
    /// empty reply means more input is needed.
    pub fn advance(&mut self, input: &[u8]) -> Result<(usize, Vec<u8>), Error> {
        match self.state {
            Socks5State::GreetingSent => {
                if input.len() < 2 {
                    return Ok((0, Vec::new()));
                }
                if input[0] != SOCKS_VERSION {
                    self.state = Socks5State::End;
                    return Err(Error::ProxyNegotiation("not a SOCKS5 proxy".to_string()));
                }
                match input[1] {
                    METHOD_NO_AUTH => {
                        self.state = Socks5State::RequestSent;
                        Ok((2, self.connect_request()))
                    }
                    METHOD_USER_PASS => {
                        let Some((user, pass)) = &self.credentials else {
                            self.state = Socks5State::End;
                            return Err(Error::ProxyNegotiation(
                                "proxy demands credentials none were configured".to_string(),
                            ));
                        };
                        // RFC 1929 sub-negotiation
                        let mut reply = Vec::with_capacity(3 + user.len() + pass.len());
                        reply.push(AUTH_VERSION);
                        reply.push(user.len() as u8);
                        reply.extend_from_slice(user.as_bytes());
                        reply.push(pass.len() as u8);
                        reply.extend_from_slice(pass.as_bytes());
                        self.state = Socks5State::AuthSent;
                        Ok((2, reply))
                    }
                    METHOD_UNACCEPTABLE => {
                        self.state = Socks5State::End;
                        Err(Error::ProxyNegotiation(
                            "no acceptable authentication method".to_string(),
                        ))
                    }
                    other => {
                        self.state = Socks5State::End;
                        Err(Error::ProxyNegotiation(format!(
                            "proxy picked unsupported method {:#04x}",
                            other
                        )))
                    }
                }
            }
            Socks5State::AuthSent => {
                if input.len() < 2 {
                    return Ok((0, Vec::new()));
                }
                if input[1] != 0x00 {
                    self.state = Socks5State::End;
                    return Err(Error::ProxyNegotiation(
                        "proxy rejected the credentials".to_string(),
                    ));
                }
                debug!("socks5 user/password sub-negotiation accepted");
                self.state = Socks5State::RequestSent;
                Ok((2, self.connect_request()))
            }
            Socks5State::RequestSent => {
                // VER REP RSV ATYP BND.ADDR BND.PORT
                if input.len() < 4 {
                    return Ok((0, Vec::new()));
                }
                let addr_len = match input[3] {
                    ATYP_IPV4 => 4,
                    ATYP_IPV6 => 16,
                    ATYP_DOMAIN => {
                        if input.len() < 5 {
                            return Ok((0, Vec::new()));
                        }
                        1 + input[4] as usize
                    }
                    _ => {
                        self.state = Socks5State::End;
                        return Err(Error::ProxyNegotiation(
                            "unknown bound address type".to_string(),
                        ));
                    }
                };
                let total = 4 + addr_len + 2;
                if input.len() < total {
                    return Ok((0, Vec::new()));
                }
                if input[1] != 0x00 {
                    self.state = Socks5State::End;
                    return Err(Error::SocksReply(input[1]));
                }
                self.state = Socks5State::Established;
                Ok((total, Vec::new()))
            }
            Socks5State::Established | Socks5State::End => Ok((0, Vec::new())),
        }
    }

    fn connect_request(&self) -> Vec<u8> {
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match &self.target {
            TargetAddr::Ip(IpAddr::V4(ip), port) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
                request.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ip(IpAddr::V6(ip), port) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
                request.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                request.push(ATYP_DOMAIN);
                request.push(domain.len() as u8);
                request.extend_from_slice(domain.as_bytes());
                request.extend_from_slice(&port.to_be_bytes());
            }
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_sequence_with_auth() {
        // S5: greeting, user/pass, CONNECT to a domain on port 443
        let mut machine = Socks5Machine::new(
            TargetAddr::Domain("h".to_string(), 443),
            Some(("u".to_string(), "p".to_string())),
        );
        assert_eq!(machine.start(), vec![0x05, 0x01, 0x02]);

        // proxy picks user/password
        let (consumed, reply) = machine.advance(&[0x05, 0x02]).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(reply, vec![0x01, 0x01, b'u', 0x01, b'p']);
        assert_eq!(machine.state(), Socks5State::AuthSent);

        // credentials accepted
        let (consumed, reply) = machine.advance(&[0x01, 0x00]).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(
            reply,
            vec![0x05, 0x01, 0x00, 0x03, 0x01, b'h', 0x01, 0xBB]
        );
        assert_eq!(machine.state(), Socks5State::RequestSent);

        // success reply bound to 0.0.0.0:0
        let (consumed, reply) = machine
            .advance(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(consumed, 10);
        assert!(reply.is_empty());
        assert_eq!(machine.state(), Socks5State::Established);
    }

    #[test]
    fn test_no_auth_path() {
        let mut machine = Socks5Machine::new(
            TargetAddr::Ip("127.0.0.1".parse().unwrap(), 8080),
            None,
        );
        assert_eq!(machine.start(), vec![0x05, 0x01, 0x00]);
        let (_, request) = machine.advance(&[0x05, 0x00]).unwrap();
        assert_eq!(
            request,
            vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90]
        );
    }

    #[test]
    fn test_partial_input_needs_more() {
        let mut machine = Socks5Machine::new(TargetAddr::Domain("x".to_string(), 80), None);
        let (consumed, reply) = machine.advance(&[0x05]).unwrap();
        assert_eq!(consumed, 0);
        assert!(reply.is_empty());
        assert_eq!(machine.state(), Socks5State::GreetingSent);
    }

    #[test]
    fn test_rejected_credentials() {
        let mut machine = Socks5Machine::new(
            TargetAddr::Domain("x".to_string(), 80),
            Some(("u".to_string(), "wrong".to_string())),
        );
        machine.advance(&[0x05, 0x02]).unwrap();
        assert!(machine.advance(&[0x01, 0x01]).is_err());
        assert_eq!(machine.state(), Socks5State::End);
    }

    #[test]
    fn test_nonzero_reply_code() {
        let mut machine = Socks5Machine::new(TargetAddr::Domain("x".to_string(), 80), None);
        machine.advance(&[0x05, 0x00]).unwrap();
        // 0x05: connection refused
        let err = machine
            .advance(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap_err();
        assert!(matches!(err, Error::SocksReply(0x05)));
    }

    #[test]
    fn test_demanded_credentials_missing() {
        let mut machine = Socks5Machine::new(TargetAddr::Domain("x".to_string(), 80), None);
        assert!(machine.advance(&[0x05, 0x02]).is_err());
    }
}
