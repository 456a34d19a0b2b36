use crate::config::{AuthConfig, AuthHash, AuthType};
use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::debug;
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Where an authentication exchange stands after a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials were accepted (or never demanded).
    Good,
    /// The target issued a fresh challenge worth answering.
    Retry,
    /// No way forward, the credentials are wrong or the scheme is alien.
    Fault,
}

#[derive(Debug, Clone, Default)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    algorithm: Option<String>,
}

/// Client-side authentication state for one origin (or one proxy).
///
/// Basic emits credentials straight away; Digest waits for the first
/// challenge, then answers every request with an incrementing nonce count.
pub struct AuthClient {
    config: AuthConfig,
    challenge: Option<DigestChallenge>,
    nc: u32,
    challenged: bool,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            challenge: None,
            nc: 0,
            challenged: false,
        }
    }

    /// The authorization header value for a request, when one can be built
    /// already. Digest needs a challenge first.
    pub fn header_value(&mut self, method: &str, uri: &str) -> Option<String> {
        match self.config.kind {
            AuthType::Basic => {
                let pair = format!("{}:{}", self.config.user, self.config.pass);
                Some(format!("Basic {}", BASE64_STANDARD.encode(pair)))
            }
            AuthType::Digest => {
                let challenge = self.challenge.as_ref()?;
                self.nc += 1;
                let cnonce: String = {
                    let mut rng = rand::thread_rng();
                    (0..16)
                        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
                        .collect()
                };
                Some(digest_response(
                    &self.config,
                    challenge,
                    method,
                    uri,
                    self.nc,
                    &cnonce,
                ))
            }
        }
    }

    /// Digests a 401/407 challenge header. The first challenge for a scheme
    /// we can speak earns a Retry, a second one means the credentials were
    /// actually rejected.
    pub fn on_challenge(&mut self, challenge_header: &str) -> AuthOutcome {
        let scheme = challenge_header
            .split_whitespace()
            .next()
            .unwrap_or_default();
        match (self.config.kind, scheme.to_ascii_lowercase().as_str()) {
            (AuthType::Basic, "basic") => {
                if self.challenged {
                    AuthOutcome::Fault
                } else {
                    self.challenged = true;
                    AuthOutcome::Retry
                }
            }
            (AuthType::Digest, "digest") => {
                let Ok(parsed) = parse_digest_challenge(challenge_header) else {
                    return AuthOutcome::Fault;
                };
                // A stale nonce is worth a redo even after a prior challenge
                let stale = challenge_header.to_ascii_lowercase().contains("stale=true");
                if self.challenged && !stale {
                    return AuthOutcome::Fault;
                }
                debug!("digest challenge from realm `{}`", parsed.realm);
                self.challenge = Some(parsed);
                self.challenged = true;
                self.nc = 0;
                AuthOutcome::Retry
            }
            _ => AuthOutcome::Fault,
        }
    }

    /// A 2xx after credentials went out settles the exchange.
    pub fn on_accepted(&mut self) {
        self.challenged = false;
    }
}

fn hash_hex(hash: AuthHash, input: &str) -> String {
    match hash {
        AuthHash::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(input.as_bytes());
            hex(&hasher.finalize())
        }
        AuthHash::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            hex(&hasher.finalize())
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

fn digest_response(
    config: &AuthConfig,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let hash = config.hash;
    let ha1 = hash_hex(
        hash,
        &format!("{}:{}:{}", config.user, challenge.realm, config.pass),
    );
    let ha2 = hash_hex(hash, &format!("{}:{}", method, uri));
    let response = if challenge.qop_auth {
        hash_hex(
            hash,
            &format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ),
        )
    } else {
        hash_hex(hash, &format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    };

    let algorithm = match hash {
        AuthHash::Md5 => "MD5",
        AuthHash::Sha256 => "SHA-256",
    };
    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
        config.user, challenge.realm, challenge.nonce, uri, algorithm, response
    );
    if challenge.qop_auth {
        value.push_str(&format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce));
    }
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    value
}

fn parse_digest_challenge(header: &str) -> Result<DigestChallenge, Error> {
    let params = header
        .strip_prefix("Digest")
        .or_else(|| header.strip_prefix("digest"))
        .ok_or(Error::AuthChallenge)?;
    let mut challenge = DigestChallenge::default();
    for param in split_challenge_params(params) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value,
            "nonce" => challenge.nonce = value,
            "opaque" => challenge.opaque = Some(value),
            "algorithm" => challenge.algorithm = Some(value),
            "qop" => {
                challenge.qop_auth = value.split(',').any(|qop| qop.trim() == "auth");
            }
            _ => {}
        }
    }
    if challenge.nonce.is_empty() {
        return Err(Error::AuthChallenge);
    }
    Ok(challenge)
}

// Splits on commas outside of quoted strings.
fn split_challenge_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_config() -> AuthConfig {
        AuthConfig {
            kind: AuthType::Basic,
            hash: AuthHash::Md5,
            user: "Aladdin".to_string(),
            pass: "open sesame".to_string(),
        }
    }

    fn digest_config(hash: AuthHash) -> AuthConfig {
        AuthConfig {
            kind: AuthType::Digest,
            hash,
            user: "Mufasa".to_string(),
            pass: "Circle Of Life".to_string(),
        }
    }

    #[test]
    fn test_basic_header_rfc_vector() {
        // The canonical example from RFC 7617
        let mut client = AuthClient::new(basic_config());
        assert_eq!(
            client.header_value("GET", "/").unwrap(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_digest_needs_challenge_first() {
        let mut client = AuthClient::new(digest_config(AuthHash::Md5));
        assert!(client.header_value("GET", "/dir/index.html").is_none());
        let outcome = client.on_challenge(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        );
        assert_eq!(outcome, AuthOutcome::Retry);
        let value = client.header_value("GET", "/dir/index.html").unwrap();
        assert!(value.starts_with("Digest username=\"Mufasa\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("qop=auth"));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_digest_known_response_without_qop() {
        // RFC 2617 §3.5 example: no qop, MD5, fixed cnonce-free response
        let config = digest_config(AuthHash::Md5);
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: None,
            qop_auth: false,
            algorithm: None,
        };
        let value = digest_response(&config, &challenge, "GET", "/dir/index.html", 1, "");
        assert!(value.contains("response=\"670fd8c2df070c60b045671b8b24ff02\""));
    }

    #[test]
    fn test_nc_increments() {
        let mut client = AuthClient::new(digest_config(AuthHash::Sha256));
        client.on_challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"");
        let first = client.header_value("GET", "/").unwrap();
        let second = client.header_value("GET", "/").unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_second_challenge_is_fault() {
        let mut client = AuthClient::new(digest_config(AuthHash::Md5));
        assert_eq!(
            client.on_challenge("Digest realm=\"r\", nonce=\"n\""),
            AuthOutcome::Retry
        );
        assert_eq!(
            client.on_challenge("Digest realm=\"r\", nonce=\"n2\""),
            AuthOutcome::Fault
        );
    }

    #[test]
    fn test_stale_nonce_retries_again() {
        let mut client = AuthClient::new(digest_config(AuthHash::Md5));
        client.on_challenge("Digest realm=\"r\", nonce=\"n\"");
        assert_eq!(
            client.on_challenge("Digest realm=\"r\", nonce=\"n2\", stale=true"),
            AuthOutcome::Retry
        );
    }

    #[test]
    fn test_alien_scheme_is_fault() {
        let mut client = AuthClient::new(basic_config());
        assert_eq!(
            client.on_challenge("Negotiate token"),
            AuthOutcome::Fault
        );
    }
}
