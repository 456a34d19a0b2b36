use crate::error::Error;
use rustls::ServerConfig as RustlsServerConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Address family of a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
    Unix,
}

/// Socket kind a scheme speaks on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
    Tls,
    Dtls,
    Sctp,
}

/// Application protocol carried by a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Raw,
    Http1,
    Http11,
    Http2,
}

/// Content codings the stack can negotiate, in client preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Deflate,
    Gzip,
    Brotli,
    None,
}

impl Compressor {
    pub fn token(&self) -> &'static str {
        match self {
            Compressor::Deflate => "deflate",
            Compressor::Gzip => "gzip",
            Compressor::Brotli => "br",
            Compressor::None => "identity",
        }
    }
}

/// AES key sizes supported by the payload cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesSize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesSize {
    pub fn key_len(&self) -> usize {
        match self {
            AesSize::Aes128 => 16,
            AesSize::Aes192 => 24,
            AesSize::Aes256 => 32,
        }
    }

    pub fn bits(&self) -> u16 {
        (self.key_len() as u16) * 8
    }

    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            128 => Some(AesSize::Aes128),
            192 => Some(AesSize::Aes192),
            256 => Some(AesSize::Aes256),
            _ => None,
        }
    }
}

/// Symmetric payload encryption settings, off when `None` at the scheme level.
#[derive(Debug, Clone)]
pub struct Encryption {
    pub pass: String,
    pub salt: String,
    pub cipher: AesSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHash {
    Md5,
    Sha256,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub kind: AuthType,
    pub hash: AuthHash,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

/// Proxy in front of the target; user/pass travel inside the URI.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub uri: url::Url,
}

impl ProxyConfig {
    pub fn credentials(&self) -> Option<(String, String)> {
        let user = self.uri.username();
        if user.is_empty() {
            return None;
        }
        Some((
            user.to_string(),
            self.uri.password().unwrap_or_default().to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub connect: Duration,
    pub wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            read: Duration::from_secs(15),
            write: Duration::from_secs(15),
            connect: Duration::from_secs(10),
            wait: Duration::from_secs(30),
        }
    }
}

/// TCP keep-alive triple applied to every socket of a scheme.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub cnt: u32,
    pub idle: Duration,
    pub intvl: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive {
            cnt: 3,
            idle: Duration::from_secs(1),
            intvl: Duration::from_secs(2),
        }
    }
}

/// Socket bandwidth hints, accepted as strings with a unit suffix.
#[derive(Debug, Clone, Default)]
pub struct Bandwidth {
    pub read: Option<String>,
    pub write: Option<String>,
}

/// Parses a `"100Mbps"`-style bandwidth string into bytes per second.
pub fn parse_bandwidth(value: &str) -> Result<u64, Error> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or(Error::Http1Malformed("bandwidth value without a unit"))?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| Error::Http1Malformed("bandwidth value is not a number"))?;
    let bits = match unit.trim() {
        "bps" => number,
        "kbps" => number * 1_000.0,
        "Mbps" => number * 1_000_000.0,
        "Gbps" => number * 1_000_000_000.0,
        _ => return Err(Error::Http1Malformed("unknown bandwidth unit")),
    };
    Ok((bits / 8.0) as u64)
}

/// The six IANA HTTP/2 settings carried in SETTINGS frames.
#[derive(Debug, Clone, Copy)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Http2Settings {
            header_table_size: 4096,
            // clients of this stack never accept pushes
            enable_push: false,
            max_concurrent_streams: 128,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: u32::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    pub timeout: Duration,
    /// Prefix for the `<PREFIX>_DNS_SERVERS` environment fallback.
    pub prefix: Option<String>,
    /// Per-domain IPs that must never be returned.
    pub blacklist: HashMap<String, Vec<IpAddr>>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            servers: Vec::new(),
            timeout: Duration::from_secs(5),
            prefix: None,
            blacklist: HashMap::new(),
        }
    }
}

/// Default WebSocket fragment size.
pub const DEFAULT_SEGMENT_SIZE: usize = 0xFA000;
/// Smallest chunk the HTTP/1 chunked writer will emit.
pub const MIN_CHUNK_SIZE: usize = 100;

/// Everything a `Scheme` needs to know to open and drive brokers.
#[derive(Debug, Clone)]
pub struct SchemeConfig {
    pub family: Family,
    pub sonet: SocketKind,
    pub proto: Protocol,
    pub url: String,
    pub compressors: Vec<Compressor>,
    pub encryption: Option<Encryption>,
    pub auth: Option<AuthConfig>,
    pub proxy: Option<ProxyConfig>,
    /// Redirect / retry bound shared by authentication and reconnects.
    pub attempts: usize,
    pub timeouts: Timeouts,
    pub keep_alive: KeepAlive,
    pub bandwidth: Bandwidth,
    /// HTTP chunk size, at least [`MIN_CHUNK_SIZE`].
    pub chunk: usize,
    /// WebSocket fragment size.
    pub segment_size: usize,
    /// Global cap on queued payload bytes across all brokers.
    pub memory_available_size: usize,
    /// Per-broker cap on queued payload bytes.
    pub broker_available_size: usize,
    pub http2: Http2Settings,
    pub dns: DnsConfig,
    /// Reconnect on transient transport errors.
    pub alive: bool,
    pub subprotocols: Vec<String>,
    /// Directory for UNIX-family sockets, joined with the socket name.
    pub sockpath: String,
    pub sockname: String,
}

impl Default for SchemeConfig {
    fn default() -> Self {
        SchemeConfig {
            family: Family::Ipv4,
            sonet: SocketKind::Tcp,
            proto: Protocol::Http11,
            url: String::new(),
            compressors: vec![Compressor::None],
            encryption: None,
            auth: None,
            proxy: None,
            attempts: 15,
            timeouts: Timeouts::default(),
            keep_alive: KeepAlive::default(),
            bandwidth: Bandwidth::default(),
            chunk: 0x4000,
            segment_size: DEFAULT_SEGMENT_SIZE,
            memory_available_size: 16 << 20,
            broker_available_size: 1 << 20,
            http2: Http2Settings::default(),
            dns: DnsConfig::default(),
            alive: false,
            subprotocols: Vec::new(),
            sockpath: "/tmp".to_string(),
            sockname: "wire-flow".to_string(),
        }
    }
}

impl SchemeConfig {
    /// Validates option combinations that cannot work at all, so schemes fail
    /// at registration instead of at connect time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk < MIN_CHUNK_SIZE {
            return Err(Error::Http1Malformed("chunk size below 100 bytes"));
        }
        if cfg!(windows) && self.family == Family::Unix {
            return Err(Error::UnsupportedTransport("unix"));
        }
        if self.sonet == SocketKind::Sctp
            && !(cfg!(target_os = "linux") || cfg!(target_os = "freebsd"))
        {
            return Err(Error::UnsupportedTransport("sctp"));
        }
        Ok(())
    }

    /// Socket path for UNIX-family schemes.
    pub fn unix_socket_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.sockpath).join(format!("{}.sock", self.sockname))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub scheme: SchemeConfig,
    pub tls_config: Option<Arc<RustlsServerConfig>>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub scheme: SchemeConfig,
    pub ca_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bandwidth_units() {
        assert_eq!(parse_bandwidth("8bps").unwrap(), 1);
        assert_eq!(parse_bandwidth("8kbps").unwrap(), 1_000);
        assert_eq!(parse_bandwidth("100Mbps").unwrap(), 12_500_000);
        assert_eq!(parse_bandwidth("1Gbps").unwrap(), 125_000_000);
        assert!(parse_bandwidth("100").is_err());
        assert!(parse_bandwidth("fastbps").is_err());
    }

    #[test]
    fn test_chunk_floor() {
        let mut cfg = SchemeConfig::default();
        cfg.chunk = 99;
        assert!(cfg.validate().is_err());
        cfg.chunk = 100;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_aes_sizes() {
        assert_eq!(AesSize::Aes128.bits(), 128);
        assert_eq!(AesSize::Aes256.key_len(), 32);
        assert_eq!(AesSize::from_bits(192), Some(AesSize::Aes192));
        assert_eq!(AesSize::from_bits(64), None);
    }
}
