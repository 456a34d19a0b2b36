use crate::config::{DnsConfig, Family};
use crate::error::Error;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const DNS_PORT: u16 = 53;
const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

const RCODE_NXDOMAIN: u8 = 3;
const RCODE_SERVFAIL: u8 = 2;

const FALLBACK_SERVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
];

struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires: Instant,
}

/// Asynchronous A/AAAA resolver speaking the DNS wire format itself.
///
/// Server list resolution order: explicit configuration, then the
/// `<PREFIX>_DNS_SERVERS` environment variable, then `/etc/resolv.conf`,
/// then well-known public resolvers. Blacklisted IPs are skipped, answers
/// are cached for their TTL behind a lock shared by every caller.
pub struct DnsResolver {
    config: DnsConfig,
    servers: Vec<SocketAddr>,
    cache: Mutex<HashMap<(String, u16), CacheEntry>>,
}

impl DnsResolver {
    pub fn new(config: DnsConfig) -> Self {
        let servers = Self::server_list(&config);
        debug!("dns servers: {:?}", servers);
        Self {
            config,
            servers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn server_list(config: &DnsConfig) -> Vec<SocketAddr> {
        if !config.servers.is_empty() {
            return config
                .servers
                .iter()
                .map(|ip| SocketAddr::new(*ip, DNS_PORT))
                .collect();
        }
        if let Some(prefix) = &config.prefix {
            let variable = format!("{}_DNS_SERVERS", prefix.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&variable) {
                let parsed: Vec<SocketAddr> = value
                    .split([',', ' ', ';'])
                    .filter(|part| !part.is_empty())
                    .filter_map(|part| part.parse::<IpAddr>().ok())
                    .map(|ip| SocketAddr::new(ip, DNS_PORT))
                    .collect();
                if !parsed.is_empty() {
                    return parsed;
                }
            }
        }
        if let Ok(contents) = std::fs::read_to_string("/etc/resolv.conf") {
            let parsed: Vec<SocketAddr> = contents
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    line.strip_prefix("nameserver")
                        .map(str::trim)
                        .and_then(|ip| ip.parse::<IpAddr>().ok())
                })
                .map(|ip| SocketAddr::new(ip, DNS_PORT))
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
        FALLBACK_SERVERS
            .iter()
            .map(|ip| SocketAddr::new(*ip, DNS_PORT))
            .collect()
    }

    fn blacklisted(&self, host: &str, ip: &IpAddr) -> bool {
        self.config
            .blacklist
            .get(host)
            .map_or(false, |blocked| blocked.contains(ip))
    }

    /// Resolves one address of the requested family. IP literals short-circuit.
    pub async fn resolve(&self, host: &str, family: Family) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let qtype = match family {
            Family::Ipv6 => QTYPE_AAAA,
            _ => QTYPE_A,
        };
        let addresses = self.lookup(host, qtype).await?;
        addresses
            .into_iter()
            .find(|ip| !self.blacklisted(host, ip))
            .ok_or_else(|| {
                Error::ResolveError(host.to_string(), "every answer was blacklisted".to_string())
            })
    }

    /// AAAA first, A as the fallback; used by the ping worker.
    pub async fn resolve_prefer_v6(&self, host: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.resolve(host, Family::Ipv6).await {
            Ok(ip) => Ok(ip),
            Err(_) => self.resolve(host, Family::Ipv4).await,
        }
    }

    /// Callback shape kept for API compatibility: `f` receives the resolved
    /// IP as text, or an empty string on failure.
    pub fn resolve_with<F>(self: std::sync::Arc<Self>, host: String, family: Family, f: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        tokio::spawn(async move {
            match self.resolve(&host, family).await {
                Ok(ip) => f(ip.to_string()),
                Err(err) => {
                    warn!("dns resolution of {} failed: {}", host, err);
                    f(String::new());
                }
            }
        });
    }

    /// Blocking resolution for code outside the runtime.
    pub fn resolve_sync(&self, host: &str, family: Family) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.resolve(host, family))
    }

    async fn lookup(&self, host: &str, qtype: u16) -> Result<Vec<IpAddr>, Error> {
        let key = (host.to_ascii_lowercase(), qtype);
        {
            let cache = self.cache.lock().expect("dns cache lock poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.expires > Instant::now() && !entry.addresses.is_empty() {
                    return Ok(entry.addresses.clone());
                }
            }
        }

        let mut last_error =
            Error::ResolveError(host.to_string(), "no servers configured".to_string());
        for server in &self.servers {
            match self.query_server(host, qtype, *server).await {
                Ok((addresses, ttl)) => {
                    if addresses.is_empty() {
                        last_error = Error::ResolveError(
                            host.to_string(),
                            "answer carried no usable records".to_string(),
                        );
                        continue;
                    }
                    let mut cache = self.cache.lock().expect("dns cache lock poisoned");
                    cache.insert(
                        key,
                        CacheEntry {
                            addresses: addresses.clone(),
                            expires: Instant::now() + Duration::from_secs(ttl.max(1) as u64),
                        },
                    );
                    return Ok(addresses);
                }
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    async fn query_server(
        &self,
        host: &str,
        qtype: u16,
        server: SocketAddr,
    ) -> Result<(Vec<IpAddr>, u32), Error> {
        let id: u16 = rand::thread_rng().gen();
        let query = build_query(id, host, qtype)?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&query, server).await?;
        let mut answer = [0u8; 1500];
        let (n, _) = timeout(self.config.timeout, socket.recv_from(&mut answer))
            .await
            .map_err(|_| Error::DnsTimeout(host.to_string()))??;
        parse_response(&answer[..n], id, qtype)
            .map_err(|kind| Error::ResolveError(host.to_string(), kind.to_string()))
    }
}

fn build_query(id: u16, host: &str, qtype: u16) -> Result<Vec<u8>, Error> {
    let mut query = Vec::with_capacity(32 + host.len());
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00]); // RD set
    query.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    query.extend_from_slice(&[0; 6]); // AN/NS/AR counts
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::ResolveError(
                host.to_string(),
                "invalid label".to_string(),
            ));
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(query)
}

// Skips one (possibly compressed) name starting at `offset`.
fn skip_name(message: &[u8], mut offset: usize) -> Result<usize, &'static str> {
    loop {
        let Some(&len) = message.get(offset) else {
            return Err("truncated name");
        };
        if len & 0xc0 == 0xc0 {
            // compression pointer, two bytes total
            return Ok(offset + 2);
        }
        if len == 0 {
            return Ok(offset + 1);
        }
        offset += 1 + len as usize;
    }
}

fn parse_response(
    message: &[u8],
    expected_id: u16,
    qtype: u16,
) -> Result<(Vec<IpAddr>, u32), &'static str> {
    if message.len() < 12 {
        return Err("short header");
    }
    let id = u16::from_be_bytes([message[0], message[1]]);
    if id != expected_id {
        return Err("answer id mismatch");
    }
    let rcode = message[3] & 0x0f;
    match rcode {
        0 => {}
        RCODE_NXDOMAIN => return Err("NXDOMAIN"),
        RCODE_SERVFAIL => return Err("SERVFAIL"),
        _ => return Err("unexpected rcode"),
    }
    let qdcount = u16::from_be_bytes([message[4], message[5]]);
    let ancount = u16::from_be_bytes([message[6], message[7]]);

    let mut offset = 12;
    for _ in 0..qdcount {
        offset = skip_name(message, offset)?;
        offset += 4; // qtype + qclass
    }

    let mut addresses = Vec::new();
    let mut min_ttl = u32::MAX;
    for _ in 0..ancount {
        offset = skip_name(message, offset)?;
        if offset + 10 > message.len() {
            return Err("truncated answer");
        }
        let answer_type = u16::from_be_bytes([message[offset], message[offset + 1]]);
        let ttl = u32::from_be_bytes([
            message[offset + 4],
            message[offset + 5],
            message[offset + 6],
            message[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([message[offset + 8], message[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > message.len() {
            return Err("truncated rdata");
        }
        if answer_type == qtype {
            match (qtype, rdlength) {
                (QTYPE_A, 4) => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&message[offset..offset + 4]);
                    addresses.push(IpAddr::V4(Ipv4Addr::from(octets)));
                    min_ttl = min_ttl.min(ttl);
                }
                (QTYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&message[offset..offset + 16]);
                    addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
                    min_ttl = min_ttl.min(ttl);
                }
                _ => {}
            }
        }
        offset += rdlength;
    }
    Ok((addresses, if min_ttl == u32::MAX { 30 } else { min_ttl }))
}
