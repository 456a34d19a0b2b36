use crate::dns::DnsResolver;
use crate::error::Error;
use log::{debug, warn};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const ECHO_PAYLOAD: &[u8] = b"wire-flow-echo-probe-data-56b---";

/// RFC 1071 one's-complement checksum over the packet.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds an echo request for the address family. The ICMPv6 checksum stays
/// zero: raw ICMPv6 sockets have the kernel fill it, since it covers the
/// IPv6 pseudo-header (source, destination, length, next-header) that only
/// the kernel knows for sure.
fn build_echo(v6: bool, id: u16, seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.push(if v6 {
        ICMPV6_ECHO_REQUEST
    } else {
        ICMPV4_ECHO_REQUEST
    });
    packet.push(0); // code
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    if !v6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Picks the echo reply out of a received datagram, skipping the IPv4
/// header when the raw socket delivered one. Returns `(id, seq)`.
fn parse_reply(v6: bool, datagram: &[u8]) -> Option<(u16, u16)> {
    let icmp = if !v6 && datagram.len() >= 20 && datagram[0] >> 4 == 4 {
        // raw IPv4 sockets hand over the IP header; IHL is in 32-bit words
        let ihl = ((datagram[0] & 0x0f) as usize) * 4;
        datagram.get(ihl..)?
    } else {
        datagram
    };
    if icmp.len() < 8 {
        return None;
    }
    let expected = if v6 {
        ICMPV6_ECHO_REPLY
    } else {
        ICMPV4_ECHO_REPLY
    };
    if icmp[0] != expected {
        return None;
    }
    Some((
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

// Raw sockets need privilege; SOCK_DGRAM ICMP works unprivileged where the
// OS allows it (linux ping_group_range, macOS always).
fn open_socket(v6: bool) -> Result<(Socket, bool), Error> {
    let (domain, protocol) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => Ok((socket, true)),
        Err(raw_err) => match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => {
                debug!("raw icmp socket denied ({}), using dgram", raw_err);
                Ok((socket, false))
            }
            Err(err) => Err(err.into()),
        },
    }
}

// One blocking echo exchange; returns the RTT in milliseconds.
fn echo_roundtrip(
    socket: &Socket,
    raw: bool,
    addr: IpAddr,
    id: u16,
    seq: u16,
    wait: Duration,
) -> Result<f64, Error> {
    let v6 = addr.is_ipv6();
    let packet = build_echo(v6, id, seq);
    let target = SocketAddr::new(addr, 0);
    socket.set_read_timeout(Some(wait))?;
    let started = Instant::now();
    socket.send_to(&packet, &target.into())?;

    let timed_out = |addr: IpAddr| Error::IOError {
        source: std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no echo reply from {}", addr),
        ),
    };
    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1600];
    loop {
        if started.elapsed() > wait {
            return Err(timed_out(addr));
        }
        let (n, _peer) = socket.recv_from(&mut buf).map_err(|err| {
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                timed_out(addr)
            } else {
                Error::from(err)
            }
        })?;
        let datagram: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        if let Some((reply_id, reply_seq)) = parse_reply(v6, datagram) {
            // dgram sockets rewrite the id, only the sequence is ours there
            let id_matches = !raw || reply_id == id;
            if id_matches && reply_seq == seq {
                return Ok(started.elapsed().as_secs_f64() * 1000.0);
            }
        }
    }
}

fn floor3(value: f64) -> f64 {
    (value * 1000.0).floor() / 1000.0
}

/// ICMP echo prober with DNS pre-resolution. Domains resolve AAAA-first,
/// then A; the echo family follows the resolved address.
pub struct Ping {
    resolver: Arc<DnsResolver>,
    /// Pause between echoes of the async worker.
    pub shifting: Duration,
    /// How long a single echo may take.
    pub timeout: Duration,
    id: u16,
}

impl Ping {
    pub fn new(resolver: Arc<DnsResolver>) -> Self {
        Self {
            resolver,
            shifting: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            id: rand::thread_rng().gen(),
        }
    }

    /// Sync mode: `count` echoes with sequence numbers from 0, the mean RTT
    /// in milliseconds floored to 3 decimals.
    pub async fn ping(&self, host: &str, count: u16) -> Result<f64, Error> {
        let addr = self.resolver.resolve_prefer_v6(host).await?;
        let id = self.id;
        let wait = self.timeout;
        let shifting = self.shifting;
        let host_owned = host.to_string();
        tokio::task::spawn_blocking(move || {
            let (socket, raw) = open_socket(addr.is_ipv6())?;
            let mut total = 0f64;
            for seq in 0..count {
                let rtt = echo_roundtrip(&socket, raw, addr, id, seq, wait)?;
                debug!("{} icmp_seq={} time={:.3} ms", host_owned, seq, rtt);
                total += rtt;
                if seq + 1 < count {
                    std::thread::sleep(shifting);
                }
            }
            Ok(floor3(total / count as f64))
        })
        .await
        .map_err(|_| Error::CommunicationError)?
    }

    /// Async mode: pings indefinitely at the shifting interval, invoking the
    /// callback with `(rtt_ms, host)` per reply. Returns a stop handle.
    pub fn start<F>(&self, host: String, callback: F) -> PingWorker
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        let resolver = self.resolver.clone();
        let id = self.id;
        let wait = self.timeout;
        let shifting = self.shifting;
        let handle = tokio::spawn(async move {
            let addr = match resolver.resolve_prefer_v6(&host).await {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("ping worker: resolving {} failed: {}", host, err);
                    return;
                }
            };
            let mut seq: u16 = 0;
            loop {
                let host_cb = host.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let (socket, raw) = open_socket(addr.is_ipv6())?;
                    echo_roundtrip(&socket, raw, addr, id, seq, wait)
                })
                .await;
                match result {
                    Ok(Ok(rtt)) => callback(floor3(rtt), &host_cb),
                    Ok(Err(err)) => warn!("ping {} seq {} failed: {}", host_cb, seq, err),
                    Err(_) => return,
                }
                seq = seq.wrapping_add(1);
                tokio::time::sleep(shifting).await;
            }
        });
        PingWorker { handle }
    }
}

/// Stops the async ping loop when dropped or told to.
pub struct PingWorker {
    handle: tokio::task::JoinHandle<()>,
}

impl PingWorker {
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PingWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // classic RFC 1071 worked example
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2u16);
    }

    #[test]
    fn test_checksum_odd_length() {
        // trailing byte is padded with zero on the right
        assert_eq!(checksum(&[0xff]), !0xff00u16);
    }

    #[test]
    fn test_echo_request_v4_self_checks() {
        let packet = build_echo(false, 0x1234, 7);
        assert_eq!(packet[0], ICMPV4_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0, 7]);
        // a packet with its checksum in place sums to zero
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_echo_request_v6_leaves_checksum_to_kernel() {
        let packet = build_echo(true, 1, 0);
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&packet[2..4], &[0, 0]);
    }

    #[test]
    fn test_parse_reply_with_ip_header() {
        // 20-byte IPv4 header in front of the echo reply
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0; 19]);
        datagram.extend_from_slice(&[ICMPV4_ECHO_REPLY, 0, 0, 0, 0xab, 0xcd, 0, 3]);
        assert_eq!(parse_reply(false, &datagram), Some((0xabcd, 3)));
    }

    #[test]
    fn test_parse_reply_bare() {
        let datagram = [ICMPV6_ECHO_REPLY, 0, 0, 0, 0, 9, 0, 1];
        assert_eq!(parse_reply(true, &datagram), Some((9, 1)));
        // a request is not a reply
        let datagram = [ICMPV6_ECHO_REQUEST, 0, 0, 0, 0, 9, 0, 1];
        assert_eq!(parse_reply(true, &datagram), None);
    }

    #[test]
    fn test_floor3() {
        assert_eq!(floor3(1.23456), 1.234);
        assert_eq!(floor3(0.9999), 0.999);
        assert_eq!(floor3(5.0), 5.0);
    }
}
