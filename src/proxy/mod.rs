pub mod connect;
pub mod socks5;

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::Error;
use crate::http::auth::AuthClient;
use connect::ConnectMachine;
use socks5::{Socks5Machine, Socks5State, TargetAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Drives whichever proxy negotiation the scheme configured over an already
/// connected stream. Returns any bytes read past the end of the negotiation;
/// they belong to the application protocol.
pub async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    auth: Option<AuthClient>,
    attempts: usize,
) -> Result<Vec<u8>, Error> {
    match proxy.kind {
        ProxyKind::Socks5 => {
            let target = match target_host.parse() {
                Ok(ip) => TargetAddr::Ip(ip, target_port),
                Err(_) => TargetAddr::Domain(target_host.to_string(), target_port),
            };
            let mut machine = Socks5Machine::new(target, proxy.credentials());
            stream.write_all(&machine.start()).await?;
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 512];
            while machine.state() != Socks5State::Established {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::ProxyNegotiation(
                        "proxy closed during negotiation".to_string(),
                    ));
                }
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    let (consumed, reply) = machine.advance(&buffer)?;
                    if consumed == 0 {
                        break;
                    }
                    buffer.drain(..consumed);
                    if !reply.is_empty() {
                        stream.write_all(&reply).await?;
                    }
                    if machine.state() == Socks5State::Established {
                        break;
                    }
                }
            }
            Ok(buffer)
        }
        ProxyKind::Http | ProxyKind::Https => {
            let mut machine = ConnectMachine::new(target_host, target_port, auth, attempts);
            let request = machine.request();
            stream.write_all(&request).await?;
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 2048];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::ProxyNegotiation(
                        "proxy closed during CONNECT".to_string(),
                    ));
                }
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    let (consumed, retry) = machine.advance(&buffer)?;
                    buffer.drain(..consumed);
                    if let Some(retry) = retry {
                        stream.write_all(&retry).await?;
                    }
                    if machine.established() {
                        return Ok(buffer);
                    }
                    if consumed == 0 {
                        break;
                    }
                }
            }
        }
    }
}
