use crate::config::{Family, KeepAlive, Protocol, SchemeConfig, SocketKind};
use crate::error::Error;
use log::debug;
use pki_types::ServerName;
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, TlsStream};

/// Object-safe byte stream, the common ground under plain, proxied and
/// layered TLS transports.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// One connected byte-stream transport, whichever flavor the scheme picked.
/// UDP travels outside this enum since it is not a byte stream. The TLS
/// variant boxes its inner stream so a tunnel through an HTTPS proxy can
/// layer TLS over TLS.
pub enum FlowStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<BoxedIo>>),
    Unix(UnixStream),
}

impl FlowStream {
    /// Receive buffer size of the underlying socket, used to size the
    /// broker's read buffer. Layered streams fall back to a sane default.
    pub fn recv_buffer_size(&self) -> usize {
        let probed = match self {
            FlowStream::Plain(stream) => SockRef::from(stream).recv_buffer_size().ok(),
            FlowStream::Secure(_) => None,
            FlowStream::Unix(stream) => SockRef::from(stream).recv_buffer_size().ok(),
        };
        probed.unwrap_or(64 * 1024).clamp(4 * 1024, 1 << 20)
    }

    pub fn into_boxed(self) -> BoxedIo {
        match self {
            FlowStream::Plain(stream) => Box::new(stream),
            FlowStream::Secure(stream) => stream as BoxedIo,
            FlowStream::Unix(stream) => Box::new(stream),
        }
    }
}

impl AsyncRead for FlowStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FlowStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            FlowStream::Secure(stream) => Pin::new(stream).poll_read(cx, buf),
            FlowStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            FlowStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            FlowStream::Secure(stream) => Pin::new(stream).poll_write(cx, buf),
            FlowStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FlowStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            FlowStream::Secure(stream) => Pin::new(stream).poll_flush(cx),
            FlowStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FlowStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            FlowStream::Secure(stream) => Pin::new(stream).poll_shutdown(cx),
            FlowStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

fn apply_keep_alive(socket: &Socket, keep_alive: &KeepAlive) -> std::io::Result<()> {
    let mut params = TcpKeepalive::new()
        .with_time(keep_alive.idle)
        .with_interval(keep_alive.intvl);
    #[cfg(not(windows))]
    {
        params = params.with_retries(keep_alive.cnt);
    }
    socket.set_tcp_keepalive(&params)
}

fn apply_bandwidth_raw(socket: &Socket, bandwidth: &crate::config::Bandwidth) -> std::io::Result<()> {
    if let Some(read) = &bandwidth.read {
        if let Ok(bytes) = crate::config::parse_bandwidth(read) {
            socket.set_recv_buffer_size(bytes.min(1 << 22) as usize)?;
        }
    }
    if let Some(write) = &bandwidth.write {
        if let Ok(bytes) = crate::config::parse_bandwidth(write) {
            socket.set_send_buffer_size(bytes.min(1 << 22) as usize)?;
        }
    }
    Ok(())
}

/// Opens a stream socket towards `addr` honoring the scheme's family, socket
/// kind, keep-alive and bandwidth options. SCTP rides the same code path as
/// TCP: a one-to-one SCTP socket behaves as a byte stream once connected.
pub async fn connect_stream(addr: SocketAddr, config: &SchemeConfig) -> Result<TcpStream, Error> {
    let domain = match config.family {
        Family::Ipv6 => Domain::IPV6,
        _ => Domain::IPV4,
    };
    let protocol = match config.sonet {
        SocketKind::Sctp => {
            if !(cfg!(target_os = "linux") || cfg!(target_os = "freebsd")) {
                return Err(Error::UnsupportedTransport("sctp"));
            }
            // IPPROTO_SCTP; a one-to-one SCTP socket is a byte stream
            Some(SockProtocol::from(132))
        }
        SocketKind::Dtls => return Err(Error::UnsupportedTransport("dtls")),
        _ => None,
    };
    let keep_alive = config.keep_alive;
    let sonet = config.sonet;
    let bandwidth = config.bandwidth.clone();
    let connect_timeout = config.timeouts.connect;
    // socket2 only connects synchronously, so the dial runs on the blocking
    // pool and the connected fd is handed to tokio afterwards
    let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let socket = Socket::new(domain, Type::STREAM, protocol)?;
        apply_keep_alive(&socket, &keep_alive)?;
        apply_bandwidth_raw(&socket, &bandwidth)?;
        if sonet != SocketKind::Sctp {
            socket.set_nodelay(true)?;
        }
        socket.connect_timeout(&addr.into(), connect_timeout)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
    .await
    .map_err(|_| Error::CommunicationError)??;
    let stream = TcpStream::from_std(std_stream)?;
    debug!("connected to {} over {:?}", addr, config.sonet);
    Ok(stream)
}

/// Connects a UNIX-domain socket at the scheme's derived path.
#[cfg(unix)]
pub async fn connect_unix(config: &SchemeConfig) -> Result<UnixStream, Error> {
    let path = config.unix_socket_path();
    let stream = timeout(config.timeouts.connect, UnixStream::connect(&path)).await??;
    Ok(stream)
}

#[cfg(not(unix))]
pub async fn connect_unix(_config: &SchemeConfig) -> Result<UnixStream, Error> {
    Err(Error::UnsupportedTransport("unix"))
}

/// Builds a client TLS config: webpki roots plus an optional CA bundle,
/// ALPN derived from the scheme's protocol.
pub fn client_tls_config(
    ca_file: Option<&str>,
    proto: Protocol,
) -> Result<Arc<rustls::ClientConfig>, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_file {
        let pem = std::fs::read(path)?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| Error::TlsHandshake(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| Error::TlsHandshake(e.to_string()))?;
        }
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = match proto {
        Protocol::Http2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        Protocol::Http1 | Protocol::Http11 => vec![b"http/1.1".to_vec()],
        Protocol::Raw => Vec::new(),
    };
    Ok(Arc::new(config))
}

/// Wraps an established stream in client TLS; returns the stream and the
/// ALPN-selected protocol, if any.
pub async fn wrap_tls(
    stream: BoxedIo,
    host: &str,
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: std::time::Duration,
) -> Result<(FlowStream, Option<Vec<u8>>), Error> {
    let connector = TlsConnector::from(tls);
    let server_name = ServerName::try_from(host.to_string())?;
    let tls_stream = timeout(connect_timeout, connector.connect(server_name, stream))
        .await?
        .map_err(|e| Error::TlsHandshake(e.to_string()))?;
    let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    Ok((
        FlowStream::Secure(Box::new(TlsStream::Client(tls_stream))),
        alpn,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_follows_protocol() {
        let h2 = client_tls_config(None, Protocol::Http2).unwrap();
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let h1 = client_tls_config(None, Protocol::Http11).unwrap();
        assert_eq!(h1.alpn_protocols, vec![b"http/1.1".to_vec()]);
        let raw = client_tls_config(None, Protocol::Raw).unwrap();
        assert!(raw.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_connect_stream_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SchemeConfig::default();
        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect_stream(addr, &config).await.unwrap();
        accept.await.unwrap().unwrap();
        let flow = FlowStream::Plain(stream);
        assert!(flow.recv_buffer_size() >= 4 * 1024);
    }

    #[tokio::test]
    async fn test_dtls_refused() {
        let mut config = SchemeConfig::default();
        config.sonet = SocketKind::Dtls;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            connect_stream(addr, &config).await,
            Err(Error::UnsupportedTransport("dtls"))
        ));
    }
}
