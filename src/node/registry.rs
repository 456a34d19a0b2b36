use crate::config::{Family, Http2Settings, Protocol, SchemeConfig, SocketKind};
use crate::dns::DnsResolver;
use crate::error::Error;
use crate::event::{Event, EventStream};
use crate::http::auth::AuthClient;
use crate::node::broker::{channel_pair, BrokerHandle, BrokerTask};
use crate::node::engine::{Engine, EngineMessage, Http1Engine, Http2Engine, RawEngine, Ws1Engine, Ws2Engine};
use crate::node::net::{client_tls_config, connect_stream, connect_unix, wrap_tls, FlowStream};
use crate::node::queue::{MemoryPool, PayloadQueue};
use crate::node::scheme::Scheme;
use crate::proxy;
use crate::ws::extensions::Extensions;
use crate::ws::frame::Role;
use crate::ws::handshake::{client_upgrade, ClientHandshake, Negotiated};
use bytes::BytesMut;
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Node options that sit above any single scheme.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Global cap on queued payload bytes across every broker.
    pub memory_available_size: usize,
    /// Extra CA bundle for client TLS.
    pub ca_file: Option<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            memory_available_size: 16 << 20,
            ca_file: None,
        }
    }
}

/// The registry at the center of the stack: schemes, brokers, the shared
/// memory pool and the event channel everything reports into.
///
/// Brokers and schemes are arena entries addressed by 64-bit ids; nothing
/// holds a reference cycle, handles carry ids plus channels.
pub struct Node {
    schemes: Mutex<HashMap<u64, Scheme>>,
    brokers: Mutex<HashMap<u64, BrokerHandle>>,
    next_scheme_id: AtomicU64,
    next_broker_id: AtomicU64,
    pool: Arc<MemoryPool>,
    events_tx: mpsc::Sender<Event>,
    dns: Mutex<Arc<DnsResolver>>,
    options: Mutex<NodeOptions>,
}

impl Node {
    pub fn new(options: NodeOptions) -> (Arc<Self>, EventStream) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let node = Arc::new(Self {
            schemes: Mutex::new(HashMap::new()),
            brokers: Mutex::new(HashMap::new()),
            next_scheme_id: AtomicU64::new(1),
            next_broker_id: AtomicU64::new(1),
            pool: MemoryPool::new(options.memory_available_size),
            events_tx,
            dns: Mutex::new(Arc::new(DnsResolver::new(Default::default()))),
            options: Mutex::new(options),
        });
        (node, EventStream::new(events_rx))
    }

    /// Registers a scheme, returning its id.
    pub fn scheme(&self, config: SchemeConfig) -> Result<u64, Error> {
        let sid = self.next_scheme_id.fetch_add(1, Ordering::Relaxed);
        let scheme = Scheme::new(sid, config)?;
        self.schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .insert(sid, scheme);
        debug!("scheme {} registered", sid);
        Ok(sid)
    }

    /// Removes a scheme, closing every broker it owns. The UNIX socket file,
    /// when one exists, goes away with it.
    pub fn remove(&self, sid: u64) -> Result<(), Error> {
        let scheme = self
            .schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .remove(&sid)
            .ok_or(Error::UnknownScheme(sid))?;
        for bid in &scheme.brokers {
            if let Some(handle) = self
                .brokers
                .lock()
                .expect("broker registry lock poisoned")
                .remove(bid)
            {
                handle.close();
            }
        }
        Ok(())
    }

    /// True when the id names a live scheme or broker.
    pub fn has(&self, id: u64) -> bool {
        self.schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .contains_key(&id)
            || self
                .brokers
                .lock()
                .expect("broker registry lock poisoned")
                .contains_key(&id)
    }

    pub fn broker(&self, bid: u64) -> Option<BrokerHandle> {
        self.brokers
            .lock()
            .expect("broker registry lock poisoned")
            .get(&bid)
            .cloned()
    }

    pub fn set_dns(&self, resolver: DnsResolver) {
        *self.dns.lock().expect("dns lock poisoned") = Arc::new(resolver);
    }

    pub fn dns(&self) -> Arc<DnsResolver> {
        self.dns.lock().expect("dns lock poisoned").clone()
    }

    pub fn set_family(&self, sid: u64, family: Family) -> Result<(), Error> {
        let mut schemes = self.schemes.lock().expect("scheme registry lock poisoned");
        let scheme = schemes.get_mut(&sid).ok_or(Error::UnknownScheme(sid))?;
        scheme.set_family(family)
    }

    pub fn set_ca_file(&self, path: Option<String>) {
        self.options.lock().expect("options lock poisoned").ca_file = path;
    }

    fn scheme_config(&self, sid: u64) -> Result<SchemeConfig, Error> {
        self.schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .get(&sid)
            .map(|scheme| scheme.config.clone())
            .ok_or(Error::UnknownScheme(sid))
    }

    /// Opens one broker for the scheme: resolve, dial (through the proxy
    /// when one is configured), TLS, protocol handshake, then the I/O task.
    pub async fn connect(self: &Arc<Self>, sid: u64) -> Result<u64, Error> {
        let config = self.scheme_config(sid)?;
        if config.sonet == SocketKind::Udp {
            return self.connect_udp(sid, &config).await;
        }
        // `alive` retries transient transport failures, bounded by attempts
        let mut attempt = 0usize;
        let (stream, engine, initial) = loop {
            match self.dial(&config).await {
                Ok(parts) => break parts,
                Err(error)
                    if config.alive
                        && attempt + 1 < config.attempts
                        && error.kind() == crate::error::ErrorKind::Transport =>
                {
                    attempt += 1;
                    debug!(
                        "dial for scheme {} failed ({}), retry {}/{}",
                        sid, error, attempt, config.attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Err(error) => return Err(error),
            }
        };

        let bid = self.next_broker_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(PayloadQueue::new(
            self.pool.clone(),
            config.broker_available_size,
        ));
        let (handle, control_rx, notify) =
            channel_pair(bid, sid, queue.clone(), self.events_tx.clone());
        self.brokers
            .lock()
            .expect("broker registry lock poisoned")
            .insert(bid, handle);
        if let Some(scheme) = self
            .schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .get_mut(&sid)
        {
            scheme.brokers.insert(bid);
        }

        let task = BrokerTask {
            id: bid,
            sid,
            stream,
            engine,
            queue,
            notify,
            control: control_rx,
            events: self.events_tx.clone(),
            timeouts: config.timeouts,
            initial,
        };
        let node = self.clone();
        tokio::spawn(async move {
            task.run().await;
            node.forget_broker(bid);
        });
        info!("broker {} connected for scheme {}", bid, sid);
        Ok(bid)
    }

    // Datagram brokers skip the whole stream pipeline: connect the socket,
    // run the UDP task, RAW payloads only.
    async fn connect_udp(self: &Arc<Self>, sid: u64, config: &SchemeConfig) -> Result<u64, Error> {
        let url = Url::parse(&config.url)?;
        let host = url.host_str().ok_or(Error::URLNoHost)?.to_string();
        let port = url.port().ok_or(Error::URLNoHost)?;
        let ip = self.dns().resolve(&host, config.family).await?;
        let bind_addr = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
        socket.connect(SocketAddr::new(ip, port)).await?;

        let bid = self.next_broker_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(PayloadQueue::new(
            self.pool.clone(),
            config.broker_available_size,
        ));
        let (handle, control_rx, notify) =
            channel_pair(bid, sid, queue.clone(), self.events_tx.clone());
        self.brokers
            .lock()
            .expect("broker registry lock poisoned")
            .insert(bid, handle);
        if let Some(scheme) = self
            .schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .get_mut(&sid)
        {
            scheme.brokers.insert(bid);
        }
        let task = crate::node::broker::UdpBrokerTask {
            id: bid,
            sid,
            socket,
            queue,
            notify,
            control: control_rx,
            events: self.events_tx.clone(),
            timeouts: config.timeouts,
        };
        let node = self.clone();
        tokio::spawn(async move {
            task.run().await;
            node.forget_broker(bid);
        });
        Ok(bid)
    }

    /// Adopts an already connected stream (a server-side accept) as a broker
    /// of the given scheme, spawning its I/O task. `initial` carries bytes
    /// already read past the handshake.
    pub fn adopt_stream(
        self: &Arc<Self>,
        sid: u64,
        stream: FlowStream,
        engine: Engine,
        initial: Vec<u8>,
    ) -> Result<u64, Error> {
        let config = self.scheme_config(sid)?;
        let bid = self.next_broker_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(PayloadQueue::new(
            self.pool.clone(),
            config.broker_available_size,
        ));
        let (handle, control_rx, notify) =
            channel_pair(bid, sid, queue.clone(), self.events_tx.clone());
        self.brokers
            .lock()
            .expect("broker registry lock poisoned")
            .insert(bid, handle);
        if let Some(scheme) = self
            .schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .get_mut(&sid)
        {
            scheme.brokers.insert(bid);
        }
        let task = BrokerTask {
            id: bid,
            sid,
            stream,
            engine,
            queue,
            notify,
            control: control_rx,
            events: self.events_tx.clone(),
            timeouts: config.timeouts,
            initial,
        };
        let node = self.clone();
        tokio::spawn(async move {
            task.run().await;
            node.forget_broker(bid);
        });
        Ok(bid)
    }

    fn forget_broker(&self, bid: u64) {
        if let Some(handle) = self
            .brokers
            .lock()
            .expect("broker registry lock poisoned")
            .remove(&bid)
        {
            let mut schemes = self.schemes.lock().expect("scheme registry lock poisoned");
            if let Some(scheme) = schemes.get_mut(&handle.sid) {
                scheme.brokers.remove(&bid);
            }
        }
    }

    async fn dial(&self, config: &SchemeConfig) -> Result<(FlowStream, Engine, Vec<u8>), Error> {
        let url = Url::parse(&config.url)?;
        let host = url.host_str().ok_or(Error::URLNoHost)?.to_string();
        let secure = matches!(url.scheme(), "wss" | "https")
            || matches!(config.sonet, SocketKind::Tls | SocketKind::Dtls);
        let port = url.port().unwrap_or(match url.scheme() {
            "ws" | "http" => 80,
            "wss" | "https" => 443,
            _ if secure => 443,
            _ => 80,
        });
        let websocket = matches!(url.scheme(), "ws" | "wss");

        // UNIX family short-circuits everything network-shaped
        if config.family == Family::Unix {
            let stream = FlowStream::Unix(connect_unix(config).await?);
            let engine = self.plain_engine(config, websocket, &url, None).await?;
            return match engine {
                DialEngine::Ready(engine) => Ok((stream, engine, Vec::new())),
                DialEngine::NeedsWsHandshake => {
                    self.ws1_over(stream, config, &url).await
                }
            };
        }

        let dns = self.dns();
        let mut initial = Vec::new();

        // dial either the proxy or the target
        let (dial_host, dial_port) = match &config.proxy {
            Some(proxy) => {
                let proxy_host = proxy.uri.host_str().ok_or(Error::URLNoHost)?.to_string();
                let proxy_port = proxy.uri.port().unwrap_or(1080);
                (proxy_host, proxy_port)
            }
            None => (host.clone(), port),
        };
        let ip = dns.resolve(&dial_host, config.family).await?;
        let addr = SocketAddr::new(ip, dial_port);
        let tcp = connect_stream(addr, config).await?;
        let mut stream = FlowStream::Plain(tcp);

        if let Some(proxy) = &config.proxy {
            let auth = config.auth.clone().map(AuthClient::new);
            initial =
                proxy::negotiate(&mut stream, proxy, &host, port, auth, config.attempts).await?;
        }

        let mut alpn = None;
        if secure {
            let tls = client_tls_config(
                self.options
                    .lock()
                    .expect("options lock poisoned")
                    .ca_file
                    .as_deref(),
                config.proto,
            )?;
            let (wrapped, selected) =
                wrap_tls(stream.into_boxed(), &host, tls, config.timeouts.connect).await?;
            stream = wrapped;
            alpn = selected;
        }

        let h2 = alpn.as_deref() == Some(&b"h2"[..])
            || (!secure && config.proto == Protocol::Http2);

        if websocket {
            if h2 {
                // RFC 8441: the tunnel opens inside the HTTP/2 session, the
                // handshake headers ride the extended CONNECT
                let negotiated = Negotiated::default();
                let mut engine = Ws2Engine::new(config, &negotiated);
                let mut dst = BytesMut::new();
                let authority = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.clone(),
                };
                let path = match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                };
                engine.open(&authority, &path, &mut dst)?;
                // preface, SETTINGS and the extended CONNECT go out before
                // the broker task takes over
                use tokio::io::AsyncWriteExt;
                stream.write_all(&dst).await?;
                stream.flush().await?;
                return Ok((stream, Engine::Ws2(Box::new(engine)), initial));
            }
            let (stream, engine, leftover) = self.ws1_over(stream, config, &url).await?;
            let mut carried = initial;
            carried.extend_from_slice(&leftover);
            return Ok((stream, engine, carried));
        }

        let engine = match (config.proto, h2) {
            (Protocol::Raw, _) => Engine::Raw(RawEngine),
            (_, true) => Engine::Http2(Http2Engine::new(config, false)),
            (Protocol::Http2, false) => {
                // the peer refused h2 on ALPN, fall back to HTTP/1.1
                Engine::Http1(Http1Engine::new(config, false))
            }
            _ => Engine::Http1(Http1Engine::new(config, false)),
        };
        Ok((stream, engine, initial))
    }

    async fn ws1_over(
        &self,
        mut stream: FlowStream,
        config: &SchemeConfig,
        url: &Url,
    ) -> Result<(FlowStream, Engine, Vec<u8>), Error> {
        let offer = if config
            .compressors
            .iter()
            .any(|compressor| *compressor != crate::config::Compressor::None)
        {
            Some(Extensions {
                permessage_deflate: true,
                client_max_window_bits: Some(15),
                ..Extensions::default()
            })
        } else {
            None
        };
        let handshake = ClientHandshake::new(
            url.clone(),
            offer,
            config.subprotocols.clone(),
            crate::http::model::Identity::default().agent(),
        );
        let (negotiated, leftover) = client_upgrade(&mut stream, &handshake).await?;
        let engine = Engine::Ws1(Ws1Engine::new(Role::Client, &negotiated, config));
        Ok((stream, engine, leftover))
    }

    async fn plain_engine(
        &self,
        config: &SchemeConfig,
        websocket: bool,
        _url: &Url,
        _alpn: Option<Vec<u8>>,
    ) -> Result<DialEngine, Error> {
        if websocket {
            return Ok(DialEngine::NeedsWsHandshake);
        }
        Ok(DialEngine::Ready(match config.proto {
            Protocol::Raw => Engine::Raw(RawEngine),
            Protocol::Http2 => Engine::Http2(Http2Engine::new(config, false)),
            _ => Engine::Http1(Http1Engine::new(config, false)),
        }))
    }

    /// Queues raw bytes for a broker; the `unavailable` event fires on a cap
    /// rejection and false comes back immediately.
    pub fn send(&self, bid: u64, data: Vec<u8>) -> bool {
        match self.broker(bid) {
            Some(handle) => handle.send(data),
            None => false,
        }
    }

    /// Queues a protocol message (request, websocket message, close).
    pub fn send_message(&self, bid: u64, message: EngineMessage) -> Result<(), Error> {
        self.broker(bid)
            .ok_or(Error::UnknownBroker(bid))?
            .send_message(message)
    }

    pub fn update_settings(&self, bid: u64, settings: Http2Settings) -> Result<(), Error> {
        self.broker(bid)
            .ok_or(Error::UnknownBroker(bid))?
            .update_settings(settings)
    }

    /// Starts an orderly close. Idempotent: closing a gone broker is a no-op.
    pub fn close(&self, bid: u64) {
        if let Some(handle) = self.broker(bid) {
            handle.close();
        }
    }

    /// Closes every broker and removes every scheme.
    pub fn stop(&self) {
        let handles: Vec<BrokerHandle> = self
            .brokers
            .lock()
            .expect("broker registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.close();
        }
        self.schemes
            .lock()
            .expect("scheme registry lock poisoned")
            .clear();
    }
}

enum DialEngine {
    Ready(Engine),
    NeedsWsHandshake,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let (node, _events) = Node::new(NodeOptions::default());
        let mut config = SchemeConfig::default();
        config.url = "http://127.0.0.1:1/".to_string();
        let sid = node.scheme(config).unwrap();
        assert!(node.has(sid));
        assert!(!node.has(sid + 100));
        node.remove(sid).unwrap();
        assert!(!node.has(sid));
        assert!(matches!(node.remove(sid), Err(Error::UnknownScheme(_))));
    }

    #[tokio::test]
    async fn test_family_switch_rules() {
        let (node, _events) = Node::new(NodeOptions::default());
        let mut config = SchemeConfig::default();
        config.url = "http://127.0.0.1:1/".to_string();
        let sid = node.scheme(config).unwrap();
        node.set_family(sid, Family::Ipv6).unwrap();
        assert!(matches!(
            node.set_family(sid + 9, Family::Ipv4),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_unknown_broker() {
        let (node, _events) = Node::new(NodeOptions::default());
        assert!(!node.send(42, b"data".to_vec()));
        assert!(matches!(
            node.send_message(42, EngineMessage::Data(Vec::new())),
            Err(Error::UnknownBroker(42))
        ));
    }

    #[tokio::test]
    async fn test_sctp_rejected_off_platform() {
        let mut config = SchemeConfig::default();
        config.sonet = SocketKind::Sctp;
        if !(cfg!(target_os = "linux") || cfg!(target_os = "freebsd")) {
            assert!(config.validate().is_err());
        } else {
            assert!(config.validate().is_ok());
        }
    }
}
