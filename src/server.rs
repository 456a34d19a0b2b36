use crate::config::{Protocol, ServerConfig};
use crate::error::Error;
use crate::event::EventStream;
use crate::http::model::{Identity, Response};
use crate::node::engine::{Engine, Http1Engine, Http2Engine, RawEngine, Ws1Engine};
use crate::node::net::FlowStream;
use crate::node::{EngineMessage, Node, NodeOptions};
use crate::ws::extensions::Extensions;
use crate::ws::frame::Role;
use crate::ws::handshake::{server_upgrade, ServerHandshake};
use crate::ws::Message;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Accept-side facade: listens, upgrades, adopts each connection as a broker
/// and surfaces everything through one [`EventStream`].
pub struct WebServer {
    node: Arc<Node>,
    sid: u64,
}

impl WebServer {
    /// Binds and starts accepting. Returns the server handle plus the event
    /// stream carrying connects, messages, requests and errors.
    pub async fn start(port: u16, config: ServerConfig) -> Result<(Self, EventStream), Error> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        let (node, events) = Node::new(NodeOptions {
            memory_available_size: config.scheme.memory_available_size,
            ca_file: None,
        });
        let sid = node.scheme(config.scheme.clone())?;
        let websocket = config.scheme.url.starts_with("ws");
        let tls_config = config.tls_config.clone();
        let scheme_config = config.scheme.clone();
        let accept_node = node.clone();
        let accept_sid = sid;

        // The accept loop lives in its own task; each connection is adopted
        // as a broker so the per-connection I/O shares the usual machinery.
        tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept failed: {}", err);
                        continue;
                    }
                };
                info!("accepted {}", peer);
                let node = accept_node.clone();
                let tls_config = tls_config.clone();
                let scheme_config = scheme_config.clone();
                tokio::spawn(async move {
                    let mut alpn_h2 = false;
                    let mut stream = if let Some(tls) = tls_config {
                        let acceptor = TlsAcceptor::from(tls);
                        let boxed: crate::node::net::BoxedIo = Box::new(tcp);
                        match acceptor.accept(boxed).await {
                            Ok(tls_stream) => {
                                alpn_h2 = tls_stream.get_ref().1.alpn_protocol()
                                    == Some(&b"h2"[..]);
                                FlowStream::Secure(Box::new(tokio_rustls::TlsStream::Server(
                                    tls_stream,
                                )))
                            }
                            Err(err) => {
                                warn!("tls accept from {} failed: {}", peer, err);
                                return;
                            }
                        }
                    } else {
                        FlowStream::Plain(tcp)
                    };

                    let mut initial = Vec::new();
                    let engine = if websocket && !alpn_h2 {
                        let defaults = scheme_config
                            .compressors
                            .iter()
                            .any(|c| *c != crate::config::Compressor::None)
                            .then(|| Extensions {
                                permessage_deflate: true,
                                server_max_window_bits: Some(15),
                                ..Extensions::default()
                            });
                        let handshake = ServerHandshake {
                            defaults,
                            subprotocols: scheme_config.subprotocols.clone(),
                            server_name: Identity::default().agent(),
                        };
                        match server_upgrade(&mut stream, &handshake).await {
                            Ok((negotiated, leftover)) => {
                                initial = leftover;
                                Engine::Ws1(Ws1Engine::new(
                                    Role::Server,
                                    &negotiated,
                                    &scheme_config,
                                ))
                            }
                            Err(err) => {
                                warn!("upgrade from {} failed: {}", peer, err);
                                return;
                            }
                        }
                    } else if alpn_h2 || scheme_config.proto == Protocol::Http2 {
                        Engine::Http2(Http2Engine::new(&scheme_config, true))
                    } else if scheme_config.proto == Protocol::Raw {
                        Engine::Raw(RawEngine)
                    } else {
                        Engine::Http1(Http1Engine::new(&scheme_config, true))
                    };

                    if let Err(err) = node.adopt_stream(accept_sid, stream, engine, initial) {
                        error!("adopting {} failed: {}", peer, err);
                    }
                });
            }
        });

        Ok((Self { node, sid }, events))
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Answers an HTTP exchange; `stream_id` is 0 on HTTP/1 brokers.
    pub fn respond(&self, bid: u64, stream_id: u32, response: Response) -> Result<(), Error> {
        self.node
            .send_message(bid, EngineMessage::Response(stream_id, Box::new(response)))
    }

    pub fn send(&self, bid: u64, message: Message) -> Result<(), Error> {
        self.node.send_message(bid, EngineMessage::Ws(message))
    }

    pub fn close(&self, bid: u64) {
        self.node.close(bid);
    }

    pub fn stop(&self) {
        let _ = self.node.remove(self.sid);
        self.node.stop();
    }
}
