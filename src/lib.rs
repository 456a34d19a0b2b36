//! Async client/server networking stack for the Tokio runtime.
//!
//! This library speaks HTTP/1.1, HTTP/2 and the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! over TCP, TLS, UDP and SCTP transports, with an integrated DNS resolver,
//! SOCKS5 and HTTP CONNECT proxy clients, per-message compression
//! (RFC 7692), payload encryption and ICMP echo probing.
//!
//! The building blocks stack the way the bytes flow: frame and message
//! codecs at the bottom, protocol engines above them, then per-connection
//! brokers with bounded payload queues, and the [`client::WebClient`] /
//! [`server::WebServer`] facades on top.

pub mod client;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod event;
pub mod http;
pub mod http1;
pub mod http2;
pub mod node;
pub mod ping;
pub mod proxy;
pub mod server;
pub mod ws;

pub use client::WebClient;
pub use config::{ClientConfig, SchemeConfig, ServerConfig};
pub use error::{Error, ErrorKind};
pub use event::{ActiveFlag, Event, EventStream};
pub use server::WebServer;
pub use ws::Message;
