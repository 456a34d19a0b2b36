use crate::config::ClientConfig;
use crate::error::Error;
use crate::event::{ActiveFlag, Event, HttpEntity};
use crate::http::auth::{AuthClient, AuthOutcome};
use crate::http::model::{Request, Response};
use crate::node::{EngineMessage, Node, NodeOptions};
use crate::ws::Message;
use log::{debug, warn};
use std::collections::VecDeque;
use url::Url;

/// Request/response orchestration over the node: protocol selection rides
/// ALPN (or prior knowledge for plaintext HTTP/2), redirects and
/// authentication retries are bounded by `attempts`.
pub struct WebClient {
    node: std::sync::Arc<Node>,
    events: crate::event::EventStream,
    config: ClientConfig,
    auth: Option<AuthClient>,
    /// Events for brokers other than the one a call is waiting on.
    pending: VecDeque<Event>,
}

impl WebClient {
    pub fn new(config: ClientConfig) -> Self {
        let (node, events) = Node::new(NodeOptions {
            memory_available_size: config.scheme.memory_available_size,
            ca_file: config.ca_file.clone(),
        });
        let auth = config.scheme.auth.clone().map(AuthClient::new);
        Self {
            node,
            events,
            config,
            auth,
            pending: VecDeque::new(),
        }
    }

    pub fn node(&self) -> &std::sync::Arc<Node> {
        &self.node
    }

    /// Convenience GET.
    pub async fn get(&mut self, url: &str) -> Result<Response, Error> {
        let request = Request::new("GET", Url::parse(url)?);
        self.fetch(request).await
    }

    /// Sends the request and waits for the final response, following
    /// redirects and answering authentication challenges along the way.
    pub async fn fetch(&mut self, mut request: Request) -> Result<Response, Error> {
        let mut attempts = self.config.scheme.attempts;
        loop {
            let response = self.exchange(&mut request).await?;
            if response.is_redirect() && attempts > 0 {
                let Some(location) = response.headers.get("Location") else {
                    return Ok(response);
                };
                let target = request.url.join(location)?;
                debug!("redirect {} -> {}", response.status, target);
                // 303 demotes the method to GET and drops the body
                if response.status == 303 {
                    request.method = "GET".to_string();
                    request.body.clear();
                }
                request.url = target;
                attempts -= 1;
                continue;
            }
            if response.status == 401 && attempts > 0 {
                if let (Some(auth), Some(challenge)) = (
                    self.auth.as_mut(),
                    response.headers.get("WWW-Authenticate"),
                ) {
                    match auth.on_challenge(challenge) {
                        AuthOutcome::Retry => {
                            attempts -= 1;
                            continue;
                        }
                        AuthOutcome::Good => {}
                        AuthOutcome::Fault => {
                            return Err(Error::AuthExhausted(
                                self.config.scheme.attempts - attempts,
                            ))
                        }
                    }
                }
            }
            if let Some(auth) = self.auth.as_mut() {
                if (200..300).contains(&response.status) {
                    auth.on_accepted();
                }
            }
            return Ok(response);
        }
    }

    // One wire exchange: open a broker, send, wait for its entity.
    async fn exchange(&mut self, request: &mut Request) -> Result<Response, Error> {
        let mut scheme_config = self.config.scheme.clone();
        scheme_config.url = request.url.to_string();
        let sid = self.node.scheme(scheme_config)?;
        let bid = self.node.connect(sid).await?;

        if let Some(auth) = self.auth.as_mut() {
            let target = request.request_target();
            if let Some(value) = auth.header_value(&request.method, &target) {
                request.headers.set("Authorization", value);
            }
        }
        self.node
            .send_message(bid, EngineMessage::Request(Box::new(request.clone())))?;

        let result = self.wait_entity(bid).await;
        self.node.close(bid);
        let _ = self.node.remove(sid);
        result
    }

    async fn wait_entity(&mut self, bid: u64) -> Result<Response, Error> {
        use futures::StreamExt;
        loop {
            let event = match self.events.next().await {
                Some(event) => event,
                None => return Err(Error::CommunicationError),
            };
            match event {
                Event::Entity(event_bid, HttpEntity::Response(response)) if event_bid == bid => {
                    return Ok(*response);
                }
                Event::Error(event_bid, kind, message) if event_bid == bid => {
                    warn!("broker {} failed: {:?} {}", bid, kind, message);
                    return Err(Error::ProxyNegotiation(message));
                }
                Event::Active(event_bid, ActiveFlag::Disconnect) if event_bid == bid => {
                    return Err(Error::IOError {
                        source: std::io::Error::new(
                            std::io::ErrorKind::ConnectionAborted,
                            "connection closed before a response arrived",
                        ),
                    });
                }
                // headers/complete for our broker are milestones, not results
                Event::Headers(event_bid, _) | Event::Complete(event_bid)
                    if event_bid == bid => {}
                Event::Active(event_bid, ActiveFlag::Connect) if event_bid == bid => {}
                other => self.pending.push_back(other),
            }
        }
    }

    /// Opens a websocket broker; messages arrive through [`Self::next_event`].
    pub async fn ws_connect(&mut self, url: &str) -> Result<u64, Error> {
        let mut scheme_config = self.config.scheme.clone();
        scheme_config.url = url.to_string();
        let sid = self.node.scheme(scheme_config)?;
        self.node.connect(sid).await
    }

    pub fn send(&self, bid: u64, message: Message) -> Result<(), Error> {
        self.node.send_message(bid, EngineMessage::Ws(message))
    }

    pub fn send_ping(&self, bid: u64, payload: Vec<u8>) -> Result<(), Error> {
        self.node.send_message(bid, EngineMessage::WsPing(payload))
    }

    pub fn close(&self, bid: u64) {
        self.node.close(bid);
    }

    /// The next stack event: buffered ones first, then the live stream.
    pub async fn next_event(&mut self) -> Option<Event> {
        use futures::StreamExt;
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        self.events.next().await
    }

    /// Closes every broker and tears the node down.
    pub fn stop(&self) {
        self.node.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemeConfig;

    #[test]
    fn test_client_construction() {
        let client = WebClient::new(ClientConfig {
            scheme: SchemeConfig::default(),
            ca_file: None,
        });
        assert!(!client.node.has(1));
    }

    #[tokio::test]
    async fn test_fetch_against_unreachable_host_fails() {
        let mut scheme = SchemeConfig::default();
        scheme.timeouts.connect = std::time::Duration::from_millis(200);
        scheme.attempts = 1;
        let mut client = WebClient::new(ClientConfig {
            scheme,
            ca_file: None,
        });
        // TEST-NET-1 is unroutable, the dial must fail fast
        let result = client.get("http://192.0.2.1:9/").await;
        assert!(result.is_err());
    }
}
