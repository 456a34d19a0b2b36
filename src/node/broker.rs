use crate::config::{Http2Settings, Timeouts};
use crate::error::Error;
use crate::event::{ActiveFlag, Event, HttpEntity};
use crate::node::engine::{Engine, EngineEvent, EngineMessage, ProtocolEngine};
use crate::node::net::FlowStream;
use crate::node::queue::{PayloadQueue, QueueSignal};
use bytes::BytesMut;
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::timeout;

/// Commands a handle can push into the broker task.
pub enum Control {
    Message(EngineMessage),
    Settings(Http2Settings),
    Close,
}

/// The externally held face of a broker: sending and closing. Cloneable so
/// the registry can hand it out; the I/O task owns everything else.
#[derive(Clone)]
pub struct BrokerHandle {
    pub id: u64,
    pub sid: u64,
    queue: Arc<PayloadQueue>,
    notify: Arc<Notify>,
    control: mpsc::UnboundedSender<Control>,
    events: mpsc::Sender<Event>,
}

impl BrokerHandle {
    /// Copies raw bytes into the payload queue. Returns false (and emits an
    /// `unavailable` event) when either memory cap rejects the payload.
    pub fn send(&self, data: Vec<u8>) -> bool {
        match self.queue.push(data) {
            QueueSignal::Accepted => {
                self.notify.notify_one();
                true
            }
            QueueSignal::Rejected(bytes) => {
                let _ = self.events.try_send(Event::Unavailable(self.id, bytes));
                false
            }
            _ => true,
        }
    }

    /// Hands a protocol-level message to the engine inside the task.
    pub fn send_message(&self, message: EngineMessage) -> Result<(), Error> {
        self.control
            .send(Control::Message(message))
            .map_err(|_| Error::UnknownBroker(self.id))
    }

    pub fn update_settings(&self, settings: Http2Settings) -> Result<(), Error> {
        self.control
            .send(Control::Settings(settings))
            .map_err(|_| Error::UnknownBroker(self.id))
    }

    /// Idempotent: the first close wins, later ones land on a gone channel.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.used()
    }
}

/// The I/O half: owns the transport, the engine and the queue drain side.
pub struct BrokerTask {
    pub id: u64,
    pub sid: u64,
    pub stream: FlowStream,
    pub engine: Engine,
    pub queue: Arc<PayloadQueue>,
    pub notify: Arc<Notify>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub events: mpsc::Sender<Event>,
    pub timeouts: Timeouts,
    /// Bytes already read past the proxy negotiation, fed first.
    pub initial: Vec<u8>,
}

pub fn channel_pair(
    id: u64,
    sid: u64,
    queue: Arc<PayloadQueue>,
    events: mpsc::Sender<Event>,
) -> (BrokerHandle, mpsc::UnboundedReceiver<Control>, Arc<Notify>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let notify = Arc::new(Notify::new());
    (
        BrokerHandle {
            id,
            sid,
            queue,
            notify: notify.clone(),
            control: control_tx,
            events,
        },
        control_rx,
        notify,
    )
}

impl BrokerTask {
    /// Runs until the peer goes away, a timer fires, or a close lands.
    /// Reads, decoded events, queue drain and timers share one task, which
    /// is what keeps per-broker ordering strict.
    pub async fn run(mut self) {
        let _ = self
            .events
            .send(Event::Active(self.id, ActiveFlag::Connect))
            .await;

        let result = self.drive().await;

        // teardown: the queue memory goes back to the pool and one final
        // available event lets producers move on
        let freed = self.queue.clear();
        if freed > 0 {
            let _ = self.events.send(Event::Available(self.id, freed)).await;
        }
        if let Err(error) = result {
            let _ = self
                .events
                .send(Event::Error(self.id, error.kind(), error.to_string()))
                .await;
        }
        let _ = self
            .events
            .send(Event::Active(self.id, ActiveFlag::Disconnect))
            .await;
        debug!("broker {} finished", self.id);
    }

    async fn drive(&mut self) -> Result<(), Error> {
        let read_chunk = self.stream.recv_buffer_size();
        let mut read_buf = vec![0u8; read_chunk];
        let mut acc = BytesMut::with_capacity(read_chunk);
        let mut startup = BytesMut::new();
        self.engine.startup(&mut startup);
        if !startup.is_empty() {
            self.write_all(&startup).await?;
        }
        if !self.initial.is_empty() {
            let initial = std::mem::take(&mut self.initial);
            acc.extend_from_slice(&initial);
            if self.process_input(&mut acc).await? {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                read = timeout(self.timeouts.wait, self.stream.read(&mut read_buf)) => {
                    let n = read??;
                    if n == 0 {
                        debug!("broker {}: peer closed", self.id);
                        let mut events = Vec::new();
                        self.engine.on_eof(&mut events)?;
                        self.forward_events(events).await?;
                        return Ok(());
                    }
                    acc.extend_from_slice(&read_buf[..n]);
                    if self.process_input(&mut acc).await? {
                        return Ok(());
                    }
                }
                command = self.control.recv() => {
                    match command {
                        Some(Control::Message(message)) => {
                            let mut wire = BytesMut::new();
                            self.engine.encode(message, &mut wire)?;
                            self.enqueue(wire.to_vec()).await;
                            self.flush_queue().await?;
                        }
                        Some(Control::Settings(settings)) => {
                            let mut wire = BytesMut::new();
                            self.engine.on_settings_change(&settings, &mut wire);
                            if !wire.is_empty() {
                                self.write_all(&wire).await?;
                            }
                        }
                        Some(Control::Close) | None => {
                            return self.orderly_close().await;
                        }
                    }
                }
                _ = self.notify.notified() => {
                    self.flush_queue().await?;
                }
            }
        }
    }

    // Decodes everything buffered, forwards events, writes protocol replies.
    // Returns true when the engine observed a close from the peer.
    async fn process_input(&mut self, acc: &mut BytesMut) -> Result<bool, Error> {
        let mut events = Vec::new();
        let mut reply = BytesMut::new();
        let decoded = self.engine.decode(acc, &mut events, &mut reply);
        if !reply.is_empty() {
            self.write_all(&reply).await?;
        }
        decoded?;
        self.forward_events(events).await
    }

    async fn forward_events(&mut self, events: Vec<EngineEvent>) -> Result<bool, Error> {
        let mut peer_closed = false;
        for event in events {
            match event {
                EngineEvent::Message(message) => {
                    // awaiting channel capacity is the read backpressure:
                    // no further reads until the consumer caught up
                    self.events
                        .send(Event::Message(self.id, message))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Pong(_) => {}
                EngineEvent::Close(code, reason) => {
                    debug!(
                        "broker {}: peer close {:?} {:?}",
                        self.id, code, reason
                    );
                    peer_closed = true;
                }
                EngineEvent::Headers(headers) => {
                    self.events
                        .send(Event::Headers(self.id, headers))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Entity(response) => {
                    self.events
                        .send(Event::Entity(self.id, HttpEntity::Response(response)))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Request(request) => {
                    self.events
                        .send(Event::Entity(self.id, HttpEntity::Request(request)))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Complete => {
                    self.events
                        .send(Event::Complete(self.id))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::StreamEnd(stream_id) => {
                    self.events
                        .send(Event::End(self.id, stream_id))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Origin(origins) => {
                    self.events
                        .send(Event::Origin(self.id, origins))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::Altsvc(origin, value) => {
                    self.events
                        .send(Event::Altsvc(self.id, origin, value))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                EngineEvent::RemoteSettings(_) => {}
            }
        }
        Ok(peer_closed)
    }

    async fn enqueue(&mut self, wire: Vec<u8>) {
        if wire.is_empty() {
            return;
        }
        match self.queue.push(wire) {
            QueueSignal::Accepted => {}
            QueueSignal::Rejected(bytes) => {
                warn!("broker {}: queue rejected {} bytes", self.id, bytes);
                let _ = self.events.send(Event::Unavailable(self.id, bytes)).await;
            }
            _ => {}
        }
    }

    // Writes queued payloads head-first; partial socket writes advance the
    // head rather than popping it.
    async fn flush_queue(&mut self) -> Result<(), Error> {
        while let Some(head) = self.queue.peek() {
            let written = timeout(self.timeouts.write, self.stream.write(&head)).await??;
            if written == 0 {
                return Err(Error::IOError {
                    source: std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "socket refused queued bytes",
                    ),
                });
            }
            if let QueueSignal::Drained(freed) = self.queue.advance(written) {
                let _ = self.events.send(Event::Available(self.id, freed)).await;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_all(&mut self, wire: &[u8]) -> Result<(), Error> {
        timeout(self.timeouts.write, self.stream.write_all(wire)).await??;
        timeout(self.timeouts.write, self.stream.flush()).await??;
        Ok(())
    }

    async fn orderly_close(&mut self) -> Result<(), Error> {
        // drain whatever is queued best-effort, then the protocol goodbye
        if let Err(error) = self.flush_queue().await {
            warn!("broker {}: drain on close failed: {}", self.id, error);
        }
        let mut goodbye = BytesMut::new();
        self.engine.close(&mut goodbye)?;
        if !goodbye.is_empty() {
            if let Err(error) = self.write_all(&goodbye).await {
                warn!("broker {}: close frame failed: {}", self.id, error);
            }
        }
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Datagram sibling of [`BrokerTask`]: one UDP socket, one datagram per
/// queued payload, RAW framing only.
pub struct UdpBrokerTask {
    pub id: u64,
    pub sid: u64,
    pub socket: tokio::net::UdpSocket,
    pub queue: Arc<PayloadQueue>,
    pub notify: Arc<Notify>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub events: mpsc::Sender<Event>,
    pub timeouts: Timeouts,
}

impl UdpBrokerTask {
    pub async fn run(mut self) {
        let _ = self
            .events
            .send(Event::Active(self.id, ActiveFlag::Connect))
            .await;
        let result = self.drive().await;
        let freed = self.queue.clear();
        if freed > 0 {
            let _ = self.events.send(Event::Available(self.id, freed)).await;
        }
        if let Err(error) = result {
            let _ = self
                .events
                .send(Event::Error(self.id, error.kind(), error.to_string()))
                .await;
        }
        let _ = self
            .events
            .send(Event::Active(self.id, ActiveFlag::Disconnect))
            .await;
    }

    async fn drive(&mut self) -> Result<(), Error> {
        let mut read_buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                received = timeout(self.timeouts.wait, self.socket.recv(&mut read_buf)) => {
                    let n = received??;
                    self.events
                        .send(Event::Message(
                            self.id,
                            crate::ws::Message::Binary(read_buf[..n].to_vec()),
                        ))
                        .await
                        .map_err(|_| Error::CommunicationError)?;
                }
                command = self.control.recv() => {
                    match command {
                        Some(Control::Message(EngineMessage::Data(data))) => {
                            if let QueueSignal::Rejected(bytes) = self.queue.push(data) {
                                let _ = self
                                    .events
                                    .send(Event::Unavailable(self.id, bytes))
                                    .await;
                            }
                            self.flush().await?;
                        }
                        Some(Control::Message(EngineMessage::Ws(message))) => {
                            if let QueueSignal::Rejected(bytes) =
                                self.queue.push(message.into_payload())
                            {
                                let _ = self
                                    .events
                                    .send(Event::Unavailable(self.id, bytes))
                                    .await;
                            }
                            self.flush().await?;
                        }
                        Some(Control::Message(_)) | Some(Control::Settings(_)) => {
                            warn!("broker {}: message kind not valid over UDP", self.id);
                        }
                        Some(Control::Close) | None => return Ok(()),
                    }
                }
                _ = self.notify.notified() => {
                    self.flush().await?;
                }
            }
        }
    }

    // Each queued payload leaves as exactly one datagram.
    async fn flush(&mut self) -> Result<(), Error> {
        while let Some(head) = self.queue.peek() {
            let _ = timeout(self.timeouts.write, self.socket.send(&head)).await??;
            if let QueueSignal::Drained(freed) = self.queue.advance(head.len()) {
                let _ = self.events.send(Event::Available(self.id, freed)).await;
            }
        }
        Ok(())
    }
}
