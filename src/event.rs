use crate::error::ErrorKind;
use crate::http::headers::Headers;
use crate::http::model::{Request, Response};
use crate::ws::Message;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::Receiver;

/// Broker identifier, an arena key handed out by the node.
pub type BrokerId = u64;

/// Connection lifecycle notifications carried by [`Event::Active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveFlag {
    Connect,
    Disconnect,
}

/// A complete HTTP message: requests on the server side, responses on the
/// client side.
#[derive(Debug)]
pub enum HttpEntity {
    Request(Box<Request>),
    Response(Box<Response>),
}

// Base enum, used as the structure to represent every single event within
// the stack, offering the end-user a practical way of driving clients and
// servers without wiring callbacks by hand.
#[derive(Debug)]
pub enum Event {
    /// A broker connected or disconnected.
    Active(BrokerId, ActiveFlag),
    /// A complete WebSocket message arrived.
    Message(BrokerId, Message),
    /// A complete HTTP message arrived.
    Entity(BrokerId, HttpEntity),
    /// Headers arrived before the body did.
    Headers(BrokerId, Headers),
    /// The current request/response exchange finished.
    Complete(BrokerId),
    /// The peer finished an HTTP/2 stream.
    End(BrokerId, u32),
    /// Something went wrong; the broker is closing.
    Error(BrokerId, ErrorKind, String),
    /// HTTP/2 ORIGIN frame contents.
    Origin(BrokerId, Vec<String>),
    /// HTTP/2 ALTSVC advertisement.
    Altsvc(BrokerId, String, String),
    /// The payload queue drained below its caps; `usize` is the freed room.
    Available(BrokerId, usize),
    /// The payload queue rejected a send; `usize` is the rejected size.
    Unavailable(BrokerId, usize),
}

// This struct will be used for implementing Stream trait. Thus, the end-user
// doesn't need to interact with the mpsc tokio channel directly
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll_recv(cx)
    }
}
