//! Socket adapters.
//!
//! A [`Transport`] is a boxed frame sink plus a boxed frame stream. Server
//! sockets (axum), client sockets (tokio-tungstenite), and in-memory pairs all
//! reduce to the same shape so [`Connection`](crate::Connection) has exactly one
//! read loop and one write loop.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{self as axum_ws, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    self,
    error::CapacityError,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

use crate::errors::WsError;
use crate::message::{Message, MessageKind};

/// Outbound half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Inbound half of a socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// One bidirectional socket, split into halves.
pub struct Transport {
    pub(crate) sink: FrameSink,
    pub(crate) stream: FrameStream,
    pub(crate) local_addr: String,
    pub(crate) remote_addr: String,
    /// The underlying library replies to pings on its own.
    pub(crate) answers_pings: bool,
}

impl Transport {
    /// Wrap arbitrary halves.
    pub fn new(
        sink: FrameSink,
        stream: FrameStream,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            stream,
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            answers_pings: false,
        }
    }

    /// Wrap a client-side tokio-tungstenite stream.
    pub fn from_tungstenite<S>(
        ws: WebSocketStream<S>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = MapErrors::new(sink, map_tungstenite_error)
            .with(|m: Message| future::ready(Ok::<_, WsError>(to_tungstenite(m))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(m) => from_tungstenite(m).map(Ok),
                Err(e) => Some(Err(map_tungstenite_error(e))),
            })
        });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            answers_pings: true,
        }
    }

    /// Wrap a server-side axum socket.
    pub fn from_axum(
        ws: WebSocket,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        let (sink, stream) = ws.split();
        let sink = MapErrors::new(sink, |e: axum::Error| WsError::Transport(e.to_string()))
            .with(|m: Message| future::ready(Ok::<_, WsError>(to_axum(m))));
        let stream = stream.map(|item| {
            item.map(from_axum)
                .map_err(|e| WsError::Transport(e.to_string()))
        });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            answers_pings: true,
        }
    }

    /// Override the recorded addresses.
    #[must_use]
    pub fn with_addrs(mut self, local_addr: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        self.local_addr = local_addr.into();
        self.remote_addr = remote_addr.into();
        self
    }

    /// Local address string.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Remote address string.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("answers_pings", &self.answers_pings)
            .finish_non_exhaustive()
    }
}

/// Two in-memory transports wired back to back.
///
/// Frames written on one side are read on the other, in order. Nothing
/// answers pings automatically, so liveness replies are fully under the
/// control of the connection (or the test) on each side.
pub fn memory_pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, a_rx) = futures::channel::mpsc::channel::<Message>(capacity);
    let (b_tx, b_rx) = futures::channel::mpsc::channel::<Message>(capacity);

    let side = |tx: futures::channel::mpsc::Sender<Message>,
                rx: futures::channel::mpsc::Receiver<Message>,
                local: &str,
                remote: &str| {
        Transport::new(
            Box::pin(MapErrors::new(tx, |_: futures::channel::mpsc::SendError| {
                WsError::Closed
            })),
            Box::pin(rx.map(Ok::<Message, WsError>)),
            local,
            remote,
        )
    };

    (
        side(a_tx, b_rx, "memory:a", "memory:b"),
        side(b_tx, a_rx, "memory:b", "memory:a"),
    )
}

/// Maps every sink error through `map`.
///
/// `SinkExt::sink_map_err` consumes its mapper on the first error and panics
/// if the sink is polled again, which a write loop on a dead socket does.
struct MapErrors<S, F> {
    inner: S,
    map: F,
}

impl<S, F> MapErrors<S, F> {
    fn new(inner: S, map: F) -> Self {
        Self { inner, map }
    }
}

impl<S, F, Item, E> Sink<Item> for MapErrors<S, F>
where
    S: Sink<Item, Error = E> + Unpin,
    F: Fn(E) -> WsError + Unpin,
{
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_ready(cx).map_err(&this.map)
    }

    fn start_send(self: Pin<&mut Self>, item: Item) -> Result<(), WsError> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).start_send(item).map_err(&this.map)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(&this.map)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_close(cx).map_err(&this.map)
    }
}

pub(crate) fn map_tungstenite_error(err: tungstenite::Error) -> WsError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => WsError::Closed,
        tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
            WsError::MessageTooLarge {
                size,
                limit: max_size,
            }
        }
        other => WsError::Transport(other.to_string()),
    }
}

fn to_tungstenite(m: Message) -> tungstenite::Message {
    match m.kind() {
        MessageKind::Text => match m.as_text() {
            Some(text) => tungstenite::Message::Text(text.to_owned().into()),
            None => tungstenite::Message::Binary(m.into_payload()),
        },
        MessageKind::Binary => tungstenite::Message::Binary(m.into_payload()),
        MessageKind::Ping => tungstenite::Message::Ping(m.into_payload()),
        MessageKind::Pong => tungstenite::Message::Pong(m.into_payload()),
        MessageKind::Close => tungstenite::Message::Close(m.close_code().map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: m.close_reason().unwrap_or_default().to_owned().into(),
        })),
    }
}

fn from_tungstenite(m: tungstenite::Message) -> Option<Message> {
    Some(match m {
        tungstenite::Message::Text(t) => {
            Message::from_parts(MessageKind::Text, Bytes::copy_from_slice(t.as_str().as_bytes()))
        }
        tungstenite::Message::Binary(b) => Message::binary(b),
        tungstenite::Message::Ping(b) => Message::ping(b),
        tungstenite::Message::Pong(b) => Message::pong(b),
        tungstenite::Message::Close(frame) => match frame {
            Some(f) => Message::close(u16::from(f.code), f.reason.as_str()),
            None => Message::close_empty(),
        },
        // Raw frames only surface when reading with raw frame access enabled.
        tungstenite::Message::Frame(_) => return None,
    })
}

fn to_axum(m: Message) -> axum_ws::Message {
    match m.kind() {
        MessageKind::Text => match m.as_text() {
            Some(text) => axum_ws::Message::Text(text.to_owned().into()),
            None => axum_ws::Message::Binary(m.into_payload()),
        },
        MessageKind::Binary => axum_ws::Message::Binary(m.into_payload()),
        MessageKind::Ping => axum_ws::Message::Ping(m.into_payload()),
        MessageKind::Pong => axum_ws::Message::Pong(m.into_payload()),
        MessageKind::Close => axum_ws::Message::Close(m.close_code().map(|code| axum_ws::CloseFrame {
            code,
            reason: m.close_reason().unwrap_or_default().to_owned().into(),
        })),
    }
}

fn from_axum(m: axum_ws::Message) -> Message {
    match m {
        axum_ws::Message::Text(t) => {
            Message::from_parts(MessageKind::Text, Bytes::copy_from_slice(t.as_str().as_bytes()))
        }
        axum_ws::Message::Binary(b) => Message::binary(b),
        axum_ws::Message::Ping(b) => Message::ping(b),
        axum_ws::Message::Pong(b) => Message::pong(b),
        axum_ws::Message::Close(frame) => match frame {
            Some(f) => Message::close(f.code, f.reason.as_str()),
            None => Message::close_empty(),
        },
    }
}
