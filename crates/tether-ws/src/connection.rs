//! One live socket: bounded outbound queue, read/write loops, liveness hooks,
//! and an exactly-once close path.
//!
//! A [`Connection`] is created from a [`Transport`] and does nothing until
//! [`Connection::start`] spawns its two loops. Every way a connection can end
//! (peer close, I/O error, write timeout, oversize frame, explicit close)
//! funnels through one private shutdown routine guarded by an atomic flag, so
//! close hooks run once no matter how many callers race.

use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tether_core::ConnectionId;
use tether_settings::{ClientSettings, ServerSettings};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, WsError};
use crate::handler::{Handler, call_guarded};
use crate::message::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_TOO_LARGE, Message, MessageKind,
};
use crate::metrics::{
    WS_BYTES_RECEIVED_TOTAL, WS_BYTES_SENT_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_HANDLER_ERRORS_TOTAL, WS_MESSAGES_RECEIVED_TOTAL,
    WS_MESSAGES_SENT_TOTAL, WS_SEND_QUEUE_FULL_TOTAL, WS_SUBSCRIBER_DROPS_TOTAL, record_error,
};
use crate::transport::{FrameSink, FrameStream, Transport};

type PongHook = Arc<dyn Fn() + Send + Sync>;
type CloseHook = Box<dyn FnOnce(&Connection, Option<&WsError>) + Send>;

/// Per-connection tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Outbound queue capacity.
    pub send_queue_size: usize,
    /// Default capacity of subscriber queues.
    pub subscriber_queue_size: usize,
    /// Largest data message accepted in either direction.
    pub max_message_size: usize,
    /// Deadline for each socket write.
    pub write_timeout: Duration,
    /// Close the connection if nothing arrives for this long.
    pub read_timeout: Option<Duration>,
    /// Reply to pings when the transport does not do it itself.
    pub auto_pong: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_server(&ServerSettings::default())
    }
}

impl ConnectionConfig {
    /// Config for connections accepted by a server.
    pub fn from_server(settings: &ServerSettings) -> Self {
        Self {
            send_queue_size: settings.send_queue_size.max(1),
            subscriber_queue_size: settings.receive_queue_size.max(1),
            max_message_size: settings.max_message_size,
            write_timeout: settings.write_timeout(),
            read_timeout: settings.read_timeout(),
            auto_pong: true,
        }
    }

    /// Config for connections dialed by a client.
    pub fn from_client(settings: &ClientSettings) -> Self {
        Self {
            send_queue_size: settings.send_queue_size.max(1),
            subscriber_queue_size: settings.receive_queue_size.max(1),
            max_message_size: settings.max_message_size,
            write_timeout: settings.write_timeout(),
            read_timeout: settings.read_timeout(),
            auto_pong: true,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, loops not started yet.
    Idle,
    /// Read and write loops running.
    Open,
    /// Closed; terminal.
    Closed,
}

/// Traffic counters snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Frames written to the socket (data and control).
    pub messages_sent: u64,
    /// Data messages read from the socket.
    pub messages_received: u64,
    /// Payload bytes written.
    pub bytes_sent: u64,
    /// Payload bytes read.
    pub bytes_received: u64,
    /// Non-blocking sends rejected by a full queue.
    pub queue_full: u64,
    /// Fan-out deliveries skipped because a subscriber was slow.
    pub subscriber_drops: u64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    queue_full: AtomicU64,
    subscriber_drops: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            subscriber_drops: self.subscriber_drops.load(Ordering::Relaxed),
        }
    }
}

/// Serializable description of a connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection ID.
    pub id: ConnectionId,
    /// Local address.
    pub local_addr: String,
    /// Remote address.
    pub remote_addr: String,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Traffic counters.
    pub stats: ConnectionStats,
    /// Close error, if the connection ended with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_error: Option<String>,
}

/// One established WebSocket.
pub struct Connection {
    id: ConnectionId,
    local_addr: String,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    config: ConnectionConfig,
    answers_pings: bool,

    started: AtomicBool,
    closed: AtomicBool,
    close_error: Mutex<Option<WsError>>,

    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    sink: Mutex<Option<FrameSink>>,
    stream: Mutex<Option<FrameStream>>,

    metadata: DashMap<String, serde_json::Value>,
    subscribers: DashMap<u64, mpsc::Sender<Message>>,
    next_subscriber: AtomicU64,

    pong_hook: RwLock<Option<PongHook>>,
    close_hooks: Mutex<Vec<CloseHook>>,

    cancel: CancellationToken,
    tasks: TaskTracker,
    counters: Counters,
}

impl Connection {
    /// Wrap `transport`. Nothing is read or written until [`start`](Self::start).
    pub fn new(transport: Transport, config: ConnectionConfig) -> Arc<Self> {
        let Transport {
            sink,
            stream,
            local_addr,
            remote_addr,
            answers_pings,
        } = transport;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_size.max(1));
        Arc::new(Self {
            id: ConnectionId::new(),
            local_addr,
            remote_addr,
            connected_at: Utc::now(),
            config,
            answers_pings,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_error: Mutex::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            metadata: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(0),
            pong_hook: RwLock::new(None),
            close_hooks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            counters: Counters::default(),
        })
    }

    /// Spawn the read and write loops. Inbound data messages go to `handler`.
    pub fn start(self: &Arc<Self>, handler: Handler) -> Result<()> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        // The sink slot orders this against `shutdown`, which takes it before
        // reading `started`.
        let (rx, sink, stream) = {
            let mut sink_slot = self.sink.lock();
            if self.started.load(Ordering::Acquire) {
                return Err(WsError::AlreadyRunning("connection loops"));
            }
            let (Some(rx), Some(sink), Some(stream)) = (
                self.outbound_rx.lock().take(),
                sink_slot.take(),
                self.stream.lock().take(),
            ) else {
                // A concurrent close released the socket first.
                return Err(WsError::Closed);
            };
            self.started.store(true, Ordering::Release);
            counter!(WS_CONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
            (rx, sink, stream)
        };

        info!(conn_id = %self.id, remote_addr = %self.remote_addr, "connection opened");

        let _ = self.tasks.spawn(Arc::clone(self).write_loop(rx, sink));
        let _ = self.tasks.spawn(Arc::clone(self).read_loop(stream, handler));
        Ok(())
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Local address.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Remote address.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Tuning in effect.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.started.load(Ordering::Acquire) {
            ConnectionState::Open
        } else {
            ConnectionState::Idle
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            local_addr: self.local_addr.clone(),
            remote_addr: self.remote_addr.clone(),
            connected_at: self.connected_at,
            state: self.state(),
            stats: self.stats(),
            close_error: self.close_error().map(|e| e.to_string()),
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    fn check_outbound(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        if message.is_data() && message.len() > self.config.max_message_size {
            return Err(WsError::MessageTooLarge {
                size: message.len(),
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }

    /// Enqueue `message`, waiting for queue capacity.
    ///
    /// Returns [`WsError::Closed`] if the connection closes or `cancel` fires
    /// before the message is enqueued. Nothing is written in that case.
    pub async fn send(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.check_outbound(&message)?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(WsError::Closed),
            () = cancel.cancelled() => Err(WsError::Closed),
            sent = self.outbound_tx.send(message) => sent.map_err(|_| WsError::Closed),
        }
    }

    /// Enqueue `message` without waiting.
    ///
    /// Returns [`WsError::QueueFull`] immediately when the queue has no room.
    pub fn send_async(&self, message: Message) -> Result<()> {
        self.check_outbound(&message)?;
        match self.outbound_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                counter!(WS_SEND_QUEUE_FULL_TOTAL).increment(1);
                Err(WsError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(WsError::Closed),
        }
    }

    /// Enqueue `message`, giving up after `timeout`.
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        let never = CancellationToken::new();
        match tokio::time::timeout(timeout, self.send(message, &never)).await {
            Ok(result) => result,
            Err(_) => Err(WsError::SendTimeout(timeout)),
        }
    }

    /// Queue a liveness ping.
    pub fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        match self.outbound_tx.try_send(Message::ping(Bytes::new())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(WsError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(WsError::Closed),
        }
    }

    /// Install the callback run whenever a liveness reply arrives.
    pub fn set_pong_handler(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.pong_hook.write() = Some(Arc::new(hook));
    }

    /// Remove the liveness reply callback.
    pub fn clear_pong_handler(&self) {
        *self.pong_hook.write() = None;
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Attach a value under `key`, replacing any previous one.
    pub fn set_meta(&self, key: impl Into<String>, value: serde_json::Value) {
        let _ = self.metadata.insert(key.into(), value);
    }

    /// Value attached under `key`.
    pub fn meta(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    /// Detach and return the value under `key`.
    pub fn remove_meta(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.remove(key).map(|(_, v)| v)
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// Receive a copy of every inbound data message, using the configured
    /// subscriber queue size.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_with_capacity(self.config.subscriber_queue_size)
    }

    /// Receive a copy of every inbound data message.
    ///
    /// Delivery is best-effort: when the queue is full the message is skipped
    /// for this subscriber. The queue ends when the connection closes.
    pub fn subscribe_with_capacity(self: &Arc<Self>, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if !self.is_closed() {
            let _ = self.subscribers.insert(id, tx);
            // Close may have cleared the map between the check and the insert.
            if self.is_closed() {
                let _ = self.subscribers.remove(&id);
            }
        }
        Subscription {
            id,
            rx,
            conn: Arc::downgrade(self),
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn fan_out(&self, message: &Message) {
        let mut gone = Vec::new();
        for entry in &self.subscribers {
            match entry.value().try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let _ = self.counters.subscriber_drops.fetch_add(1, Ordering::Relaxed);
                    counter!(WS_SUBSCRIBER_DROPS_TOTAL).increment(1);
                }
                Err(TrySendError::Closed(_)) => gone.push(*entry.key()),
            }
        }
        for id in gone {
            let _ = self.subscribers.remove(&id);
        }
    }

    // ── Closing ─────────────────────────────────────────────────────────

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The error that closed the connection, if any.
    pub fn close_error(&self) -> Option<WsError> {
        self.close_error.lock().clone()
    }

    /// Close cleanly. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown(None);
    }

    /// Close and record `err` as the reason. Only the first close records.
    pub fn close_with_error(&self, err: WsError) {
        record_error(&err);
        let _ = self.shutdown(Some(err));
    }

    /// Run `hook` once when the connection closes.
    ///
    /// Runs immediately (on the calling thread) if already closed.
    pub fn on_close(&self, hook: impl FnOnce(&Connection, Option<&WsError>) + Send + 'static) {
        {
            let mut hooks = self.close_hooks.lock();
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        let err = self.close_error();
        hook(self, err.as_ref());
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Run `fut` until it finishes or the connection closes.
    ///
    /// The task is tracked, so [`wait`](Self::wait) covers it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let _ = self.tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = fut => {}
            }
        });
    }

    /// Wait for every task of a closed connection to exit.
    ///
    /// Returns `false` if they were still running after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let _ = self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }

    fn shutdown(&self, err: Option<WsError>) -> bool {
        {
            let mut slot = self.close_error.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.clone_from(&err);
        }

        self.subscribers.clear();
        self.cancel.cancel();
        let _ = self.tasks.close();

        // Loops never started: release the socket here.
        let _ = self.stream.lock().take();
        let _ = self.outbound_rx.lock().take();
        let unstarted_sink = self.sink.lock().take();
        if let Some(mut sink) = unstarted_sink {
            let frame = close_frame(err.as_ref());
            let timeout = self.config.write_timeout;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let _ = handle.spawn(async move {
                    let _ = tokio::time::timeout(timeout, async {
                        let _ = sink.send(frame).await;
                        let _ = sink.close().await;
                    })
                    .await;
                });
            }
        }

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook(self, err.as_ref());
        }

        if self.started.load(Ordering::Acquire) {
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        match &err {
            Some(e) => info!(conn_id = %self.id, remote_addr = %self.remote_addr, error = %e, "connection closed"),
            None => info!(conn_id = %self.id, remote_addr = %self.remote_addr, "connection closed"),
        }
        true
    }

    // ── Loops ───────────────────────────────────────────────────────────

    async fn write_frame(&self, sink: &mut FrameSink, message: Message) -> Result<()> {
        let len = message.len() as u64;
        let timeout = self.config.write_timeout;
        match tokio::time::timeout(timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                let _ = self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                let _ = self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                counter!(WS_MESSAGES_SENT_TOTAL).increment(1);
                counter!(WS_BYTES_SENT_TOTAL).increment(len);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WsError::WriteTimeout(timeout)),
        }
    }

    #[instrument(skip_all, fields(conn_id = %self.id, remote_addr = %self.remote_addr))]
    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Message>, mut sink: FrameSink) {
        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(m) => m,
                    None => break,
                },
            };
            if let Err(err) = self.write_frame(&mut sink, message).await {
                warn!(error = %err, "write failed");
                self.close_with_error(err);
                return;
            }
        }

        // Flush what was queued before the close, then send the close frame.
        let timeout = self.config.write_timeout;
        let farewell = async {
            if self.close_error().is_none() {
                while let Ok(message) = rx.try_recv() {
                    if let Err(err) = self.write_frame(&mut sink, message).await {
                        debug!(error = %err, "flush failed, skipping close frame");
                        return;
                    }
                }
            }
            if sink.send(close_frame(self.close_error().as_ref())).await.is_ok() {
                let _ = sink.close().await;
            }
        };
        if tokio::time::timeout(timeout, farewell).await.is_err() {
            debug!("close handshake timed out");
        }
    }

    #[instrument(skip_all, fields(conn_id = %self.id, remote_addr = %self.remote_addr))]
    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, handler: Handler) {
        let reason = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                next = read_next(&mut stream, self.config.read_timeout) => next,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("stream ended");
                    break None;
                }
                Err(err) => break Some(err),
            };

            match message.kind() {
                MessageKind::Ping => {
                    if !self.answers_pings && self.config.auto_pong {
                        let _ = self
                            .outbound_tx
                            .try_send(Message::pong(message.into_payload()));
                    }
                }
                MessageKind::Pong => {
                    let hook = self.pong_hook.read().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
                MessageKind::Close => {
                    debug!(code = ?message.close_code(), "peer sent close frame");
                    break None;
                }
                MessageKind::Text | MessageKind::Binary => {
                    let len = message.len();
                    if len > self.config.max_message_size {
                        break Some(WsError::MessageTooLarge {
                            size: len,
                            limit: self.config.max_message_size,
                        });
                    }
                    let _ = self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                    let _ = self.counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                    counter!(WS_MESSAGES_RECEIVED_TOTAL).increment(1);
                    counter!(WS_BYTES_RECEIVED_TOTAL).increment(len as u64);

                    self.fan_out(&message);

                    let result = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        result = call_guarded(&handler, Arc::clone(&self), message) => result,
                    };
                    if let Err(err) = result {
                        counter!(WS_HANDLER_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
                        warn!(error = %err, kind = err.kind(), "handler error");
                    }
                }
            }
        };

        match reason {
            None => self.close(),
            Some(err) => {
                if !self.is_closed() {
                    warn!(error = %err, "read loop ended");
                }
                self.close_with_error(err);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn read_next(
    stream: &mut FrameStream,
    timeout: Option<Duration>,
) -> Result<Option<Message>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(item) => item.transpose(),
            Err(_) => Err(WsError::ReadTimeout(limit)),
        },
        None => stream.next().await.transpose(),
    }
}

fn close_frame(err: Option<&WsError>) -> Message {
    match err {
        None => Message::close(CLOSE_NORMAL, ""),
        Some(WsError::MessageTooLarge { .. }) => Message::close(CLOSE_TOO_LARGE, "message too large"),
        Some(WsError::PoolClosed) => Message::close(CLOSE_GOING_AWAY, "server shutting down"),
        Some(_) => Message::close(CLOSE_INTERNAL, "connection error"),
    }
}

/// A best-effort copy of a connection's inbound data messages.
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
    conn: Weak<Connection>,
}

impl Subscription {
    /// Next message; `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::transport::memory_pair;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            send_queue_size: 4,
            subscriber_queue_size: 4,
            max_message_size: 64,
            write_timeout: Duration::from_secs(1),
            read_timeout: None,
            auto_pong: true,
        }
    }

    /// Two started connections wired together; `b` forwards data into a channel.
    fn pair() -> (Arc<Connection>, Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (ta, tb) = memory_pair(16);
        let a = Connection::new(ta, config());
        let b = Connection::new(tb, config());
        let (tx, rx) = mpsc::unbounded_channel();
        a.start(Handler::noop()).unwrap();
        b.start(Handler::new(move |_, m| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
                Ok(())
            }
        }))
        .unwrap();
        (a, b, rx)
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes_and_order() {
        let (a, _b, mut rx) = pair();
        let never = CancellationToken::new();
        for i in 0..10 {
            a.send(Message::text(format!("msg-{i}")), &never).await.unwrap();
        }
        a.send(Message::binary(vec![0u8, 255, 7]), &never).await.unwrap();
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().as_text(), Some(format!("msg-{i}").as_str()));
        }
        assert_eq!(rx.recv().await.unwrap().payload().as_ref(), &[0u8, 255, 7]);
    }

    #[tokio::test]
    async fn send_async_reports_full_queue_without_blocking() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        // Not started: nothing drains the queue.
        for _ in 0..4 {
            conn.send_async(Message::text("x")).unwrap();
        }
        assert_matches!(conn.send_async(Message::text("x")), Err(WsError::QueueFull));
        assert_eq!(conn.stats().queue_full, 1);
    }

    #[tokio::test]
    async fn send_returns_closed_when_caller_cancels() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        for _ in 0..4 {
            conn.send_async(Message::text("x")).unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_matches!(
            conn.send(Message::text("y"), &cancel).await,
            Err(WsError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_on_full_queue() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        for _ in 0..4 {
            conn.send_async(Message::text("x")).unwrap();
        }
        let d = Duration::from_millis(50);
        assert_matches!(
            conn.send_timeout(Message::text("y"), d).await,
            Err(WsError::SendTimeout(t)) if t == d
        );
    }

    #[tokio::test]
    async fn oversize_send_rejected() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        assert_matches!(
            conn.send_async(Message::binary(vec![0u8; 65])),
            Err(WsError::MessageTooLarge { size: 65, limit: 64 })
        );
    }

    #[tokio::test]
    async fn close_runs_once_under_concurrency() {
        let (a, _b, _rx) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        a.on_close(move |_, _| {
            let _ = f.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for i in 0..16 {
            let a = Arc::clone(&a);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    a.close();
                } else {
                    a.close_with_error(WsError::Transport("boom".into()));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(a.is_closed());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_matches!(a.send_async(Message::text("x")), Err(WsError::Closed));
        assert!(a.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn on_close_after_close_runs_immediately_with_error() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        conn.close_with_error(WsError::WriteTimeout(Duration::from_secs(1)));
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        conn.on_close(move |_, err| *s.lock() = err.cloned());
        assert_matches!(*seen.lock(), Some(WsError::WriteTimeout(_)));
    }

    #[tokio::test]
    async fn peer_close_closes_cleanly() {
        let (a, b, _rx) = pair();
        a.close();
        tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .unwrap();
        assert!(b.close_error().is_none());
    }

    #[tokio::test]
    async fn oversize_inbound_closes_with_error() {
        let (ta, tb) = memory_pair(4);
        let mut big = config();
        big.max_message_size = 1024;
        let a = Connection::new(ta, big);
        let b = Connection::new(tb, config());
        a.start(Handler::noop()).unwrap();
        b.start(Handler::noop()).unwrap();
        a.send_async(Message::binary(vec![1u8; 100])).unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .unwrap();
        assert_matches!(
            b.close_error(),
            Some(WsError::MessageTooLarge { size: 100, limit: 64 })
        );
    }

    #[tokio::test]
    async fn handler_errors_and_panics_do_not_close() {
        let (ta, tb) = memory_pair(8);
        let a = Connection::new(ta, config());
        let b = Connection::new(tb, config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.start(Handler::noop()).unwrap();
        b.start(Handler::new(move |_, m: Message| {
            let tx = tx.clone();
            async move {
                match m.as_text() {
                    Some("panic") => panic!("handler blew up"),
                    Some("fail") => Err(HandlerError::other("bad input")),
                    _ => {
                        let _ = tx.send(m);
                        Ok(())
                    }
                }
            }
        }))
        .unwrap();

        let never = CancellationToken::new();
        a.send(Message::text("panic"), &never).await.unwrap();
        a.send(Message::text("fail"), &never).await.unwrap();
        a.send(Message::text("ok"), &never).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().as_text(), Some("ok"));
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn subscribers_receive_copies_and_slow_ones_are_skipped() {
        let (a, b, mut rx) = pair();
        let mut fast = b.subscribe_with_capacity(16);
        let slow = b.subscribe_with_capacity(1);
        let never = CancellationToken::new();
        for i in 0..3 {
            a.send(Message::text(format!("{i}")), &never).await.unwrap();
        }
        for _ in 0..3 {
            let _ = rx.recv().await.unwrap();
        }
        for i in 0..3 {
            assert_eq!(fast.recv().await.unwrap().as_text(), Some(format!("{i}").as_str()));
        }
        assert_eq!(b.stats().subscriber_drops, 2);
        assert_eq!(b.subscriber_count(), 2);
        drop(slow);
        assert_eq!(b.subscriber_count(), 1);

        b.close();
        assert!(fast.recv().await.is_none());
    }

    #[tokio::test]
    async fn auto_pong_fires_peer_hook() {
        let (a, b, _rx) = pair();
        let pongs = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pongs);
        a.set_pong_handler(move || {
            let _ = p.fetch_add(1, Ordering::SeqCst);
        });
        a.ping().unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while pongs.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        conn.set_meta("user", serde_json::json!("alice"));
        assert_eq!(conn.meta("user"), Some(serde_json::json!("alice")));
        assert_eq!(conn.remove_meta("user"), Some(serde_json::json!("alice")));
        assert!(conn.meta("user").is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (ta, _tb) = memory_pair(1);
        let conn = Connection::new(ta, config());
        conn.start(Handler::noop()).unwrap();
        assert_matches!(
            conn.start(Handler::noop()),
            Err(WsError::AlreadyRunning(_))
        );
        conn.close();
        assert_matches!(conn.start(Handler::noop()), Err(WsError::Closed));
    }

    #[tokio::test]
    async fn info_reports_state_and_stats() {
        let (a, _b, mut rx) = pair();
        a.send(Message::text("hey"), &CancellationToken::new())
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap();
        let info = a.info();
        assert_eq!(info.state, ConnectionState::Open);
        assert_eq!(info.stats.messages_sent, 1);
        assert_eq!(info.stats.bytes_sent, 3);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "open");
        assert!(json.get("closeError").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_closes_idle_connection() {
        let (ta, _tb) = memory_pair(1);
        let mut cfg = config();
        cfg.read_timeout = Some(Duration::from_millis(100));
        let conn = Connection::new(ta, cfg);
        conn.start(Handler::noop()).unwrap();
        conn.closed().await;
        assert_matches!(conn.close_error(), Some(WsError::ReadTimeout(_)));
    }

    #[tokio::test]
    async fn dead_peer_with_queued_frames_shuts_down_cleanly() {
        let (ta, tb) = memory_pair(4);
        drop(tb);
        let conn = Connection::new(ta, config());
        conn.send_async(Message::text("one")).unwrap();
        conn.send_async(Message::text("two")).unwrap();
        conn.start(Handler::noop()).unwrap();
        conn.close();
        assert!(conn.wait(Duration::from_secs(1)).await);
        assert!(conn.is_closed());
        assert_eq!(conn.stats().messages_sent, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_racing_close_keeps_started_consistent() {
        for _ in 0..200 {
            let (ta, _tb) = memory_pair(4);
            let conn = Connection::new(ta, config());
            let closer = Arc::clone(&conn);
            let close = tokio::spawn(async move { closer.close() });
            let started = conn.start(Handler::noop());
            close.await.unwrap();
            assert_eq!(conn.started.load(Ordering::Acquire), started.is_ok());
            assert!(conn.wait(Duration::from_secs(1)).await);
        }
    }
}
