//! Outbound endpoint that survives socket loss.
//!
//! A [`Client`] owns at most one live [`Connection`] at a time and replaces it
//! across reconnects. State changes go through [`ClientState::can_transition_to`]
//! under a single lock, so concurrent callers cannot both claim a transition.
//!
//! When the live connection ends (socket error, peer close, heartbeat timeout)
//! the client moves to `Reconnecting` and runs the [`Reconnector`] if automatic
//! reconnection is enabled, or to `Disconnected` otherwise.

mod dialer;
mod state;
pub mod tls;

pub use dialer::{Dialer, TungsteniteDialer};
pub use state::ClientState;

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tether_core::{ClientId, ConnectionId};
use tether_settings::ClientSettings;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::errors::{Result, WsError};
use crate::handler::Handler;
use crate::heartbeat::{HeartbeatConfig, HeartbeatManager};
use crate::message::Message;
use crate::metrics::WS_SUBSCRIBER_DROPS_TOTAL;
use crate::middleware::MiddlewareChain;
use crate::reconnect::{ReconnectConfig, ReconnectEvent, ReconnectOutcome, Reconnector};
use crate::transport::Transport;

type ConnectCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(Option<&WsError>) + Send + Sync>;
type AttemptCallback = Box<dyn Fn(u32, Duration) + Send + Sync>;
type ReconnectedCallback = Box<dyn Fn(u32) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&WsError) + Send + Sync>;
type StateCallback = Box<dyn Fn(ClientState, ClientState) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_reconnect_attempt: Option<AttemptCallback>,
    on_reconnect: Option<ReconnectedCallback>,
    on_reconnect_failed: Option<ErrorCallback>,
    on_state_change: Option<StateCallback>,
    on_heartbeat_timeout: Option<ErrorCallback>,
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    settings: ClientSettings,
    dialer: Option<Arc<dyn Dialer>>,
    handler: Option<Handler>,
    middleware: MiddlewareChain,
    callbacks: Callbacks,
}

impl ClientBuilder {
    /// Start from `settings`.
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            dialer: None,
            handler: None,
            middleware: MiddlewareChain::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the default tokio-tungstenite dialer.
    #[must_use]
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Handle inbound data messages in addition to queueing them for
    /// [`Client::recv`].
    #[must_use]
    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Middleware wrapped around the handler.
    #[must_use]
    pub fn middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self
    }

    /// Called after every successful connect or reconnect.
    #[must_use]
    pub fn on_connect(mut self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Box::new(f));
        self
    }

    /// Called when a live connection ends, with its close error.
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn(Option<&WsError>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Box::new(f));
        self
    }

    /// Called before each reconnect attempt with its number and delay.
    #[must_use]
    pub fn on_reconnect_attempt(mut self, f: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.callbacks.on_reconnect_attempt = Some(Box::new(f));
        self
    }

    /// Called when a reconnect succeeds, with the attempts it took.
    #[must_use]
    pub fn on_reconnect(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.callbacks.on_reconnect = Some(Box::new(f));
        self
    }

    /// Called once when a reconnect episode exhausts its budget.
    #[must_use]
    pub fn on_reconnect_failed(mut self, f: impl Fn(&WsError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_reconnect_failed = Some(Box::new(f));
        self
    }

    /// Called on every state transition with `(old, new)`.
    #[must_use]
    pub fn on_state_change(
        mut self,
        f: impl Fn(ClientState, ClientState) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_state_change = Some(Box::new(f));
        self
    }

    /// Called when the heartbeat declares the live connection dead.
    #[must_use]
    pub fn on_heartbeat_timeout(mut self, f: impl Fn(&WsError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_heartbeat_timeout = Some(Box::new(f));
        self
    }

    /// Validate settings and build the client in `Disconnected` state.
    pub fn build(self) -> Result<Client> {
        self.settings.validate()?;
        let Self {
            settings,
            dialer,
            handler,
            middleware,
            callbacks,
        } = self;
        let (inbox_tx, inbox_rx) = mpsc::channel(settings.receive_queue_size.max(1));
        let handler = middleware.then(inbox_then(inbox_tx.clone(), handler));
        let reconnector = Reconnector::new(ReconnectConfig::from_settings(&settings.reconnect));
        let inner = ClientInner {
            id: ClientId::new(),
            dialer: dialer.unwrap_or_else(|| Arc::new(TungsteniteDialer::new())),
            handler,
            state: Mutex::new(ClientState::Disconnected),
            conn: RwLock::new(None),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            callbacks,
            reconnector,
            heartbeat: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            settings,
        };
        info!(client_id = %inner.id, url = %inner.settings.url, "client created");
        Ok(Client {
            inner: Arc::new(inner),
        })
    }
}

/// Innermost handler: queue for pull consumers, then run the user handler.
fn inbox_then(inbox: mpsc::Sender<Message>, user: Option<Handler>) -> Handler {
    Handler::new(move |conn, message: Message| {
        if let Err(TrySendError::Full(_)) = inbox.try_send(message.clone()) {
            counter!(WS_SUBSCRIBER_DROPS_TOTAL).increment(1);
            debug!(conn_id = %conn.id(), "receive queue full, message dropped");
        }
        let user = user.clone();
        async move {
            match user {
                Some(handler) => handler.call(conn, message).await,
                None => Ok(()),
            }
        }
    })
}

struct ClientInner {
    id: ClientId,
    settings: ClientSettings,
    dialer: Arc<dyn Dialer>,
    /// Middleware wrapped around the inbox push and the user handler.
    handler: Handler,
    state: Mutex<ClientState>,
    conn: RwLock<Option<Arc<Connection>>>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    callbacks: Callbacks,
    reconnector: Reconnector,
    heartbeat: Mutex<Option<Arc<HeartbeatManager>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Move to `next` if legal (and, when given, only from `from`).
    /// Returns the previous state on success.
    fn transition(&self, from: Option<ClientState>, next: ClientState) -> Option<ClientState> {
        let prev = {
            let mut state = self.state.lock();
            let prev = *state;
            if from.is_some_and(|f| f != prev) || !prev.can_transition_to(next) {
                return None;
            }
            *state = next;
            prev
        };
        debug!(client_id = %self.id, from = %prev, to = %next, "client state changed");
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(prev, next);
        }
        Some(prev)
    }

    fn set_state(&self, next: ClientState) -> Option<ClientState> {
        self.transition(None, next)
    }

    fn live(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.conn.read().clone() {
            return Ok(conn);
        }
        Err(match self.state() {
            ClientState::Closed => WsError::Closed,
            _ => WsError::NotConnected,
        })
    }

    /// Adopt a freshly dialed socket as the live connection.
    fn install(self: &Arc<Self>, transport: Transport) -> Result<Arc<Connection>> {
        let conn = Connection::new(transport, ConnectionConfig::from_client(&self.settings));
        *self.conn.write() = Some(Arc::clone(&conn));
        if self.set_state(ClientState::Connected).is_none() {
            // Closed while dialing.
            let _ = self.clear_slot(conn.id());
            conn.close();
            return Err(WsError::Closed);
        }

        let weak = Arc::downgrade(self);
        conn.on_close(move |c, err| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_disconnect(c.id(), err.cloned());
            }
        });
        conn.start(self.handler.clone())?;
        if self.settings.heartbeat.enable {
            self.start_heartbeat(&conn);
        }

        info!(client_id = %self.id, conn_id = %conn.id(), remote_addr = %conn.remote_addr(), "client connected");
        if let Some(cb) = &self.callbacks.on_connect {
            cb(&conn);
        }
        Ok(conn)
    }

    fn clear_slot(&self, id: &ConnectionId) -> bool {
        let mut slot = self.conn.write();
        if slot.as_ref().is_some_and(|c| c.id() == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn start_heartbeat(self: &Arc<Self>, conn: &Arc<Connection>) {
        let hb = Arc::new(HeartbeatManager::new(HeartbeatConfig::from_settings(
            &self.settings.heartbeat,
        )));
        let weak_inner = Arc::downgrade(self);
        let weak_conn = Arc::downgrade(conn);
        hb.on_timeout(move |err| {
            if let Some(inner) = weak_inner.upgrade() {
                if let Some(cb) = &inner.callbacks.on_heartbeat_timeout {
                    cb(&err);
                }
            }
            if let Some(conn) = weak_conn.upgrade() {
                conn.close_with_error(err);
            }
        });
        if let Some(previous) = self.heartbeat.lock().replace(Arc::clone(&hb)) {
            previous.stop();
        }
        let conn = Arc::clone(conn);
        let _ = self.tasks.spawn(async move {
            if let Err(err) = hb.run(&conn).await {
                debug!(error = %err, "heartbeat not started");
            }
        });
    }

    /// Close hook of every installed connection.
    fn handle_disconnect(self: &Arc<Self>, conn_id: &ConnectionId, err: Option<WsError>) {
        if !self.clear_slot(conn_id) {
            return;
        }
        if let Some(hb) = self.heartbeat.lock().take() {
            hb.stop();
        }
        match &err {
            Some(e) => warn!(client_id = %self.id, %conn_id, error = %e, "client disconnected"),
            None => info!(client_id = %self.id, %conn_id, "client disconnected"),
        }
        if let Some(cb) = &self.callbacks.on_disconnect {
            cb(err.as_ref());
        }
        if self.cancel.is_cancelled() {
            return;
        }

        if self.settings.reconnect.enable {
            if self.set_state(ClientState::Reconnecting).is_some() {
                let inner = Arc::clone(self);
                let _ = self.tasks.spawn(async move {
                    let _ = inner.run_reconnect().await;
                });
            }
        } else {
            let _ = self.set_state(ClientState::Disconnected);
        }
    }

    /// Retry loop; the caller has already moved the state to `Reconnecting`.
    async fn run_reconnect(self: Arc<Self>) -> Result<()> {
        let inner: &ClientInner = &self;
        let outcome = inner
            .reconnector
            .run(
                &inner.cancel,
                move |_| inner.dialer.dial(&inner.settings),
                |event| {
                    if let ReconnectEvent::Waiting { attempt, delay } = event {
                        if let Some(cb) = &inner.callbacks.on_reconnect_attempt {
                            cb(attempt, delay);
                        }
                    }
                },
            )
            .await;

        match outcome {
            ReconnectOutcome::Connected { value, attempts } => {
                let _conn = self.install(value)?;
                if let Some(cb) = &self.callbacks.on_reconnect {
                    cb(attempts);
                }
                Ok(())
            }
            ReconnectOutcome::Exhausted(err) => {
                let _ = self.set_state(ClientState::Disconnected);
                if let Some(cb) = &self.callbacks.on_reconnect_failed {
                    cb(&err);
                }
                Err(err)
            }
            ReconnectOutcome::Cancelled => Err(WsError::Closed),
        }
    }
}

/// A reconnecting WebSocket client.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with default dialer, no handler, and no callbacks.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        ClientBuilder::new(settings).build()
    }

    /// Start configuring a client.
    pub fn builder(settings: ClientSettings) -> ClientBuilder {
        ClientBuilder::new(settings)
    }

    /// Client ID.
    pub fn id(&self) -> &ClientId {
        &self.inner.id
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.conn.read().clone()
    }

    /// Dial once. `Disconnected → Connecting → Connected`, or back to
    /// `Disconnected` on failure; retrying is up to the caller.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .transition(Some(ClientState::Disconnected), ClientState::Connecting)
            .is_none()
        {
            return Err(match inner.state() {
                ClientState::Closed => WsError::Closed,
                _ => WsError::AlreadyConnected,
            });
        }

        let dialed = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => Err(WsError::Closed),
            result = inner.dialer.dial(&inner.settings) => result,
        };
        match dialed {
            Ok(transport) => inner.install(transport).map(|_| ()),
            Err(err) => {
                warn!(client_id = %inner.id, url = %inner.settings.url, error = %err, "connect failed");
                let _ = inner.set_state(ClientState::Disconnected);
                Err(err)
            }
        }
    }

    /// Run the reconnect loop from `Disconnected` now, regardless of the
    /// automatic-reconnect setting.
    pub async fn reconnect(&self) -> Result<()> {
        if self
            .inner
            .transition(Some(ClientState::Disconnected), ClientState::Reconnecting)
            .is_none()
        {
            return Err(match self.inner.state() {
                ClientState::Closed => WsError::Closed,
                _ => WsError::AlreadyConnected,
            });
        }
        Arc::clone(&self.inner).run_reconnect().await
    }

    /// Enqueue on the live connection, waiting for queue capacity.
    pub async fn send(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.inner.live()?.send(message, cancel).await
    }

    /// Enqueue on the live connection without waiting.
    pub fn send_async(&self, message: Message) -> Result<()> {
        self.inner.live()?.send_async(message)
    }

    /// Enqueue on the live connection, giving up after `timeout`.
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        self.inner.live()?.send_timeout(message, timeout).await
    }

    /// Next queued inbound message. `None` once the client is closed and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<Message> {
        let mut rx = self.inner.inbox_rx.lock().await;
        tokio::select! {
            biased;
            message = rx.recv() => message,
            () = self.inner.cancel.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Next queued inbound message, without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.inner.inbox_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Close the client and its connection; stop heartbeat and reconnect.
    /// Terminal and idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.set_state(ClientState::Closed).is_none() {
            return;
        }
        inner.cancel.cancel();
        inner.reconnector.stop();
        if let Some(hb) = inner.heartbeat.lock().take() {
            hb.stop();
        }

        let grace = inner.settings.write_timeout();
        let conn = inner.conn.write().take();
        if let Some(conn) = conn {
            conn.close();
            if !conn.wait(grace).await {
                debug!(conn_id = %conn.id(), "connection tasks outlived close");
            }
            if let Some(cb) = &inner.callbacks.on_disconnect {
                cb(None);
            }
        }

        let _ = inner.tasks.close();
        if tokio::time::timeout(grace, inner.tasks.wait()).await.is_err() {
            warn!(client_id = %inner.id, "client tasks still running after close");
        }
        info!(client_id = %inner.id, "client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.inner.set_state(ClientState::Closed).is_some() {
            self.inner.cancel.cancel();
            self.inner.reconnector.stop();
            if let Some(hb) = self.inner.heartbeat.lock().take() {
                hb.stop();
            }
            let conn = self.inner.conn.write().take();
            if let Some(conn) = conn {
                conn.close();
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("url", &self.inner.settings.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
