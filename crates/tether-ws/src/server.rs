//! Axum upgrade endpoint with admission control, origin check, per-connection
//! liveness, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Serialize;
use tether_core::ConnectionId;
use tether_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::errors::{Result, WsError};
use crate::handler::Handler;
use crate::heartbeat::{HeartbeatConfig, HeartbeatManager};
use crate::message::Message;
use crate::middleware::MiddlewareChain;
use crate::pool::{Admission, BroadcastReport, ConnectionPool, PoolLimits, PoolStats};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::Transport;

type OriginCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Configures and builds a [`Server`].
pub struct ServerBuilder {
    settings: ServerSettings,
    handler: Option<Handler>,
    middleware: MiddlewareChain,
    origin_check: Option<OriginCheck>,
}

impl ServerBuilder {
    /// Start from `settings`.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            handler: None,
            middleware: MiddlewareChain::new(),
            origin_check: None,
        }
    }

    /// Handler for inbound data messages on every connection.
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

    /// Replace the `allowed_origins` check. Requests without an `Origin`
    /// header are not checked.
    #[must_use]
    pub fn with_origin_check(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.origin_check = Some(Box::new(check));
        self
    }

    /// Validate settings and build the server.
    pub fn build(self) -> Result<Server> {
        self.settings.validate()?;
        let Self {
            settings,
            handler,
            middleware,
            origin_check,
        } = self;
        if settings.enable_compression {
            warn!(
                level = settings.compression_level,
                "permessage-deflate requested but not supported; connections are uncompressed"
            );
        }
        let origin_check = origin_check.or_else(|| allowed_origins_check(&settings.allowed_origins));
        let handler = middleware.then(handler.unwrap_or_else(Handler::noop));
        let pool = ConnectionPool::new(PoolLimits::from(&settings.pool));
        Ok(Server {
            inner: Arc::new(ServerInner {
                settings,
                pool,
                handler,
                origin_check,
                shutdown: ShutdownCoordinator::new(),
                local_addr: OnceLock::new(),
                started: Instant::now(),
            }),
        })
    }
}

/// Exact-match check against a configured list; `None` when the list is empty.
fn allowed_origins_check(allowed: &[String]) -> Option<OriginCheck> {
    if allowed.is_empty() {
        return None;
    }
    let allowed = allowed.to_vec();
    Some(Box::new(move |origin: &str| {
        allowed.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(origin))
    }))
}

struct ServerInner {
    settings: ServerSettings,
    pool: Arc<ConnectionPool>,
    handler: Handler,
    origin_check: Option<OriginCheck>,
    shutdown: ShutdownCoordinator,
    local_addr: OnceLock<SocketAddr>,
    started: Instant,
}

impl ServerInner {
    fn local_addr(&self) -> String {
        self.local_addr
            .get()
            .map_or_else(|| self.settings.bind_addr(), ToString::to_string)
    }

    /// Drive one upgraded socket until it closes.
    async fn accept(self: Arc<Self>, socket: WebSocket, admission: Admission, remote: SocketAddr) {
        let transport = Transport::from_axum(socket, self.local_addr(), remote.to_string());
        let conn = Connection::new(transport, ConnectionConfig::from_server(&self.settings));
        if let Err(err) = admission.register(&conn) {
            debug!(conn_id = %conn.id(), error = %err, "upgraded socket not registered");
            return;
        }
        if let Err(err) = conn.start(self.handler.clone()) {
            debug!(conn_id = %conn.id(), error = %err, "connection did not start");
            return;
        }

        let heartbeat = HeartbeatManager::new(HeartbeatConfig::server(
            self.settings.ping_interval(),
            self.settings.pong_timeout(),
        ));
        let weak = Arc::downgrade(&conn);
        heartbeat.on_timeout(move |err| {
            if let Some(conn) = weak.upgrade() {
                conn.close_with_error(err);
            }
        });
        let pinged = Arc::clone(&conn);
        conn.spawn(async move {
            let _ = heartbeat.run(&pinged).await;
        });

        conn.closed().await;
        if !conn.wait(self.settings.write_timeout()).await {
            debug!(conn_id = %conn.id(), "connection tasks outlived close");
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server accepts connections.
    pub status: &'static str,
    /// Seconds since the server was built.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Upgrades in progress.
    pub reserved: usize,
}

/// Handle to a running listener.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    path: String,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the upgrade endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.path)
    }

    /// Wait for the accept loop to finish.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(error = %e, "server task failed");
        }
    }
}

/// WebSocket server.
///
/// Cheap to clone; clones share the pool and shutdown state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server with a handler and no middleware.
    pub fn new(settings: ServerSettings, handler: Handler) -> Result<Self> {
        ServerBuilder::new(settings).handler(handler).build()
    }

    /// Start configuring a server.
    pub fn builder(settings: ServerSettings) -> ServerBuilder {
        ServerBuilder::new(settings)
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// The admission pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Send `message` to every connection without waiting.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        self.inner.pool.broadcast(message)
    }

    /// Send `message` to every connection except `skip`.
    pub fn broadcast_except(&self, skip: &ConnectionId, message: &Message) -> BroadcastReport {
        self.inner.pool.broadcast_except(skip, message)
    }

    /// Router serving the upgrade path and `/health`.
    pub fn router(&self) -> Router {
        let settings = &self.inner.settings;
        Router::new()
            .route(&settings.path, get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TimeoutLayer::new(settings.handshake_timeout()))
            .with_state(Arc::clone(&self.inner))
    }

    /// Bind and serve in the background.
    pub async fn start(&self) -> Result<ServerHandle> {
        self.start_with(Router::new()).await
    }

    /// Bind and serve in the background, with `extra` routes merged in.
    pub async fn start_with(&self, extra: Router) -> Result<ServerHandle> {
        let bind = self.inner.settings.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| WsError::Transport(format!("bind {bind}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WsError::Transport(e.to_string()))?;
        let _ = self.inner.local_addr.set(local_addr);

        let app = self.router().merge(extra);
        let token = self.inner.shutdown.token();
        info!(%local_addr, path = %self.inner.settings.path, "websocket server listening");
        let join = self.inner.shutdown.tracker().spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let served = axum::serve(listener, service)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "accept loop ended with error");
            }
        });
        Ok(ServerHandle {
            local_addr,
            path: self.inner.settings.path.clone(),
            join,
        })
    }

    /// Stop accepting, close every connection, and wait for connection tasks
    /// up to the configured shutdown timeout.
    ///
    /// Returns `false` if tasks were still running at the deadline.
    pub async fn shutdown(&self) -> bool {
        info!("server shutting down");
        self.inner.shutdown.shutdown();
        let closed = self.inner.pool.close();
        let drained = self
            .inner
            .shutdown
            .graceful_shutdown(Some(self.inner.settings.shutdown_timeout()))
            .await;
        info!(closed, drained, "server stopped");
        drained
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind", &self.inner.settings.bind_addr())
            .field("path", &self.inner.settings.path)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// GET <path>: admission, then upgrade.
async fn ws_handler(
    State(server): State<Arc<ServerInner>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if server.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if !origin_allowed(server.origin_check.as_ref(), &headers) {
        warn!(%remote, origin = ?headers.get(header::ORIGIN), "origin rejected");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let admission = match server.pool.reserve(&remote.to_string()) {
        Ok(admission) => admission,
        Err(err) => return rejection(&err),
    };

    let settings = &server.settings;
    let tracker = server.shutdown.tracker().clone();
    let owner = Arc::clone(&server);
    ws.read_buffer_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_failed_upgrade(move |err| warn!(%remote, error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| tracker.track_future(owner.accept(socket, admission, remote)))
}

/// A missing `Origin` passes; one that is not visible ASCII never matches.
fn origin_allowed(check: Option<&OriginCheck>, headers: &HeaderMap) -> bool {
    let (Some(check), Some(origin)) = (check, headers.get(header::ORIGIN)) else {
        return true;
    };
    origin.to_str().is_ok_and(|origin| check(origin))
}

fn rejection(err: &WsError) -> Response {
    let (status, body) = match err {
        WsError::PerAddressLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "per-address limit"),
        WsError::PoolFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "pool full"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
    };
    (status, body).into_response()
}

/// GET /health
async fn health_handler(State(server): State<Arc<ServerInner>>) -> Json<HealthResponse> {
    let stats = server.pool.stats();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: server.started.elapsed().as_secs(),
        connections: stats.active_connections,
        reserved: stats.reserved,
    })
}
