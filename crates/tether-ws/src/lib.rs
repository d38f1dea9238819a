//! # tether-ws
//!
//! `WebSocket` connection lifecycle and resilience.
//!
//! - [`Connection`]: one socket with a read loop, a bounded write queue,
//!   pong tracking, subscriber fan-out, and an idempotent close
//! - [`ConnectionPool`]: admission control (global and per-address caps)
//!   with reservations that are released on drop
//! - [`Server`]: axum upgrade endpoint wiring the pool, origin check,
//!   server-initiated pings, and graceful shutdown
//! - [`Client`]: state machine over a single connection with heartbeat
//!   supervision and automatic reconnect through [`Reconnector`]
//! - [`MiddlewareChain`]: composable [`Handler`] wrappers (recover, logging,
//!   rate limit, auth, size limit, timeout)
//!
//! Everything logs through `tracing` and counts through `metrics`; the
//! binary decides where either goes.

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod errors;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod reconnect;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use client::{Client, ClientBuilder, ClientState, Dialer, TungsteniteDialer};
pub use connection::{Connection, ConnectionConfig, ConnectionInfo, ConnectionState, Subscription};
pub use errors::{ErrorCategory, HandlerError, Result, WsError};
pub use handler::Handler;
pub use heartbeat::{HeartbeatConfig, HeartbeatManager, HeartbeatResult};
pub use message::{Message, MessageKind};
pub use middleware::{Middleware, MiddlewareChain};
pub use pool::{Admission, BroadcastReport, ConnectionPool, PoolLimits, PoolStats};
pub use reconnect::{ReconnectConfig, ReconnectOutcome, Reconnector};
pub use server::{Server, ServerBuilder, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use transport::{Transport, memory_pair};
