//! Server-side admission control and registry of live connections.
//!
//! A slot is taken with [`ConnectionPool::reserve`] before the upgrade
//! handshake and converted into a registration once the socket exists. Both
//! limits are checked and the slot taken under one lock, so concurrent
//! admissions can never overshoot either cap.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::ConnectionId;
use tether_settings::PoolSettings;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::errors::{Result, WsError};
use crate::message::Message;
use crate::metrics::{WS_ADMISSION_REJECTED_TOTAL, record_error};

/// Global and per-source caps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolLimits {
    /// Connections admitted at once.
    pub max_connections: usize,
    /// Connections admitted at once from one source address.
    pub max_per_address: usize,
}

impl From<&PoolSettings> for PoolLimits {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            max_per_address: settings.max_per_address,
        }
    }
}

/// Pool counters snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Registered connections.
    pub active_connections: usize,
    /// Slots held by upgrades still in progress.
    pub reserved: usize,
    /// Configured caps.
    pub limits: PoolLimits,
    /// Slots in use per source address (registered and reserved).
    pub per_address: BTreeMap<String, usize>,
    /// Admissions granted since creation.
    pub total_admitted: u64,
    /// Admissions refused since creation.
    pub total_rejected: u64,
    /// Whether the pool refuses new admissions.
    pub closed: bool,
}

/// Outcome of a fan-out send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections that accepted the message.
    pub delivered: usize,
    /// Connections whose queue was full or that were closing.
    pub dropped: usize,
}

struct PoolEntry {
    conn: Arc<Connection>,
    address: String,
}

#[derive(Default)]
struct PoolInner {
    connections: HashMap<ConnectionId, PoolEntry>,
    per_address: HashMap<String, usize>,
    reserved: usize,
    closed: bool,
}

impl PoolInner {
    fn release_address(&mut self, address: &str) {
        if let Some(count) = self.per_address.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                let _ = self.per_address.remove(address);
            }
        }
    }
}

/// Registry of live server connections with admission limits.
pub struct ConnectionPool {
    limits: PoolLimits,
    inner: Mutex<PoolInner>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl ConnectionPool {
    /// Empty pool with the given caps.
    pub fn new(limits: PoolLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            inner: Mutex::new(PoolInner::default()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Configured caps.
    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Take a slot for a connection from `remote_addr`.
    ///
    /// The slot is held until the returned [`Admission`] is registered or
    /// dropped.
    pub fn reserve(self: &Arc<Self>, remote_addr: &str) -> Result<Admission> {
        let address = address_key(remote_addr);
        let refused = {
            let mut inner = self.inner.lock();
            let in_use = inner.connections.len() + inner.reserved;
            let from_address = inner.per_address.get(&address).copied().unwrap_or(0);
            if inner.closed {
                Some(WsError::PoolClosed)
            } else if in_use >= self.limits.max_connections {
                Some(WsError::PoolFull {
                    max: self.limits.max_connections,
                })
            } else if from_address >= self.limits.max_per_address {
                Some(WsError::PerAddressLimit {
                    address: address.clone(),
                    max: self.limits.max_per_address,
                })
            } else {
                inner.reserved += 1;
                *inner.per_address.entry(address.clone()).or_insert(0) += 1;
                None
            }
        };

        if let Some(err) = refused {
            let _ = self.rejected.fetch_add(1, Ordering::Relaxed);
            let reason = match &err {
                WsError::PoolFull { .. } => "pool_full",
                WsError::PerAddressLimit { .. } => "per_address",
                _ => "closed",
            };
            counter!(WS_ADMISSION_REJECTED_TOTAL, "reason" => reason).increment(1);
            record_error(&err);
            warn!(%address, reason, "admission rejected");
            return Err(err);
        }

        let _ = self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Admission {
            pool: Arc::clone(self),
            address,
            pending: true,
        })
    }

    /// Admit and register `conn` in one step.
    pub fn add(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        self.reserve(conn.remote_addr())?.register(conn)
    }

    /// Unregister `id`. Returns `false` if it was not registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.remove(id) else {
            return false;
        };
        inner.release_address(&entry.address);
        debug!(conn_id = %id, address = %entry.address, "connection removed from pool");
        true
    }

    /// A registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(id).map(|e| Arc::clone(&e.conn))
    }

    /// Every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .connections
            .values()
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Counters snapshot.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            active_connections: inner.connections.len(),
            reserved: inner.reserved,
            limits: self.limits,
            per_address: inner
                .per_address
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            total_admitted: self.admitted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            closed: inner.closed,
        }
    }

    /// Refuse new admissions and close every registered connection.
    ///
    /// Returns how many connections were closed.
    pub fn close(&self) -> usize {
        let snapshot: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.connections.values().map(|e| Arc::clone(&e.conn)).collect()
        };
        for conn in &snapshot {
            conn.close();
        }
        info!(closed = snapshot.len(), "connection pool closed");
        snapshot.len()
    }

    /// Send `message` to every registered connection without waiting.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        self.broadcast_filtered(message, None)
    }

    /// Send `message` to every registered connection except `skip`.
    pub fn broadcast_except(&self, skip: &ConnectionId, message: &Message) -> BroadcastReport {
        self.broadcast_filtered(message, Some(skip))
    }

    fn broadcast_filtered(&self, message: &Message, skip: Option<&ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.connections() {
            if skip.is_some_and(|id| id == conn.id()) {
                continue;
            }
            match conn.send_async(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(conn_id = %conn.id(), error = %err, "broadcast skipped connection");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limits", &self.limits)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// A reserved pool slot.
///
/// Dropping it without calling [`register`](Self::register) gives the slot
/// back.
#[must_use = "dropping an Admission releases the slot"]
pub struct Admission {
    pool: Arc<ConnectionPool>,
    address: String,
    pending: bool,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("address", &self.address)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Admission {
    /// Source address key the slot is counted under.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Turn the reservation into a registration of `conn`.
    ///
    /// The connection is unregistered automatically when it closes. If the
    /// pool closed in the meantime, `conn` is closed and
    /// [`WsError::PoolClosed`] returned.
    pub fn register(mut self, conn: &Arc<Connection>) -> Result<()> {
        self.pending = false;
        let pool = Arc::clone(&self.pool);
        let address = std::mem::take(&mut self.address);
        {
            let mut inner = pool.inner.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
            if inner.closed {
                inner.release_address(&address);
                drop(inner);
                conn.close();
                return Err(WsError::PoolClosed);
            }
            let _ = inner.connections.insert(
                conn.id().clone(),
                PoolEntry {
                    conn: Arc::clone(conn),
                    address: address.clone(),
                },
            );
        }
        debug!(conn_id = %conn.id(), %address, "connection registered in pool");

        let weak = Arc::downgrade(&pool);
        conn.on_close(move |c, _| {
            if let Some(pool) = weak.upgrade() {
                let _ = pool.remove(c.id());
            }
        });
        Ok(())
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.pending {
            let mut inner = self.pool.inner.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
            inner.release_address(&self.address);
        }
    }
}

/// Key a remote address by host, so every port from one peer shares a quota.
pub fn address_key(remote_addr: &str) -> String {
    remote_addr
        .parse::<SocketAddr>()
        .map_or_else(|_| remote_addr.to_string(), |addr| addr.ip().to_string())
}
