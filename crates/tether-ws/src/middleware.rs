//! Ordered handler wrappers.
//!
//! A [`Middleware`] turns a [`Handler`] into another [`Handler`]. A
//! [`MiddlewareChain`] applies its layers so the first one declared is the
//! outermost: it sees the raw message first and the final outcome last.
//! Panic recovery is always applied innermost, directly around the base
//! handler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tether_core::ConnectionId;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::errors::HandlerError;
use crate::handler::{Handler, call_guarded};
use crate::message::Message;

type Layer = dyn Fn(Handler) -> Handler + Send + Sync;

/// A transformation from handler to handler.
#[derive(Clone)]
pub struct Middleware(Arc<Layer>);

impl Middleware {
    /// Build a middleware from a wrapping function.
    pub fn new(f: impl Fn(Handler) -> Handler + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Wrap `next`.
    pub fn wrap(&self, next: Handler) -> Handler {
        (self.0)(next)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Middleware")
    }
}

/// Ordered list of middleware.
#[derive(Clone, Debug, Default)]
pub struct MiddlewareChain {
    layers: Vec<Middleware>,
}

impl MiddlewareChain {
    /// An empty chain (recovery only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer; builder style.
    #[must_use]
    pub fn with(mut self, layer: Middleware) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append a layer.
    pub fn push(&mut self, layer: Middleware) {
        self.layers.push(layer);
    }

    /// Number of declared layers (recovery not counted).
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layers were declared.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Compose the chain around `base`.
    pub fn then(&self, base: Handler) -> Handler {
        let mut handler = recover().wrap(base);
        for layer in self.layers.iter().rev() {
            handler = layer.wrap(handler);
        }
        handler
    }
}

/// Convert panics in the wrapped handler into [`HandlerError::Panicked`].
pub fn recover() -> Middleware {
    Middleware::new(|next| {
        Handler::new(move |conn, message| {
            let next = next.clone();
            async move { call_guarded(&next, conn, message).await }
        })
    })
}

/// Log each message and its outcome at debug level.
pub fn logging() -> Middleware {
    Middleware::new(|next| {
        Handler::new(move |conn: Arc<Connection>, message: Message| {
            let next = next.clone();
            async move {
                let started = Instant::now();
                let conn_id = conn.id().clone();
                let kind = message.kind();
                let len = message.len();
                let result = next.call(conn, message).await;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                match &result {
                    Ok(()) => debug!(%conn_id, ?kind, len, elapsed_ms, "message handled"),
                    Err(e) => debug!(%conn_id, ?kind, len, elapsed_ms, error = %e, "message failed"),
                }
                result
            }
        })
    })
}

#[derive(Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Allow at most `max` messages per connection in each fixed `window`.
pub fn rate_limit(max: u32, window: Duration) -> Middleware {
    let windows: Arc<DashMap<ConnectionId, Window>> = Arc::new(DashMap::new());
    Middleware::new(move |next| {
        let windows = Arc::clone(&windows);
        Handler::new(move |conn: Arc<Connection>, message| {
            let next = next.clone();
            let windows = Arc::clone(&windows);
            async move {
                let now = Instant::now();
                let allowed = {
                    let mut fresh = false;
                    let mut entry = windows.entry(conn.id().clone()).or_insert_with(|| {
                        fresh = true;
                        Window {
                            started: now,
                            count: 0,
                        }
                    });
                    if now.duration_since(entry.started) >= window {
                        entry.started = now;
                        entry.count = 0;
                    }
                    entry.count += 1;
                    let allowed = entry.count <= max;
                    drop(entry);
                    if fresh {
                        let cleanup = Arc::clone(&windows);
                        conn.on_close(move |c, _| {
                            let _ = cleanup.remove(c.id());
                        });
                    }
                    allowed
                };
                if !allowed {
                    warn!(conn_id = %conn.id(), limit = max, "rate limit exceeded");
                    return Err(HandlerError::RateLimited { limit: max, window });
                }
                next.call(conn, message).await
            }
        })
    })
}

/// Reject messages for which `authorize` returns `false`.
pub fn auth<F>(authorize: F) -> Middleware
where
    F: Fn(&Connection, &Message) -> bool + Send + Sync + 'static,
{
    let authorize = Arc::new(authorize);
    Middleware::new(move |next| {
        let authorize = Arc::clone(&authorize);
        Handler::new(move |conn: Arc<Connection>, message: Message| {
            let next = next.clone();
            let permitted = (*authorize)(conn.as_ref(), &message);
            async move {
                if !permitted {
                    return Err(HandlerError::Unauthorized);
                }
                next.call(conn, message).await
            }
        })
    })
}

/// Reject messages larger than `limit` bytes.
pub fn max_message_size(limit: usize) -> Middleware {
    Middleware::new(move |next| {
        Handler::new(move |conn, message: Message| {
            let next = next.clone();
            async move {
                if message.len() > limit {
                    return Err(HandlerError::TooLarge {
                        size: message.len(),
                        limit,
                    });
                }
                next.call(conn, message).await
            }
        })
    })
}

/// Fail with [`HandlerError::Timeout`] if the rest of the chain takes longer
/// than `limit`.
pub fn timeout(limit: Duration) -> Middleware {
    Middleware::new(move |next| {
        Handler::new(move |conn, message| {
            let next = next.clone();
            async move {
                match tokio::time::timeout(limit, next.call(conn, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Timeout(limit)),
                }
            }
        })
    })
}
