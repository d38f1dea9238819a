//! The handler contract: a function from `(connection, message)` to a result.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::connection::Connection;
use crate::errors::HandlerError;
use crate::message::Message;

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type HandlerFn = dyn Fn(Arc<Connection>, Message) -> HandlerFuture + Send + Sync;

/// Processes one inbound data message.
///
/// Cheap to clone; clones share the same function.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    /// Wrap an async function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self(Arc::new(move |conn, message| Box::pin(f(conn, message))))
    }

    /// A handler that accepts and discards every message.
    pub fn noop() -> Self {
        Self::new(|_, _| async { Ok(()) })
    }

    /// Invoke the handler.
    pub fn call(&self, conn: Arc<Connection>, message: Message) -> HandlerFuture {
        (self.0)(conn, message)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// Invoke `handler`, turning a panic (while building or polling the future)
/// into [`HandlerError::Panicked`].
pub(crate) async fn call_guarded(
    handler: &Handler,
    conn: Arc<Connection>,
    message: Message,
) -> Result<(), HandlerError> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(conn, message))) {
        Ok(fut) => fut,
        Err(payload) => return Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
