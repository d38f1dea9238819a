//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: [`ConnectionId`], [`ClientId`] as newtypes for type safety
//! - **Backoff**: exponential delay growth with symmetric jitter ([`backoff`])
//! - **Logging**: `tracing` subscriber bootstrap ([`logging`])

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;
pub mod logging;

pub use backoff::{BackoffPolicy, InvalidBackoff};
pub use ids::{ClientId, ConnectionId};
