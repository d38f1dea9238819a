//! Client lifecycle states and the transitions allowed between them.

use std::fmt;

use serde::Serialize;

/// Where a [`Client`](super::Client) is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// No socket and no retry in progress.
    Disconnected,
    /// First dial in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Automatic or explicit retry loop running.
    Reconnecting,
    /// Closed by the owner; terminal.
    Closed,
}

impl ClientState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Closed` is reachable from everywhere and leads nowhere.
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::{Closed, Connected, Connecting, Disconnected, Reconnecting};
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting | Reconnecting)
            | (Connecting, Connected | Disconnected)
            | (Connected, Reconnecting | Disconnected)
            | (Reconnecting, Connected | Disconnected) => true,
            _ => false,
        }
    }

    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
