//! Explicit connection lifecycle with guarded transitions.

use crate::error::DataError;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Lifecycle state of the shared streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Deserialize, Serialize)]
pub enum ConnectionState {
    #[default]
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    /// Socket open, waiting for the authentication acknowledgement
    #[display("authenticating")]
    Authenticating,
    /// Authenticated; subscribe frames may be written
    #[display("subscribed")]
    Subscribed,
    /// Graceful close in progress
    #[display("closing")]
    Closing,
}

/// Input driving a [`ConnectionState`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum ConnectionEvent {
    #[display("connect")]
    Connect,
    #[display("socket_opened")]
    SocketOpened,
    #[display("auth_accepted")]
    AuthAccepted,
    #[display("auth_rejected")]
    AuthRejected,
    #[display("close_requested")]
    CloseRequested,
    /// The socket closed or failed to open, cleanly or otherwise
    #[display("socket_closed")]
    SocketClosed,
}

impl ConnectionState {
    /// Apply `event`, returning the next state or [`DataError::InvalidTransition`].
    pub fn transition(self, event: ConnectionEvent) -> Result<ConnectionState, DataError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        let next = match (self, event) {
            (Disconnected, Connect) => Connecting,
            (Connecting, SocketOpened) => Authenticating,
            (Authenticating, AuthAccepted) => Subscribed,
            (Authenticating, AuthRejected) => Disconnected,
            (Connecting | Authenticating | Subscribed, CloseRequested) => Closing,
            (Connecting | Authenticating | Subscribed | Closing, SocketClosed) => Disconnected,
            (from, event) => return Err(DataError::InvalidTransition { from, event }),
        };

        Ok(next)
    }

    /// Subscribe and unsubscribe frames may only be written once authenticated.
    pub fn can_subscribe(&self) -> bool {
        matches!(self, ConnectionState::Subscribed)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Subscribed | ConnectionState::Closing
        )
    }
}
