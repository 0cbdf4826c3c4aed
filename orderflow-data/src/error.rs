use crate::connection::state::{ConnectionEvent, ConnectionState};
use thiserror::Error;

/// All errors generated in `orderflow-data`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("SocketError: {0}")]
    Socket(String),

    #[error("WebSocket read timeout: no data received for {secs} seconds")]
    ReadTimeout { secs: u64 },

    #[error("failed to deserialise server message: {error}, payload: {payload}")]
    Deserialise { error: String, payload: String },

    #[error("unrecognised server message type: {0}")]
    UnknownMessage(String),

    #[error("authentication rejected by server: {0}")]
    AuthRejected(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid tick (price: {price}, volume: {volume}): {reason}")]
    InvalidTick {
        price: f64,
        volume: f64,
        reason: &'static str,
    },

    #[error("illegal connection transition from {from} on {event}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },

    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("connection manager task has stopped")]
    ManagerStopped,

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: &'static str, value: String },
}

impl DataError {
    /// Determine if an error ends the current socket session and requires a reconnect.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::ReadTimeout { .. } | DataError::AuthRejected(_) => true,
            DataError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connectionclosed")
                    || error_lower.contains("alreadyclosed")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io(")
                    || error_lower.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(format!("{value:?}"))
    }
}
