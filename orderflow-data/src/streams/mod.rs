/// Read-timeout wrapper for the connection's inbound WebSocket stream.
pub mod timeout;
