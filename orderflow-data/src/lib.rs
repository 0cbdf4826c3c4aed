#![forbid(unsafe_code)]
#![warn(unused, rust_2018_idioms, missing_debug_implementations)]

//! # Orderflow-Data
//! Real-time tick ingestion and order-flow aggregation over a single multiplexed WebSocket feed.
//!
//! * [`ConnectionManager`] owns the socket: authentication, heartbeats, reference counted
//!   subscriptions, capped exponential reconnects and synthetic ticks for quote-only feeds.
//! * [`TickStore`] buffers a bounded window of ticks per [`SymbolKey`] and notifies listeners.
//! * [`footprint`], [`cvd`], [`power_trade`] and [`open_interest`] derive footprint bars,
//!   delta/CVD, power trades and OI sense from those ticks.
//! * [`OrderflowEngine`] wires the above together, one [`InstrumentFlow`] per watched key.
//!
//! ## Example
//! ```rust,no_run
//! use orderflow_data::{
//!     EngineConfig, OrderflowEngine,
//!     connection::ConnectionManager,
//!     types::{SubscriptionMode, SymbolKey},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), orderflow_data::error::DataError> {
//!     let config = EngineConfig::from_env()?;
//!     let connection = ConnectionManager::new(config.connection()?);
//!     let engine = OrderflowEngine::new(connection, config);
//!
//!     let key = SymbolKey::new("SBIN", "NSE");
//!     engine.watch(key.clone(), SubscriptionMode::Tick)?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     println!("{:?}", engine.summary(&key));
//!
//!     engine.shutdown().await
//! }
//! ```

/// Tick-level helpers shared by the aggregators: VWAP, bar alignment and step rounding.
pub mod aggregation;

/// Environment-driven [`EngineConfig`].
pub mod config;

/// Shared WebSocket connection, subscription reference counting and reconnect policy.
pub mod connection;

/// Per-bar delta, cumulative volume delta and price/CVD divergence.
pub mod cvd;

/// [`OrderflowEngine`] service tying the store, connection and aggregators together.
pub mod engine;

/// All errors generated in `orderflow-data`.
pub mod error;

/// Price-level footprint bars with POC and diagonal imbalance.
pub mod footprint;

/// Open-interest sense classification.
pub mod open_interest;

/// Power-trade detection over a rolling receipt window.
pub mod power_trade;

/// Client and server WebSocket frames.
pub mod protocol;

/// Series contract shared by the chart-facing models.
pub mod series;

/// Bounded per-instrument tick buffer with listeners.
pub mod store;

/// Stream adapters used by the connection.
pub mod streams;

/// Core market data types: [`Tick`], [`Side`], [`SymbolKey`] and [`SubscriptionMode`].
pub mod types;

pub use config::EngineConfig;
pub use connection::{ConnectionConfig, ConnectionManager, StreamEvent, SubscriptionHandle};
pub use engine::{FlowEvent, FlowSummary, InstrumentFlow, OrderflowEngine};
pub use store::TickStore;
pub use types::{Side, SubscriptionMode, SymbolKey, Tick};
