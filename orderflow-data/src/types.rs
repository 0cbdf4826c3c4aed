//! Core data types shared by every part of the engine.
//!
//! A [`Tick`] is the normalised unit of ingestion: one executed trade (or a trade inferred
//! from a quote update) with its aggressor [`Side`].

use crate::error::DataError;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Trade aggressor side.
///
/// `Buy` means the taker lifted the ask, `Sell` means the taker hit the bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "Buy", alias = "BUY", alias = "b")]
    Buy,
    #[serde(alias = "Sell", alias = "SELL", alias = "s")]
    Sell,
}

impl Side {
    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Check if this is a buy
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Check if this is a sell
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry key for one instrument on one exchange, displayed as `symbol:exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Deserialize, Serialize)]
#[display("{symbol}:{exchange}")]
pub struct SymbolKey {
    pub symbol: SmolStr,
    pub exchange: SmolStr,
}

impl SymbolKey {
    pub fn new(symbol: impl AsRef<str>, exchange: impl AsRef<str>) -> Self {
        Self {
            symbol: SmolStr::new(symbol.as_ref().trim().to_uppercase()),
            exchange: SmolStr::new(exchange.as_ref().trim().to_uppercase()),
        }
    }
}

impl std::str::FromStr for SymbolKey {
    type Err = DataError;

    /// Parse `SYMBOL:EXCHANGE`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((symbol, exchange)) if !symbol.trim().is_empty() && !exchange.trim().is_empty() => {
                Ok(SymbolKey::new(symbol, exchange))
            }
            _ => Err(DataError::Config {
                key: "symbol",
                value: s.to_string(),
            }),
        }
    }
}

/// Update granularity requested for a subscription.
///
/// Only [`SubscriptionMode::Tick`] carries genuine trade ticks; the other modes are served
/// as quotes from which ticks are inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SubscriptionMode {
    Ltp = 1,
    Quote = 2,
    Depth = 3,
    #[default]
    Tick = 4,
}

impl SubscriptionMode {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for SubscriptionMode {
    type Error = DataError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SubscriptionMode::Ltp),
            2 => Ok(SubscriptionMode::Quote),
            3 => Ok(SubscriptionMode::Depth),
            4 => Ok(SubscriptionMode::Tick),
            other => Err(DataError::Config {
                key: "mode",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionMode::Ltp => "ltp",
            SubscriptionMode::Quote => "quote",
            SubscriptionMode::Depth => "depth",
            SubscriptionMode::Tick => "tick",
        };
        write!(f, "{name}")
    }
}

/// Normalised trade tick.
///
/// Construct through [`Tick::new`], which rejects values that would corrupt aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    /// Exchange time in milliseconds since the Unix epoch
    pub time: i64,
    /// Execution price
    pub price: f64,
    /// Executed quantity
    pub volume: f64,
    /// Aggressor side
    pub side: Side,
    /// Best bid at the time of the trade, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    /// Best ask at the time of the trade, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
}

impl Tick {
    pub fn new(time: i64, price: f64, volume: f64, side: Side) -> Result<Self, DataError> {
        Self::with_quote(time, price, volume, side, None, None)
    }

    pub fn with_quote(
        time: i64,
        price: f64,
        volume: f64,
        side: Side,
        bid: Option<f64>,
        ask: Option<f64>,
    ) -> Result<Self, DataError> {
        let tick = Self {
            time,
            price,
            volume,
            side,
            bid,
            ask,
        };
        tick.validate()
    }

    /// Re-check invariants, e.g. after deserialising a tick from the wire.
    pub fn validate(self) -> Result<Self, DataError> {
        let reason = if !self.price.is_finite() {
            Some("price must be finite")
        } else if self.price <= 0.0 {
            Some("price must be positive")
        } else if !self.volume.is_finite() {
            Some("volume must be finite")
        } else if self.volume < 0.0 {
            Some("volume must not be negative")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DataError::InvalidTick {
                price: self.price,
                volume: self.volume,
                reason,
            }),
            None => Ok(Self {
                bid: self.bid.filter(|bid| bid.is_finite() && *bid > 0.0),
                ask: self.ask.filter(|ask| ask.is_finite() && *ask > 0.0),
                ..self
            }),
        }
    }

    /// Mid price of the attached quote, if both sides are known.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Volume signed by aggressor side (positive = buy).
    pub fn signed_volume(&self) -> f64 {
        match self.side {
            Side::Buy => self.volume,
            Side::Sell => -self.volume,
        }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.volume
    }
}

/// Infer the aggressor side of a trade reported only through a quote update.
///
/// Trades at or above the bid/ask midpoint are buys. Without a two-sided quote the tick
/// rule applies against the previous traded price (an unchanged price keeps `Buy`).
pub fn infer_side(ltp: f64, bid: Option<f64>, ask: Option<f64>, previous_ltp: Option<f64>) -> Side {
    match (bid, ask) {
        (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => {
            if ltp >= (bid + ask) / 2.0 {
                Side::Buy
            } else {
                Side::Sell
            }
        }
        _ => match previous_ltp {
            Some(previous) if ltp < previous => Side::Sell,
            _ => Side::Buy,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!(Side::Sell.to_string(), "sell");
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_side_deserialise_aliases() {
        let sides: Vec<Side> = serde_json::from_str(r#"["buy","SELL","Buy","s"]"#).unwrap();
        assert_eq!(sides, vec![Side::Buy, Side::Sell, Side::Buy, Side::Sell]);
    }

    #[test]
    fn test_symbol_key_display_and_parse() {
        let key = SymbolKey::new("reliance", "nse");
        assert_eq!(key.to_string(), "RELIANCE:NSE");
        assert_eq!("reliance:nse".parse::<SymbolKey>().unwrap(), key);
        assert!("RELIANCE".parse::<SymbolKey>().is_err());
        assert!(":NSE".parse::<SymbolKey>().is_err());
    }

    #[test]
    fn test_subscription_mode_round_trip() {
        for mode in [
            SubscriptionMode::Ltp,
            SubscriptionMode::Quote,
            SubscriptionMode::Depth,
            SubscriptionMode::Tick,
        ] {
            assert_eq!(SubscriptionMode::try_from(mode.as_u8()).unwrap(), mode);
        }
        assert!(SubscriptionMode::try_from(9).is_err());
    }

    #[test]
    fn test_tick_validation() {
        struct TestCase {
            price: f64,
            volume: f64,
            valid: bool,
        }

        let tests = vec![
            // TC0: valid tick
            TestCase { price: 100.0, volume: 5.0, valid: true },
            // TC1: zero volume is allowed
            TestCase { price: 100.0, volume: 0.0, valid: true },
            // TC2: zero price rejected
            TestCase { price: 0.0, volume: 5.0, valid: false },
            // TC3: negative price rejected
            TestCase { price: -1.0, volume: 5.0, valid: false },
            // TC4: NaN price rejected
            TestCase { price: f64::NAN, volume: 5.0, valid: false },
            // TC5: infinite volume rejected
            TestCase { price: 100.0, volume: f64::INFINITY, valid: false },
            // TC6: negative volume rejected
            TestCase { price: 100.0, volume: -2.0, valid: false },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = Tick::new(0, test.price, test.volume, Side::Buy).is_ok();
            assert_eq!(actual, test.valid, "TC{} failed", index);
        }
    }

    #[test]
    fn test_tick_drops_invalid_quote_fields() {
        let tick = Tick::with_quote(1, 100.0, 1.0, Side::Buy, Some(-1.0), Some(100.5)).unwrap();
        assert_eq!(tick.bid, None);
        assert_eq!(tick.ask, Some(100.5));
        assert_eq!(tick.mid(), None);
    }

    #[test]
    fn test_infer_side() {
        struct TestCase {
            ltp: f64,
            bid: Option<f64>,
            ask: Option<f64>,
            previous: Option<f64>,
            expected: Side,
        }

        let tests = vec![
            // TC0: above mid is a buy
            TestCase { ltp: 100.4, bid: Some(100.0), ask: Some(100.5), previous: None, expected: Side::Buy },
            // TC1: exactly at mid is a buy
            TestCase { ltp: 100.25, bid: Some(100.0), ask: Some(100.5), previous: None, expected: Side::Buy },
            // TC2: below mid is a sell
            TestCase { ltp: 100.1, bid: Some(100.0), ask: Some(100.5), previous: None, expected: Side::Sell },
            // TC3: no quote, downtick is a sell
            TestCase { ltp: 99.0, bid: None, ask: None, previous: Some(100.0), expected: Side::Sell },
            // TC4: no quote, uptick is a buy
            TestCase { ltp: 101.0, bid: Some(100.0), ask: None, previous: Some(100.0), expected: Side::Buy },
            // TC5: no quote and no history defaults to buy
            TestCase { ltp: 101.0, bid: None, ask: None, previous: None, expected: Side::Buy },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = infer_side(test.ltp, test.bid, test.ask, test.previous);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
