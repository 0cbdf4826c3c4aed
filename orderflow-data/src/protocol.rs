//! JSON text-frame protocol spoken with the streaming server.

use crate::{
    error::DataError,
    types::{Side, SubscriptionMode, SymbolKey, Tick},
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Action(ClientAction),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientAction {
    Authenticate {
        api_key: String,
    },
    Subscribe {
        symbol: SmolStr,
        exchange: SmolStr,
        mode: u8,
    },
    Unsubscribe {
        symbol: SmolStr,
        exchange: SmolStr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Heartbeat {
    Pong,
}

impl ClientMessage {
    pub fn authenticate(api_key: impl Into<String>) -> Self {
        Self::Action(ClientAction::Authenticate {
            api_key: api_key.into(),
        })
    }

    pub fn subscribe(key: &SymbolKey, mode: SubscriptionMode) -> Self {
        Self::Action(ClientAction::Subscribe {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            mode: mode.as_u8(),
        })
    }

    pub fn unsubscribe(key: &SymbolKey) -> Self {
        Self::Action(ClientAction::Unsubscribe {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
        })
    }

    pub fn pong() -> Self {
        Self::Heartbeat(Heartbeat::Pong)
    }

    pub fn to_json(&self) -> Result<String, DataError> {
        serde_json::to_string(self).map_err(|error| DataError::Deserialise {
            error: error.to_string(),
            payload: format!("{self:?}"),
        })
    }
}

/// Message received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping,
    #[serde(alias = "authenticated")]
    Auth {
        #[serde(default)]
        status: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<serde_json::Value>,
    },
    TickData {
        symbol: SmolStr,
        #[serde(default)]
        exchange: Option<SmolStr>,
        tick: WireTick,
    },
    MarketData {
        symbol: SmolStr,
        #[serde(default)]
        exchange: Option<SmolStr>,
        data: QuoteData,
    },
}

const KNOWN_TYPES: [&str; 6] = [
    "ping",
    "auth",
    "authenticated",
    "error",
    "tick_data",
    "market_data",
];

impl ServerMessage {
    /// Parse a text frame, separating malformed payloads from unrecognised message types.
    pub fn parse(text: &str) -> Result<Self, DataError> {
        let deserialise_error = |error: serde_json::Error| DataError::Deserialise {
            error: error.to_string(),
            payload: text.chars().take(256).collect(),
        };

        let value = serde_json::from_str::<serde_json::Value>(text).map_err(deserialise_error)?;

        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .ok_or_else(|| DataError::UnknownMessage("<missing type>".to_string()))?;

        if !KNOWN_TYPES.contains(&kind) {
            return Err(DataError::UnknownMessage(kind.to_string()));
        }

        serde_json::from_value(value).map_err(deserialise_error)
    }

    /// For `auth` messages, whether the server accepted the credential.
    pub fn auth_accepted(status: &Option<serde_json::Value>) -> bool {
        match status {
            None => true,
            Some(serde_json::Value::Bool(accepted)) => *accepted,
            Some(serde_json::Value::String(status)) => matches!(
                status.to_ascii_lowercase().as_str(),
                "success" | "ok" | "authenticated"
            ),
            Some(_) => false,
        }
    }
}

/// Trade payload of a `tick_data` message.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct WireTick {
    pub time: i64,
    pub price: f64,
    pub volume: f64,
    pub side: Side,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
}

impl TryFrom<WireTick> for Tick {
    type Error = DataError;

    fn try_from(wire: WireTick) -> Result<Self, Self::Error> {
        Tick::with_quote(wire.time, wire.price, wire.volume, wire.side, wire.bid, wire.ask)
    }
}

/// Quote payload of a degraded `market_data` message.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct QuoteData {
    /// Last traded price
    pub ltp: f64,
    /// Last traded quantity
    #[serde(default)]
    pub ltq: Option<f64>,
    /// Session cumulative volume
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    /// Quote time in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_serialise() {
        let key = SymbolKey::new("NIFTY", "NSE_INDEX");

        assert_eq!(
            ClientMessage::authenticate("secret").to_json().unwrap(),
            r#"{"action":"authenticate","api_key":"secret"}"#
        );
        assert_eq!(
            ClientMessage::subscribe(&key, SubscriptionMode::Tick)
                .to_json()
                .unwrap(),
            r#"{"action":"subscribe","symbol":"NIFTY","exchange":"NSE_INDEX","mode":4}"#
        );
        assert_eq!(
            ClientMessage::unsubscribe(&key).to_json().unwrap(),
            r#"{"action":"unsubscribe","symbol":"NIFTY","exchange":"NSE_INDEX"}"#
        );
        assert_eq!(ClientMessage::pong().to_json().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_client_messages_deserialise() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"action":"unsubscribe","symbol":"A","exchange":"B"}"#)
                .unwrap();
        assert_eq!(message, ClientMessage::unsubscribe(&SymbolKey::new("A", "B")));

        let message: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(message, ClientMessage::pong());
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(ServerMessage::parse(r#"{"type":"ping"}"#).unwrap(), ServerMessage::Ping);

        match ServerMessage::parse(r#"{"type":"authenticated","status":"success"}"#).unwrap() {
            ServerMessage::Auth { status, .. } => assert!(ServerMessage::auth_accepted(&status)),
            other => panic!("unexpected message: {other:?}"),
        }

        let tick = ServerMessage::parse(
            r#"{"type":"tick_data","symbol":"SBIN","tick":{"time":1700000000000,"price":612.5,"volume":10,"side":"buy","bid":612.45,"ask":612.5}}"#,
        )
        .unwrap();
        match tick {
            ServerMessage::TickData {
                symbol,
                exchange,
                tick,
            } => {
                assert_eq!(symbol, "SBIN");
                assert_eq!(exchange, None);
                assert_eq!(tick.side, Side::Buy);
                assert_eq!(Tick::try_from(tick).unwrap().price, 612.5);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let quote = ServerMessage::parse(
            r#"{"type":"market_data","symbol":"SBIN","exchange":"NSE","data":{"ltp":612.5,"ltq":25,"volume":120000,"bid":612.4,"ask":612.6,"timestamp":1700000000000,"oi":0}}"#,
        )
        .unwrap();
        match quote {
            ServerMessage::MarketData { data, exchange, .. } => {
                assert_eq!(exchange.as_deref(), Some("NSE"));
                assert_eq!(data.ltq, Some(25.0));
                assert_eq!(data.timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        struct TestCase {
            input: &'static str,
            unknown: bool,
        }

        let tests = vec![
            // TC0: malformed JSON
            TestCase { input: "{not json", unknown: false },
            // TC1: unknown message type
            TestCase { input: r#"{"type":"depth","symbol":"X"}"#, unknown: true },
            // TC2: missing type field
            TestCase { input: r#"{"symbol":"X"}"#, unknown: true },
            // TC3: known type with a malformed body
            TestCase { input: r#"{"type":"tick_data","symbol":"X"}"#, unknown: false },
            // TC4: trade without a volume
            TestCase {
                input: r#"{"type":"tick_data","symbol":"X","tick":{"time":1,"price":10.0,"side":"buy"}}"#,
                unknown: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let error = ServerMessage::parse(test.input).unwrap_err();
            let actual = matches!(error, DataError::UnknownMessage(_));
            assert_eq!(actual, test.unknown, "TC{} failed: {error}", index);
        }
    }

    #[test]
    fn test_auth_accepted() {
        use serde_json::json;

        assert!(ServerMessage::auth_accepted(&None));
        assert!(ServerMessage::auth_accepted(&Some(json!("success"))));
        assert!(ServerMessage::auth_accepted(&Some(json!("OK"))));
        assert!(ServerMessage::auth_accepted(&Some(json!(true))));
        assert!(!ServerMessage::auth_accepted(&Some(json!("error"))));
        assert!(!ServerMessage::auth_accepted(&Some(json!(false))));
        assert!(!ServerMessage::auth_accepted(&Some(json!(401))));
    }
}
