//! Environment-driven engine configuration.
//!
//! Every setting has a default; unset variables fall back to it. A variable that is set but
//! cannot be parsed is a [`DataError::Config`] rather than a silent default.

use crate::{
    connection::{ConnectionConfig, DEFAULT_CLOSE_GRACE, backoff::ReconnectPolicy},
    error::DataError,
    footprint::{FootprintAggregator, ImbalanceConfig, TickSizeTable},
    power_trade::PowerTradeConfig,
    store::DEFAULT_TICK_CAPACITY,
    streams::timeout::DEFAULT_READ_TIMEOUT,
};
use std::{str::FromStr, time::Duration};
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// `ORDERFLOW_WS_URL`
    pub url: Option<Url>,
    /// `ORDERFLOW_API_KEY`
    pub api_key: String,
    pub reconnect: ReconnectPolicy,
    pub close_grace: Duration,
    pub read_timeout: Duration,
    /// Ticks retained per instrument
    pub tick_capacity: usize,
    pub footprint: FootprintAggregator,
    pub power_trade: PowerTradeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: String::new(),
            reconnect: ReconnectPolicy::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tick_capacity: DEFAULT_TICK_CAPACITY,
            footprint: FootprintAggregator::default(),
            power_trade: PowerTradeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, DataError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = Lookup(lookup);

        let url = var
            .raw("ORDERFLOW_WS_URL")
            .map(|value| {
                Url::parse(&value).map_err(|_| DataError::Config {
                    key: "ORDERFLOW_WS_URL",
                    value,
                })
            })
            .transpose()?;

        let reconnect = ReconnectPolicy {
            base: var
                .parse("ORDERFLOW_RECONNECT_BASE_MS", |ms: &u64| *ms > 0)?
                .map_or(defaults.reconnect.base, Duration::from_millis),
            cap: var
                .parse("ORDERFLOW_RECONNECT_CAP_MS", |ms: &u64| *ms > 0)?
                .map_or(defaults.reconnect.cap, Duration::from_millis),
            max_attempts: var
                .parse("ORDERFLOW_RECONNECT_MAX_ATTEMPTS", |_: &u32| true)?
                .unwrap_or(defaults.reconnect.max_attempts),
        };

        let footprint = FootprintAggregator {
            interval_ms: var
                .parse("ORDERFLOW_BAR_INTERVAL_MS", |ms: &i64| *ms > 0)?
                .unwrap_or(defaults.footprint.interval_ms),
            tick_size: var.parse("ORDERFLOW_TICK_SIZE", positive)?,
            table: TickSizeTable::default(),
            imbalance: ImbalanceConfig {
                ratio: var
                    .parse("ORDERFLOW_IMBALANCE_RATIO", positive)?
                    .unwrap_or(defaults.footprint.imbalance.ratio),
                ..defaults.footprint.imbalance
            },
        };

        let power_trade = PowerTradeConfig {
            window_ms: var
                .parse("POWER_TRADE_WINDOW_MS", |ms: &i64| *ms > 0)?
                .unwrap_or(defaults.power_trade.window_ms),
            volume_threshold: var
                .parse("POWER_TRADE_THRESHOLD", positive)?
                .unwrap_or(defaults.power_trade.volume_threshold),
            alert_volume_multiplier: var
                .parse("POWER_TRADE_ALERT_MULTIPLIER", positive)?
                .unwrap_or(defaults.power_trade.alert_volume_multiplier),
            max_history_count: var
                .parse("POWER_TRADE_MAX_HISTORY", |count: &usize| *count > 0)?
                .unwrap_or(defaults.power_trade.max_history_count),
        };

        Ok(Self {
            url,
            api_key: var.raw("ORDERFLOW_API_KEY").unwrap_or_default(),
            reconnect,
            close_grace: var
                .parse("ORDERFLOW_CLOSE_GRACE_MS", |_: &u64| true)?
                .map_or(defaults.close_grace, Duration::from_millis),
            read_timeout: var
                .parse("ORDERFLOW_READ_TIMEOUT_SECS", |secs: &u64| *secs > 0)?
                .map_or(defaults.read_timeout, Duration::from_secs),
            tick_capacity: var
                .parse("ORDERFLOW_TICK_CAPACITY", |capacity: &usize| *capacity > 0)?
                .unwrap_or(defaults.tick_capacity),
            footprint,
            power_trade,
        })
    }

    /// Connection settings; fails when no URL is configured.
    pub fn connection(&self) -> Result<ConnectionConfig, DataError> {
        let url = self.url.clone().ok_or_else(|| DataError::Config {
            key: "ORDERFLOW_WS_URL",
            value: String::new(),
        })?;

        Ok(ConnectionConfig::new(url, self.api_key.clone())
            .with_reconnect_policy(self.reconnect)
            .with_close_grace(self.close_grace)
            .with_read_timeout(self.read_timeout))
    }
}

fn positive(value: &f64) -> bool {
    value.is_finite() && *value > 0.0
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value of `key`.
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T, V>(&self, key: &'static str, valid: V) -> Result<Option<T>, DataError>
    where
        T: FromStr,
        V: Fn(&T) -> bool,
    {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        match value.parse::<T>() {
            Ok(parsed) if valid(&parsed) => Ok(Some(parsed)),
            _ => Err(DataError::Config { key, value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<EngineConfig, DataError> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.tick_capacity, 10_000);
        assert_eq!(config.power_trade.window_ms, 5_000);
        assert_eq!(config.footprint.imbalance.ratio, 3.0);
        assert!(config.connection().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("ORDERFLOW_WS_URL", "ws://localhost:8765"),
            ("ORDERFLOW_API_KEY", " secret "),
            ("ORDERFLOW_RECONNECT_BASE_MS", "100"),
            ("ORDERFLOW_RECONNECT_CAP_MS", "1000"),
            ("ORDERFLOW_RECONNECT_MAX_ATTEMPTS", "3"),
            ("ORDERFLOW_TICK_CAPACITY", "500"),
            ("ORDERFLOW_TICK_SIZE", "0.05"),
            ("ORDERFLOW_BAR_INTERVAL_MS", "300000"),
            ("POWER_TRADE_THRESHOLD", "2500"),
            ("POWER_TRADE_MAX_HISTORY", "50"),
        ])
        .unwrap();

        assert_eq!(config.api_key, "secret");
        assert_eq!(config.reconnect.base, Duration::from_millis(100));
        assert_eq!(config.reconnect.cap, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.tick_capacity, 500);
        assert_eq!(config.footprint.tick_size, Some(0.05));
        assert_eq!(config.footprint.interval_ms, 300_000);
        assert_eq!(config.power_trade.volume_threshold, 2_500.0);
        assert_eq!(config.power_trade.max_history_count, 50);

        let connection = config.connection().unwrap();
        assert_eq!(connection.url.as_str(), "ws://localhost:8765/");
        assert_eq!(connection.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_invalid_values() {
        struct TestCase {
            key: &'static str,
            value: &'static str,
        }

        let tests = vec![
            // TC0: not a number
            TestCase { key: "ORDERFLOW_TICK_CAPACITY", value: "lots" },
            // TC1: zero capacity
            TestCase { key: "ORDERFLOW_TICK_CAPACITY", value: "0" },
            // TC2: negative tick size
            TestCase { key: "ORDERFLOW_TICK_SIZE", value: "-0.05" },
            // TC3: non-finite ratio
            TestCase { key: "ORDERFLOW_IMBALANCE_RATIO", value: "inf" },
            // TC4: malformed URL
            TestCase { key: "ORDERFLOW_WS_URL", value: "localhost 8765" },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = config(&[(test.key, test.value)]);
            assert!(
                matches!(actual, Err(DataError::Config { key, .. }) if key == test.key),
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("ORDERFLOW_TICK_SIZE", "  "), ("POWER_TRADE_WINDOW_MS", "")]).unwrap();
        assert_eq!(config.footprint.tick_size, None);
        assert_eq!(config.power_trade.window_ms, 5_000);
    }
}
