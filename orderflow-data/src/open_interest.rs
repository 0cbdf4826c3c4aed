//! Open-interest sense: market positioning inferred from joint price and OI changes.

use crate::types::SymbolKey;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// Default minimum percentage move considered significant.
pub const DEFAULT_OI_THRESHOLD_PCT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OiSense {
    /// Price up, OI up
    LongBuildup,
    /// Price down, OI up
    ShortBuildup,
    /// Price up, OI down
    ShortCovering,
    /// Price down, OI down
    LongUnwinding,
    Neutral,
}

impl OiSense {
    pub fn as_str(&self) -> &'static str {
        match self {
            OiSense::LongBuildup => "long-buildup",
            OiSense::ShortBuildup => "short-buildup",
            OiSense::ShortCovering => "short-covering",
            OiSense::LongUnwinding => "long-unwinding",
            OiSense::Neutral => "neutral",
        }
    }

    pub fn sentiment(&self) -> Sentiment {
        match self {
            OiSense::LongBuildup | OiSense::ShortCovering => Sentiment::Bullish,
            OiSense::ShortBuildup | OiSense::LongUnwinding => Sentiment::Bearish,
            OiSense::Neutral => Sentiment::Neutral,
        }
    }

    pub fn strength(&self) -> Strength {
        match self {
            OiSense::LongBuildup | OiSense::ShortBuildup => Strength::Strong,
            OiSense::ShortCovering | OiSense::LongUnwinding => Strength::Weak,
            OiSense::Neutral => Strength::None,
        }
    }
}

impl std::fmt::Display for OiSense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Strong,
    Weak,
    None,
}

/// Classified open-interest reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct OiSignal {
    pub sense: OiSense,
    pub sentiment: Sentiment,
    pub strength: Strength,
}

impl From<OiSense> for OiSignal {
    fn from(sense: OiSense) -> Self {
        Self {
            sense,
            sentiment: sense.sentiment(),
            strength: sense.strength(),
        }
    }
}

/// Classify a price/open-interest move, both given in percent.
///
/// Either move smaller in magnitude than `threshold` (or non-finite) is neutral.
pub fn classify(price_change_pct: f64, oi_change_pct: f64, threshold: f64) -> OiSignal {
    let significant = |change: f64| change.is_finite() && change.abs() >= threshold;

    let sense = if !significant(price_change_pct) || !significant(oi_change_pct) {
        OiSense::Neutral
    } else {
        match (price_change_pct > 0.0, oi_change_pct > 0.0) {
            (true, true) => OiSense::LongBuildup,
            (false, true) => OiSense::ShortBuildup,
            (true, false) => OiSense::ShortCovering,
            (false, false) => OiSense::LongUnwinding,
        }
    };

    OiSignal::from(sense)
}

/// Percentage change from `previous` to `current`; `None` without a positive base.
pub fn percent_change(previous: f64, current: f64) -> Option<f64> {
    if !previous.is_finite() || !current.is_finite() || previous <= 0.0 {
        return None;
    }
    Some((current - previous) / previous * 100.0)
}

/// Price and open interest observed together for one instrument.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct OiSnapshot {
    pub price: f64,
    /// Open contracts / lots reported by the exchange
    pub open_interest: f64,
    pub time: Option<DateTime<Utc>>,
}

/// Classifies successive [`OiSnapshot`]s per instrument against the previous snapshot.
#[derive(Debug, Clone)]
pub struct OiTracker {
    threshold: f64,
    previous: FnvHashMap<SymbolKey, OiSnapshot>,
}

impl Default for OiTracker {
    fn default() -> Self {
        Self::new(DEFAULT_OI_THRESHOLD_PCT)
    }
}

impl OiTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            previous: FnvHashMap::default(),
        }
    }

    /// Record a snapshot, returning the signal relative to the previous one for `key`.
    pub fn update(&mut self, key: &SymbolKey, snapshot: OiSnapshot) -> Option<OiSignal> {
        let signal = self.previous.get(key).and_then(|previous| {
            let price_change = percent_change(previous.price, snapshot.price)?;
            let oi_change = percent_change(previous.open_interest, snapshot.open_interest)?;
            Some(classify(price_change, oi_change, self.threshold))
        });

        self.previous.insert(key.clone(), snapshot);
        signal
    }

    pub fn last(&self, key: &SymbolKey) -> Option<&OiSnapshot> {
        self.previous.get(key)
    }

    pub fn reset(&mut self, key: &SymbolKey) {
        self.previous.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quadrants() {
        struct TestCase {
            price: f64,
            oi: f64,
            expected: (OiSense, Sentiment, Strength),
        }

        let tests = vec![
            // TC0: long buildup
            TestCase { price: 5.0, oi: 5.0, expected: (OiSense::LongBuildup, Sentiment::Bullish, Strength::Strong) },
            // TC1: short buildup
            TestCase { price: -5.0, oi: 5.0, expected: (OiSense::ShortBuildup, Sentiment::Bearish, Strength::Strong) },
            // TC2: short covering
            TestCase { price: 5.0, oi: -5.0, expected: (OiSense::ShortCovering, Sentiment::Bullish, Strength::Weak) },
            // TC3: long unwinding
            TestCase { price: -5.0, oi: -5.0, expected: (OiSense::LongUnwinding, Sentiment::Bearish, Strength::Weak) },
            // TC4: both below threshold
            TestCase { price: 0.2, oi: 0.2, expected: (OiSense::Neutral, Sentiment::Neutral, Strength::None) },
            // TC5: only price significant
            TestCase { price: 5.0, oi: 0.5, expected: (OiSense::Neutral, Sentiment::Neutral, Strength::None) },
            // TC6: non-finite input
            TestCase { price: f64::NAN, oi: 5.0, expected: (OiSense::Neutral, Sentiment::Neutral, Strength::None) },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let signal = classify(test.price, test.oi, 1.0);
            let actual = (signal.sense, signal.sentiment, signal.strength);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(100.0, 105.0), Some(5.0));
        assert_eq!(percent_change(200.0, 100.0), Some(-50.0));
        assert_eq!(percent_change(0.0, 100.0), None);
        assert_eq!(percent_change(f64::NAN, 100.0), None);
    }

    #[test]
    fn test_tracker_compares_with_previous_snapshot() {
        let key = SymbolKey::new("NIFTY", "NFO");
        let mut tracker = OiTracker::new(1.0);
        let snapshot = |price, open_interest| OiSnapshot {
            price,
            open_interest,
            time: None,
        };

        assert_eq!(tracker.update(&key, snapshot(100.0, 1_000.0)), None);

        let signal = tracker.update(&key, snapshot(102.0, 1_100.0)).unwrap();
        assert_eq!(signal.sense, OiSense::LongBuildup);

        let signal = tracker.update(&key, snapshot(99.0, 1_000.0)).unwrap();
        assert_eq!(signal.sense, OiSense::LongUnwinding);
        assert_eq!(tracker.last(&key).unwrap().price, 99.0);

        tracker.reset(&key);
        assert_eq!(tracker.update(&key, snapshot(99.0, 1_000.0)), None);
    }

    #[test]
    fn test_sense_display() {
        assert_eq!(OiSense::ShortCovering.to_string(), "short-covering");
        assert_eq!(
            serde_json::to_string(&OiSignal::from(OiSense::LongBuildup)).unwrap(),
            r#"{"sense":"long_buildup","sentiment":"bullish","strength":"strong"}"#
        );
    }
}
