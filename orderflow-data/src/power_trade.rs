//! Sliding-window detection of aggregated trade bursts ("power trades").
//!
//! Every tick is buffered with its receipt time. Ticks older than the trailing window are
//! dropped; once the buffered volume reaches the configured threshold a [`PowerTrade`] is
//! synthesised from the buffer and the buffer starts over empty.

use crate::{
    aggregation::calculate_vwap,
    series::SeriesModel,
    types::{Side, Tick},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

pub const DEFAULT_WINDOW_MS: i64 = 5_000;
pub const DEFAULT_VOLUME_THRESHOLD: f64 = 10_000.0;
pub const DEFAULT_ALERT_VOLUME_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_HISTORY_COUNT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTradeConfig {
    /// Trailing window in milliseconds
    pub window_ms: i64,
    /// Buffered volume at which a power trade is emitted
    pub volume_threshold: f64,
    /// Trades with `volume >= multiplier * threshold` are high alert
    pub alert_volume_multiplier: f64,
    pub max_history_count: usize,
}

impl Default for PowerTradeConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            alert_volume_multiplier: DEFAULT_ALERT_VOLUME_MULTIPLIER,
            max_history_count: DEFAULT_MAX_HISTORY_COUNT,
        }
    }
}

impl PowerTradeConfig {
    fn alert_volume(&self) -> f64 {
        self.alert_volume_multiplier * self.volume_threshold
    }
}

/// Burst of volume aggregated over one detection window.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PowerTrade {
    /// Time of the tick that crossed the threshold
    pub time: i64,
    /// Volume-weighted average price of the window
    pub price: f64,
    /// Summed volume of the window
    pub volume: f64,
    /// Side contributing the most volume
    pub side: Side,
    pub tick_count: usize,
}

impl PowerTrade {
    fn history_key(&self) -> (i64, u64) {
        (self.time, self.price.to_bits())
    }
}

#[derive(Debug, Clone)]
pub struct PowerTradeDetector {
    config: PowerTradeConfig,
    /// (receipt time, tick)
    buffer: VecDeque<(i64, Tick)>,
    history: BTreeMap<(i64, u64), PowerTrade>,
    last_detection: Option<i64>,
}

impl Default for PowerTradeDetector {
    fn default() -> Self {
        Self::new(PowerTradeConfig::default())
    }
}

impl PowerTradeDetector {
    pub fn new(config: PowerTradeConfig) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            history: BTreeMap::new(),
            last_detection: None,
        }
    }

    pub fn config(&self) -> &PowerTradeConfig {
        &self.config
    }

    /// Replace the configuration, trimming history to the new cap.
    pub fn set_config(&mut self, config: PowerTradeConfig) {
        self.config = config;
        self.evict_history();
    }

    /// Process a live tick using the wall clock as its receipt time.
    pub fn process_tick(&mut self, tick: Tick) -> Option<PowerTrade> {
        self.process_tick_at(tick, Utc::now().timestamp_millis())
    }

    /// Process a tick received at `received_ms`.
    ///
    /// Returns the power trade emitted by this tick, if it crossed the threshold.
    pub fn process_tick_at(&mut self, tick: Tick, received_ms: i64) -> Option<PowerTrade> {
        self.buffer.push_back((received_ms, tick));

        let cutoff = received_ms - self.config.window_ms;
        while let Some((received, _)) = self.buffer.front() {
            if *received < cutoff {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        let volume = self.buffered_volume();
        if volume <= 0.0 || volume < self.config.volume_threshold {
            return None;
        }

        let trade = self.synthesise(tick, volume)?;
        self.buffer.clear();
        self.last_detection = Some(received_ms);

        info!(
            time = trade.time,
            price = trade.price,
            volume = trade.volume,
            side = %trade.side,
            tick_count = trade.tick_count,
            high_alert = self.is_high_alert(&trade),
            "power trade detected"
        );

        self.add_power_trade(trade).then_some(trade)
    }

    fn synthesise(&self, crossing: Tick, volume: f64) -> Option<PowerTrade> {
        let price = calculate_vwap(self.buffer.iter().map(|(_, tick)| tick))?;

        let (buy_volume, sell_volume) =
            self.buffer
                .iter()
                .fold((0.0, 0.0), |(buy, sell), (_, tick)| match tick.side {
                    Side::Buy => (buy + tick.volume, sell),
                    Side::Sell => (buy, sell + tick.volume),
                });

        let side = if buy_volume > sell_volume {
            Side::Buy
        } else if sell_volume > buy_volume {
            Side::Sell
        } else {
            crossing.side
        };

        Some(PowerTrade {
            time: crossing.time,
            price,
            volume,
            side,
            tick_count: self.buffer.len(),
        })
    }

    /// Replay a historical range, using each tick's own time as its receipt time.
    ///
    /// The live buffer and history are left untouched.
    pub fn detect_in_range(&self, ticks: &[Tick]) -> Vec<PowerTrade> {
        let mut replay = PowerTradeDetector::new(PowerTradeConfig {
            max_history_count: usize::MAX,
            ..self.config
        });

        ticks
            .iter()
            .filter_map(|tick| replay.process_tick_at(*tick, tick.time))
            .collect()
    }

    /// Replace the history with a backfilled set of trades.
    pub fn set_data(&mut self, trades: Vec<PowerTrade>) {
        self.history.clear();
        let count = trades.len();
        for trade in trades {
            self.add_power_trade(trade);
        }
        debug!(
            received = count,
            retained = self.history.len(),
            "power trade history replaced"
        );
    }

    /// Insert a trade into the history.
    ///
    /// Returns `false` when a trade with the same `(time, price)` already exists, or when the
    /// trade is older than everything retained by a full history.
    pub fn add_power_trade(&mut self, trade: PowerTrade) -> bool {
        let key = trade.history_key();
        if self.history.contains_key(&key) {
            debug!(time = trade.time, price = trade.price, "duplicate power trade rejected");
            return false;
        }

        self.history.insert(key, trade);
        self.evict_history();
        self.history.contains_key(&key)
    }

    fn evict_history(&mut self) {
        while self.history.len() > self.config.max_history_count {
            self.history.pop_first();
        }
    }

    pub fn is_high_alert(&self, trade: &PowerTrade) -> bool {
        trade.volume >= self.config.alert_volume()
    }

    /// History ordered by time (then price).
    pub fn history(&self) -> impl Iterator<Item = &PowerTrade> {
        self.history.values()
    }

    pub fn latest(&self) -> Option<&PowerTrade> {
        self.history.values().next_back()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn buffered_volume(&self) -> f64 {
        self.buffer.iter().map(|(_, tick)| tick.volume).sum()
    }

    pub fn buffered_ticks(&self) -> usize {
        self.buffer.len()
    }

    /// Receipt time of the most recent detection.
    pub fn last_detection(&self) -> Option<i64> {
        self.last_detection
    }

    /// Drop history, buffer and detection time.
    pub fn clear_data(&mut self) {
        self.history.clear();
        self.buffer.clear();
        self.last_detection = None;
    }
}

/// Power trade prepared for drawing, with its alert level resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTradeMarker {
    pub trade: PowerTrade,
    pub high_alert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTradeOptions {
    pub config: PowerTradeConfig,
    /// Only expose high-alert trades as markers
    pub high_alert_only: bool,
    pub visible: bool,
}

impl Default for PowerTradeOptions {
    fn default() -> Self {
        Self {
            config: PowerTradeConfig::default(),
            high_alert_only: false,
            visible: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerTradeOptionsPatch {
    pub window_ms: Option<i64>,
    pub volume_threshold: Option<f64>,
    pub alert_volume_multiplier: Option<f64>,
    pub max_history_count: Option<usize>,
    pub high_alert_only: Option<bool>,
    pub visible: Option<bool>,
}

/// Power-trade model handed to the rendering collaborator.
#[derive(Debug, Clone, Default)]
pub struct PowerTradeSeries {
    detector: PowerTradeDetector,
    options: PowerTradeOptions,
}

impl PowerTradeSeries {
    pub fn new(options: PowerTradeOptions) -> Self {
        Self {
            detector: PowerTradeDetector::new(options.config),
            options,
        }
    }

    pub fn detector(&self) -> &PowerTradeDetector {
        &self.detector
    }

    pub fn process_tick(&mut self, tick: Tick) -> Option<PowerTrade> {
        self.detector.process_tick(tick)
    }

    pub fn process_tick_at(&mut self, tick: Tick, received_ms: i64) -> Option<PowerTrade> {
        self.detector.process_tick_at(tick, received_ms)
    }

    /// Rebuild the history from a historical range of ticks.
    pub fn rebuild(&mut self, ticks: &[Tick]) {
        let trades = self.detector.detect_in_range(ticks);
        self.detector.set_data(trades);
    }

    pub fn markers(&self) -> Vec<PowerTradeMarker> {
        if !self.options.visible {
            return Vec::new();
        }

        self.detector
            .history()
            .map(|trade| PowerTradeMarker {
                trade: *trade,
                high_alert: self.detector.is_high_alert(trade),
            })
            .filter(|marker| !self.options.high_alert_only || marker.high_alert)
            .collect()
    }
}

impl SeriesModel for PowerTradeSeries {
    type Point = PowerTrade;
    type Options = PowerTradeOptions;
    type OptionsPatch = PowerTradeOptionsPatch;

    fn set_data(&mut self, data: Vec<PowerTrade>) {
        self.detector.set_data(data);
    }

    fn upsert(&mut self, point: PowerTrade) {
        let key = point.history_key();
        self.detector.history.insert(key, point);
        self.detector.evict_history();
    }

    fn options(&self) -> &PowerTradeOptions {
        &self.options
    }

    fn apply_options(&mut self, patch: PowerTradeOptionsPatch) {
        let config = &mut self.options.config;
        if let Some(window_ms) = patch.window_ms.filter(|window| *window > 0) {
            config.window_ms = window_ms;
        }
        if let Some(threshold) = patch.volume_threshold.filter(|v| v.is_finite() && *v > 0.0) {
            config.volume_threshold = threshold;
        }
        if let Some(multiplier) = patch
            .alert_volume_multiplier
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            config.alert_volume_multiplier = multiplier;
        }
        if let Some(max_history_count) = patch.max_history_count {
            config.max_history_count = max_history_count.max(1);
        }
        if let Some(high_alert_only) = patch.high_alert_only {
            self.options.high_alert_only = high_alert_only;
        }
        if let Some(visible) = patch.visible {
            self.options.visible = visible;
        }

        self.detector.set_config(self.options.config);
    }

    fn clear_data(&mut self) {
        self.detector.clear_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(threshold: f64) -> PowerTradeConfig {
        PowerTradeConfig {
            volume_threshold: threshold,
            ..PowerTradeConfig::default()
        }
    }

    fn tick(time: i64, price: f64, volume: f64, side: Side) -> Tick {
        Tick::new(time, price, volume, side).unwrap()
    }

    fn trade(time: i64, price: f64, volume: f64) -> PowerTrade {
        PowerTrade {
            time,
            price,
            volume,
            side: Side::Buy,
            tick_count: 1,
        }
    }

    #[test]
    fn test_detection_vwap_and_dominant_side() {
        let mut detector = PowerTradeDetector::new(config(1_000.0));

        assert_eq!(detector.process_tick_at(tick(0, 100.0, 300.0, Side::Sell), 0), None);
        assert_eq!(detector.process_tick_at(tick(10, 101.0, 200.0, Side::Buy), 10), None);
        let trade = detector
            .process_tick_at(tick(20, 102.0, 500.0, Side::Sell), 20)
            .unwrap();

        assert_eq!(trade.time, 20);
        assert_eq!(trade.volume, 1_000.0);
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.tick_count, 3);
        assert!((trade.price - 101.2).abs() < 1e-9);

        assert_eq!(detector.buffered_ticks(), 0);
        assert_eq!(detector.last_detection(), Some(20));
        assert_eq!(detector.history_len(), 1);
    }

    #[test]
    fn test_side_tie_uses_crossing_tick() {
        let mut detector = PowerTradeDetector::new(config(100.0));
        detector.process_tick_at(tick(0, 50.0, 50.0, Side::Buy), 0);
        let trade = detector
            .process_tick_at(tick(1, 50.0, 50.0, Side::Sell), 1)
            .unwrap();
        assert_eq!(trade.side, Side::Sell);
    }

    #[test]
    fn test_window_eviction() {
        struct TestCase {
            second_received: i64,
            detected: bool,
        }

        let tests = vec![
            // TC0: first tick aged out of the window
            TestCase { second_received: 6_000, detected: false },
            // TC1: first tick exactly at the window edge is kept
            TestCase { second_received: 5_000, detected: true },
            // TC2: well inside the window
            TestCase { second_received: 1_000, detected: true },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut detector = PowerTradeDetector::new(config(10_000.0));
            detector.process_tick_at(tick(0, 100.0, 6_000.0, Side::Buy), 0);
            let actual = detector
                .process_tick_at(
                    tick(test.second_received, 100.0, 6_000.0, Side::Buy),
                    test.second_received,
                )
                .is_some();
            assert_eq!(actual, test.detected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_windows_do_not_overlap() {
        let mut detector = PowerTradeDetector::new(config(100.0));
        assert!(detector.process_tick_at(tick(0, 10.0, 100.0, Side::Buy), 0).is_some());
        assert!(detector.process_tick_at(tick(1, 10.0, 60.0, Side::Buy), 1).is_none());
        assert_eq!(detector.buffered_volume(), 60.0);
        assert!(detector.process_tick_at(tick(2, 11.0, 40.0, Side::Buy), 2).is_some());
        assert_eq!(detector.history_len(), 2);
    }

    #[test]
    fn test_history_dedup_and_cap() {
        let mut detector = PowerTradeDetector::new(PowerTradeConfig {
            max_history_count: 3,
            ..PowerTradeConfig::default()
        });

        assert!(detector.add_power_trade(trade(1, 100.0, 1.0)));
        assert!(!detector.add_power_trade(trade(1, 100.0, 2.0)));
        assert!(detector.add_power_trade(trade(1, 100.5, 1.0)));
        assert!(detector.add_power_trade(trade(2, 100.0, 1.0)));
        assert!(detector.add_power_trade(trade(3, 100.0, 1.0)));
        assert_eq!(detector.history_len(), 3);
        assert_eq!(detector.history().next().unwrap().price, 100.5);

        // Older than everything retained by a full history
        assert!(!detector.add_power_trade(trade(0, 99.0, 1.0)));
        assert_eq!(detector.latest().unwrap().time, 3);
    }

    #[test]
    fn test_set_data_sorts_dedups_and_caps() {
        let mut detector = PowerTradeDetector::new(PowerTradeConfig {
            max_history_count: 2,
            ..PowerTradeConfig::default()
        });
        detector.set_data(vec![
            trade(5, 1.0, 1.0),
            trade(1, 1.0, 1.0),
            trade(5, 1.0, 9.0),
            trade(3, 1.0, 1.0),
        ]);

        let times = detector.history().map(|t| t.time).collect::<Vec<_>>();
        assert_eq!(times, vec![3, 5]);
    }

    #[test]
    fn test_high_alert() {
        let detector = PowerTradeDetector::new(config(10_000.0));
        assert!(!detector.is_high_alert(&trade(0, 1.0, 19_999.0)));
        assert!(detector.is_high_alert(&trade(0, 1.0, 20_000.0)));
    }

    #[test]
    fn test_detect_in_range_leaves_live_state() {
        let mut detector = PowerTradeDetector::new(config(100.0));
        detector.process_tick_at(tick(0, 10.0, 40.0, Side::Buy), 0);

        let ticks = vec![
            tick(1_000, 10.0, 60.0, Side::Buy),
            tick(2_000, 10.5, 60.0, Side::Sell),
            tick(20_000, 11.0, 90.0, Side::Buy),
            tick(21_000, 11.0, 10.0, Side::Buy),
        ];
        let trades = detector.detect_in_range(&ticks);

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].time, 2_000);
        assert_eq!(trades[1].time, 21_000);
        assert_eq!(detector.buffered_volume(), 40.0);
        assert_eq!(detector.history_len(), 0);
    }

    #[test]
    fn test_series_markers_and_options() {
        let mut series = PowerTradeSeries::new(PowerTradeOptions {
            config: config(100.0),
            ..PowerTradeOptions::default()
        });
        series.set_data(vec![trade(1, 10.0, 150.0), trade(2, 10.0, 250.0)]);

        let markers = series.markers();
        assert_eq!(markers.len(), 2);
        assert!(!markers[0].high_alert);
        assert!(markers[1].high_alert);

        series.apply_options(PowerTradeOptionsPatch {
            high_alert_only: Some(true),
            ..Default::default()
        });
        assert_eq!(series.markers().len(), 1);

        // Raising the threshold recomputes the alert level
        series.apply_options(PowerTradeOptionsPatch {
            volume_threshold: Some(200.0),
            ..Default::default()
        });
        assert!(series.markers().is_empty());

        series.upsert(trade(2, 10.0, 500.0));
        assert_eq!(series.detector().history_len(), 2);
        assert_eq!(series.markers()[0].trade.volume, 500.0);
        assert_eq!(series.autoscale_info(), None);

        series.clear_data();
        assert_eq!(series.detector().history_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_threshold_crossing_emits_exactly_one_trade(
            volumes in prop::collection::vec(1u32..500, 1..64),
        ) {
            let threshold = 1_000.0;
            let mut detector = PowerTradeDetector::new(config(threshold));

            let mut running = 0.0;
            let crossing = volumes.iter().position(|volume| {
                running += *volume as f64;
                running >= threshold
            });
            let last = crossing.unwrap_or(volumes.len() - 1);

            let mut emitted = Vec::new();
            for (index, volume) in volumes.iter().take(last + 1).enumerate() {
                let time = index as i64;
                let side = if index % 2 == 0 { Side::Buy } else { Side::Sell };
                if let Some(trade) = detector.process_tick_at(tick(time, 100.0, *volume as f64, side), time) {
                    emitted.push(trade);
                }
            }

            match crossing {
                Some(index) => {
                    prop_assert_eq!(emitted.len(), 1);
                    prop_assert!(emitted[0].volume >= threshold);
                    prop_assert_eq!(emitted[0].tick_count, index + 1);
                    prop_assert_eq!(detector.buffered_ticks(), 0);
                }
                None => prop_assert!(emitted.is_empty()),
            }
        }
    }
}
