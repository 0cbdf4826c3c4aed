//! Engine service owning the tick store and one order-flow pipeline per watched instrument.
//!
//! The [`ConnectionManager`] is injected at construction. Watching a key subscribes through it,
//! buffers every tick in the [`TickStore`] and feeds a store listener that keeps the key's
//! [`InstrumentFlow`] (footprint, delta, power trades) current.

use crate::{
    config::EngineConfig,
    connection::{ConnectionManager, StreamEvent, SubscriptionHandle},
    cvd::{DeltaOptions, DeltaOptionsPatch, DeltaSeries, DivergenceSignal, delta_series},
    error::DataError,
    footprint::{FootprintOptions, FootprintOptionsPatch, FootprintSeries},
    open_interest::{OiSignal, OiSnapshot, OiTracker},
    power_trade::{PowerTrade, PowerTradeOptions, PowerTradeSeries},
    series::SeriesModel,
    store::{ListenerHandle, TickStore},
    types::{SubscriptionMode, SymbolKey, Tick},
};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const FLOW_EVENT_CAPACITY: usize = 1_024;

/// Derived models for one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentFlow {
    pub key: SymbolKey,
    pub footprint: FootprintSeries,
    pub delta: DeltaSeries,
    pub power_trades: PowerTradeSeries,
    pub oi_signal: Option<OiSignal>,
}

impl InstrumentFlow {
    pub fn new(key: SymbolKey, config: &EngineConfig) -> Self {
        let footprint = FootprintOptions {
            aggregator: config.footprint.clone(),
            ..FootprintOptions::default()
        };
        let delta = DeltaOptions {
            max_points: footprint.max_bars,
            ..DeltaOptions::default()
        };

        Self {
            key,
            footprint: FootprintSeries::new(footprint),
            delta: DeltaSeries::new(delta),
            power_trades: PowerTradeSeries::new(PowerTradeOptions {
                config: config.power_trade,
                ..PowerTradeOptions::default()
            }),
            oi_signal: None,
        }
    }

    /// Fold a live tick into every model, returning a power trade if one was detected.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<PowerTrade> {
        let bar_time = self.footprint.add_tick(tick);
        if let Some(bar) = self.footprint.bar(bar_time) {
            self.delta.update_from_bar(bar);
        }
        self.power_trades.process_tick(*tick)
    }

    /// Rebuild every model from a historical range of ticks.
    pub fn backfill(&mut self, ticks: &[Tick]) {
        self.footprint.rebuild(ticks);
        self.delta.set_data(delta_series(self.footprint.bars()));
        self.power_trades.rebuild(ticks);
    }

    pub fn clear(&mut self) {
        self.footprint.clear_data();
        self.delta.clear_data();
        self.power_trades.clear_data();
        self.oi_signal = None;
    }

    pub fn summary(&self) -> FlowSummary {
        let bar = self.footprint.latest();
        let power_trade = self.power_trades.detector().latest().copied();

        FlowSummary {
            key: self.key.clone(),
            bars: self.footprint.len(),
            bar_time: bar.map(|bar| bar.time),
            close: bar.and_then(|bar| bar.close),
            poc: bar.and_then(|bar| bar.poc),
            bar_volume: bar.map(|bar| bar.total_volume()).unwrap_or(0.0),
            bar_delta: bar.map(|bar| bar.delta()).unwrap_or(0.0),
            cumulative_delta: self
                .delta
                .latest()
                .map(|point| point.cumulative_delta)
                .unwrap_or(0.0),
            divergence: self.delta.divergence(),
            power_trades: self.power_trades.detector().history_len(),
            high_alert: power_trade
                .map(|trade| self.power_trades.detector().is_high_alert(&trade))
                .unwrap_or(false),
            last_power_trade: power_trade,
            oi_signal: self.oi_signal,
        }
    }
}

/// Point-in-time digest of an [`InstrumentFlow`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSummary {
    pub key: SymbolKey,
    pub bars: usize,
    pub bar_time: Option<i64>,
    pub close: Option<f64>,
    pub poc: Option<f64>,
    pub bar_volume: f64,
    pub bar_delta: f64,
    pub cumulative_delta: f64,
    pub divergence: DivergenceSignal,
    pub power_trades: usize,
    pub last_power_trade: Option<PowerTrade>,
    pub high_alert: bool,
    pub oi_signal: Option<OiSignal>,
}

/// Notable event produced by an instrument pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    PowerTrade {
        key: SymbolKey,
        trade: PowerTrade,
        high_alert: bool,
    },
}

struct Watch {
    subscription: SubscriptionHandle,
    listener: ListenerHandle,
}

struct EngineInner {
    connection: ConnectionManager,
    config: EngineConfig,
    store: TickStore,
    flows: RwLock<FnvHashMap<SymbolKey, Arc<Mutex<InstrumentFlow>>>>,
    watches: Mutex<FnvHashMap<SymbolKey, Watch>>,
    oi: Mutex<OiTracker>,
    events: broadcast::Sender<FlowEvent>,
}

/// Cheap-to-clone engine handle.
#[derive(Clone)]
pub struct OrderflowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for OrderflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderflowEngine")
            .field("store", &self.inner.store)
            .field("flows", &self.inner.flows.read().len())
            .finish()
    }
}

impl OrderflowEngine {
    pub fn new(connection: ConnectionManager, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(FLOW_EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                connection,
                store: TickStore::new(config.tick_capacity),
                config,
                flows: RwLock::new(FnvHashMap::default()),
                watches: Mutex::new(FnvHashMap::default()),
                oi: Mutex::new(OiTracker::default()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TickStore {
        &self.inner.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn events(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    /// Start streaming `key` into its pipeline.
    ///
    /// Watching a key that is already watched replaces the previous subscription.
    pub fn watch(&self, key: SymbolKey, mode: SubscriptionMode) -> Result<(), DataError> {
        let flow = self.flow_entry(&key);
        let mut watches = self.inner.watches.lock();

        let store = self.inner.store.clone();
        let subscription = self.inner.connection.subscribe(
            [key.clone()],
            mode,
            move |event| match event {
                StreamEvent::Tick { key, tick, .. } => store.add_tick(key, *tick),
                StreamEvent::ServerError { message } => warn!(%message, "server error"),
                StreamEvent::ReconnectExhausted { attempts } => {
                    error!(attempts, "market data stream stopped, restart required")
                }
            },
        )?;

        let events = self.inner.events.clone();
        let listener_key = key.clone();
        let on_tick = move |tick: &Tick| {
            let mut flow = flow.lock();
            if let Some(trade) = flow.on_tick(tick) {
                let high_alert = flow.power_trades.detector().is_high_alert(&trade);
                let _ = events.send(FlowEvent::PowerTrade {
                    key: listener_key.clone(),
                    trade,
                    high_alert,
                });
            }
        };

        // The old subscription is released only after the new one holds the key
        let (listener, previous) = match watches.remove(&key) {
            Some(previous) => {
                debug!(%key, "watch replaced");
                let listener = self.inner.store.replace_listener(previous.listener, &key, on_tick);
                (listener, Some(previous.subscription))
            }
            None => (self.inner.store.add_listener(&key, on_tick), None),
        };

        watches.insert(
            key.clone(),
            Watch {
                subscription,
                listener,
            },
        );
        drop(watches);
        drop(previous);

        info!(%key, %mode, "watching instrument");
        Ok(())
    }

    /// Stop streaming `key`, dropping its buffered ticks and pipeline.
    ///
    /// Returns `false` if the key was not watched.
    pub async fn unwatch(&self, key: &SymbolKey) -> Result<bool, DataError> {
        let Some(watch) = self.inner.watches.lock().remove(key) else {
            return Ok(false);
        };

        watch.listener.unsubscribe();
        watch.subscription.close().await?;
        self.inner.store.remove(key);
        self.inner.flows.write().remove(key);
        self.inner.oi.lock().reset(key);

        info!(%key, "instrument unwatched");
        Ok(true)
    }

    pub fn watched(&self) -> Vec<SymbolKey> {
        let mut keys = self.inner.watches.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Snapshot of the pipeline for `key`.
    pub fn flow(&self, key: &SymbolKey) -> Option<InstrumentFlow> {
        self.with_flow(key, |flow| flow.clone())
    }

    pub fn with_flow<R>(&self, key: &SymbolKey, f: impl FnOnce(&InstrumentFlow) -> R) -> Option<R> {
        let flow = self.inner.flows.read().get(key).cloned()?;
        let flow = flow.lock();
        Some(f(&flow))
    }

    pub fn summary(&self, key: &SymbolKey) -> Option<FlowSummary> {
        self.with_flow(key, InstrumentFlow::summary)
    }

    /// Rebuild the derived models for `key` from a historical range of ticks.
    pub fn backfill(&self, key: &SymbolKey, ticks: &[Tick]) {
        let flow = self.flow_entry(key);
        flow.lock().backfill(ticks);
        debug!(%key, ticks = ticks.len(), "flow backfilled");
    }

    /// Merge footprint options, rebuilding from buffered ticks if bucketing changed.
    pub fn apply_footprint_options(&self, key: &SymbolKey, patch: FootprintOptionsPatch) {
        let flow = self.flow_entry(key);
        let mut flow = flow.lock();
        let max_bars = patch.max_bars;
        flow.footprint.apply_options(patch);
        if max_bars.is_some() {
            let max_points = Some(flow.footprint.options().max_bars);
            flow.delta.apply_options(DeltaOptionsPatch {
                max_points,
                ..DeltaOptionsPatch::default()
            });
        }

        if flow.footprint.rebuild_required() {
            let ticks = self.inner.store.ticks(key);
            flow.footprint.rebuild(&ticks);
            let points = delta_series(flow.footprint.bars());
            flow.delta.set_data(points);
        }
    }

    /// Classify an open-interest reading against the previous one for `key`.
    pub fn update_open_interest(&self, key: &SymbolKey, snapshot: OiSnapshot) -> Option<OiSignal> {
        let signal = self.inner.oi.lock().update(key, snapshot)?;
        if let Some(flow) = self.inner.flows.read().get(key) {
            flow.lock().oi_signal = Some(signal);
        }
        Some(signal)
    }

    /// Unwatch every key and stop the connection manager.
    pub async fn shutdown(&self) -> Result<(), DataError> {
        for key in self.watched() {
            self.unwatch(&key).await?;
        }
        self.inner.connection.shutdown().await
    }

    fn flow_entry(&self, key: &SymbolKey) -> Arc<Mutex<InstrumentFlow>> {
        if let Some(flow) = self.inner.flows.read().get(key) {
            return Arc::clone(flow);
        }
        let mut flows = self.inner.flows.write();
        Arc::clone(
            flows
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(InstrumentFlow::new(key.clone(), &self.inner.config)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{ConnectionConfig, state::ConnectionState},
        open_interest::OiSense,
        types::Side,
    };

    fn key() -> SymbolKey {
        SymbolKey::new("SBIN", "NSE")
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.footprint.tick_size = Some(0.5);
        config.power_trade.volume_threshold = 100.0;
        config
    }

    fn tick(time: i64, price: f64, volume: f64, side: Side) -> Tick {
        Tick::new(time, price, volume, side).unwrap()
    }

    fn offline_connection() -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig::parse("ws://127.0.0.1:1", "")
                .unwrap()
                .with_max_attempts(0),
        )
    }

    #[test]
    fn test_flow_on_tick_updates_every_model() {
        let mut flow = InstrumentFlow::new(key(), &config());

        assert!(flow.on_tick(&tick(1_000, 100.0, 40.0, Side::Buy)).is_none());
        assert!(flow.on_tick(&tick(2_000, 100.5, 20.0, Side::Sell)).is_none());
        let trade = flow.on_tick(&tick(61_000, 101.0, 50.0, Side::Buy)).unwrap();
        assert_eq!(trade.volume, 110.0);

        let summary = flow.summary();
        assert_eq!(summary.bars, 2);
        assert_eq!(summary.bar_time, Some(60_000));
        assert_eq!(summary.poc, Some(101.0));
        assert_eq!(summary.bar_delta, 50.0);
        assert_eq!(summary.cumulative_delta, 70.0);
        assert_eq!(summary.power_trades, 1);
        assert!(!summary.high_alert);
    }

    #[test]
    fn test_flow_backfill_matches_live() {
        let ticks = vec![
            tick(0, 100.0, 10.0, Side::Buy),
            tick(30_000, 99.5, 30.0, Side::Sell),
            tick(60_000, 100.0, 70.0, Side::Buy),
            tick(61_000, 100.5, 35.0, Side::Buy),
        ];

        let mut backfilled = InstrumentFlow::new(key(), &config());
        backfilled.backfill(&ticks);

        let mut live = InstrumentFlow::new(key(), &config());
        for tick in &ticks {
            live.on_tick(tick);
        }

        let backfilled_points = backfilled.delta.points().copied().collect::<Vec<_>>();
        let live_points = live.delta.points().copied().collect::<Vec<_>>();
        assert_eq!(backfilled_points, live_points);
        assert_eq!(backfilled.footprint.len(), live.footprint.len());
        assert_eq!(backfilled.power_trades.detector().history_len(), 1);

        backfilled.clear();
        assert!(backfilled.footprint.is_empty());
        assert!(backfilled.delta.is_empty());
    }

    #[tokio::test]
    async fn test_watch_feeds_flow_through_store() {
        let engine = OrderflowEngine::new(offline_connection(), config());
        let mut events = engine.events();

        engine.watch(key(), SubscriptionMode::Tick).unwrap();
        assert_eq!(engine.watched(), vec![key()]);

        engine.store().add_tick(&key(), tick(0, 100.0, 60.0, Side::Buy));
        engine.store().add_tick(&key(), tick(1, 100.0, 60.0, Side::Sell));

        let summary = engine.summary(&key()).unwrap();
        assert_eq!(summary.bars, 1);
        assert_eq!(summary.power_trades, 1);

        match events.try_recv().unwrap() {
            FlowEvent::PowerTrade { key: event_key, trade, .. } => {
                assert_eq!(event_key, key());
                assert_eq!(trade.volume, 120.0);
            }
        }

        // Watching again replaces rather than duplicates the listener
        engine.watch(key(), SubscriptionMode::Tick).unwrap();
        assert_eq!(engine.store().listener_count(&key()), 1);

        assert!(engine.unwatch(&key()).await.unwrap());
        assert!(!engine.unwatch(&key()).await.unwrap());
        assert!(engine.flow(&key()).is_none());
        assert_eq!(engine.store().len(&key()), 0);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rewatch_never_double_counts() {
        const TICKS: usize = 2_000;

        let engine = OrderflowEngine::new(offline_connection(), config());
        engine.watch(key(), SubscriptionMode::Tick).unwrap();

        let store = engine.store().clone();
        let producer = std::thread::spawn(move || {
            for i in 0..TICKS {
                store.add_tick(&key(), tick(i as i64, 100.0, 1.0, Side::Buy));
            }
        });
        while !producer.is_finished() {
            engine.watch(key(), SubscriptionMode::Tick).unwrap();
        }
        producer.join().unwrap();

        let flow = engine.flow(&key()).unwrap();
        assert_eq!(flow.footprint.latest().unwrap().trades(), TICKS as u64);
        assert_eq!(engine.store().listener_count(&key()), 1);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_footprint_options_rebuild_from_store() {
        let engine = OrderflowEngine::new(offline_connection(), config());
        engine.watch(key(), SubscriptionMode::Tick).unwrap();

        for (time, price) in [(0, 100.0), (30_000, 100.5), (60_000, 101.0)] {
            engine.store().add_tick(&key(), tick(time, price, 1.0, Side::Buy));
        }
        assert_eq!(engine.summary(&key()).unwrap().bars, 2);

        engine.apply_footprint_options(
            &key(),
            FootprintOptionsPatch {
                max_bars: Some(1),
                ..Default::default()
            },
        );
        let flow = engine.flow(&key()).unwrap();
        assert_eq!(flow.footprint.len(), 1);
        assert_eq!(flow.delta.len(), 1);
        assert_eq!(flow.delta.latest().unwrap().cumulative_delta, 3.0);

        engine.apply_footprint_options(
            &key(),
            FootprintOptionsPatch {
                interval_ms: Some(300_000),
                ..Default::default()
            },
        );

        let flow = engine.flow(&key()).unwrap();
        assert_eq!(flow.footprint.len(), 1);
        assert!(!flow.footprint.rebuild_required());
        assert_eq!(flow.delta.latest().unwrap().cumulative_delta, 3.0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_interest_signal_lands_in_flow() {
        let engine = OrderflowEngine::new(offline_connection(), config());
        engine.backfill(&key(), &[tick(0, 100.0, 1.0, Side::Buy)]);

        let snapshot = |price, open_interest| OiSnapshot {
            price,
            open_interest,
            time: None,
        };
        assert_eq!(engine.update_open_interest(&key(), snapshot(100.0, 1_000.0)), None);
        let signal = engine
            .update_open_interest(&key(), snapshot(95.0, 1_100.0))
            .unwrap();

        assert_eq!(signal.sense, OiSense::ShortBuildup);
        assert_eq!(engine.summary(&key()).unwrap().oi_signal, Some(signal));

        engine.shutdown().await.unwrap();
    }
}
