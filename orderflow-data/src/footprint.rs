//! Footprint aggregation: per-bar traded volume by price level, split by aggressor side.
//!
//! Prices are bucketed to the nearest multiple of a tick size and each bucket is keyed by its
//! integer tick index, so level lookups never compare floats. Bars are built either from a
//! historical range ([`FootprintAggregator::build_bars`]) or one tick at a time
//! ([`FootprintData::add_tick`]), which touches only the affected level, its two diagonal
//! neighbours and the point of control.

use crate::{
    aggregation::{align_to_bar, round_to_decimals, step_decimals},
    series::SeriesModel,
    types::{Side, Tick},
};
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Default imbalance ratio between a level and its diagonal counterpart.
pub const DEFAULT_IMBALANCE_RATIO: f64 = 3.0;

/// Default footprint bar interval (1 minute).
pub const DEFAULT_BAR_INTERVAL_MS: i64 = 60_000;

/// Default number of bars a chart series retains.
pub const DEFAULT_MAX_BARS: usize = 500;

/// Price buckets keyed by tick index.
pub type FootprintLevels = FnvHashMap<i64, FootprintLevel>;

/// Price-tiered tick size lookup: finer steps for low-priced instruments, coarser for
/// high-priced ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSizeTable {
    /// `(exclusive upper price bound, tick size)` in ascending bound order
    tiers: Vec<(f64, f64)>,
}

impl Default for TickSizeTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                (10.0, 0.01),
                (100.0, 0.05),
                (500.0, 0.1),
                (1_000.0, 0.25),
                (5_000.0, 0.5),
                (10_000.0, 1.0),
                (50_000.0, 5.0),
                (f64::INFINITY, 10.0),
            ],
        }
    }
}

impl TickSizeTable {
    /// Build a table from `(upper bound, tick size)` tiers. Tiers are sorted by bound and
    /// non-positive tick sizes are discarded.
    pub fn new(tiers: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let tiers = tiers
            .into_iter()
            .filter(|(bound, tick)| *tick > 0.0 && tick.is_finite() && !bound.is_nan())
            .sorted_by(|a, b| a.0.total_cmp(&b.0))
            .collect();
        Self { tiers }
    }

    pub fn tick_size_for(&self, price: f64) -> f64 {
        self.tiers
            .iter()
            .find(|(bound, _)| price < *bound)
            .or_else(|| self.tiers.last())
            .map(|(_, tick)| *tick)
            .unwrap_or(0.01)
    }
}

/// Largest bucket index magnitude; beyond 2^53 consecutive indices are no longer distinct
/// `f64` values.
pub const MAX_BUCKET_INDEX: i64 = 1 << 53;

/// Whether `tick_size` can bucket prices: finite and strictly positive.
#[inline]
pub fn is_valid_tick_size(tick_size: f64) -> bool {
    tick_size > 0.0 && tick_size.is_finite()
}

/// Tick index of the bucket nearest to `price` (half-way ties round away from zero).
///
/// Returns `None` for an unusable tick size or when the index falls outside
/// `±MAX_BUCKET_INDEX`.
#[inline]
pub fn bucket_index(price: f64, tick_size: f64) -> Option<i64> {
    if !is_valid_tick_size(tick_size) {
        return None;
    }
    let scaled = (price / tick_size).round();
    (scaled.is_finite() && scaled.abs() <= MAX_BUCKET_INDEX as f64).then(|| scaled as i64)
}

/// Price of a bucket, re-rounded to the tick size's precision so that rounding a price that
/// is already a multiple of the tick size returns that same price.
#[inline]
pub fn bucket_price(index: i64, tick_size: f64) -> f64 {
    round_to_decimals(index as f64 * tick_size, step_decimals(tick_size))
}

/// Round a price to the nearest multiple of `tick_size`. Prices that cannot be bucketed are
/// returned unchanged.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    bucket_index(price, tick_size)
        .map(|index| bucket_price(index, tick_size))
        .unwrap_or(price)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceConfig {
    /// One side must exceed `ratio ×` the comparison volume to be flagged
    pub ratio: f64,
    /// Never flag against a zero comparison volume
    pub ignore_zeros: bool,
}

impl Default for ImbalanceConfig {
    fn default() -> Self {
        Self {
            ratio: DEFAULT_IMBALANCE_RATIO,
            ignore_zeros: false,
        }
    }
}

impl ImbalanceConfig {
    fn exceeds(&self, volume: f64, comparison: f64) -> bool {
        if volume <= 0.0 {
            false
        } else if comparison <= 0.0 {
            !self.ignore_zeros
        } else {
            volume > self.ratio * comparison
        }
    }
}

/// Volume traded at one price bucket within one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintLevel {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub delta: f64,
    pub trades: u64,
    pub buy_trades: u64,
    pub sell_trades: u64,
    pub imbalance: Option<Side>,
}

impl FootprintLevel {
    pub fn new(price: f64) -> Self {
        Self {
            price,
            buy_volume: 0.0,
            sell_volume: 0.0,
            delta: 0.0,
            trades: 0,
            buy_trades: 0,
            sell_trades: 0,
            imbalance: None,
        }
    }

    pub fn add(&mut self, side: Side, volume: f64) {
        self.trades += 1;
        match side {
            Side::Buy => {
                self.buy_volume += volume;
                self.buy_trades += 1;
            }
            Side::Sell => {
                self.sell_volume += volume;
                self.sell_trades += 1;
            }
        }
        self.delta = self.buy_volume - self.sell_volume;
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }
}

/// Footprint of a single bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintData {
    /// Bar open time (ms)
    pub time: i64,
    pub levels: FootprintLevels,
    /// Price of the level with the greatest total volume (ties resolve to the lower price)
    pub poc: Option<f64>,
    pub tick_size: f64,
    /// Price of the last tick added, unbucketed
    pub close: Option<f64>,
    #[serde(skip)]
    poc_index: Option<i64>,
    #[serde(skip)]
    imbalance: ImbalanceConfig,
}

impl FootprintData {
    pub fn new(time: i64, tick_size: f64, imbalance: ImbalanceConfig) -> Self {
        Self {
            time,
            levels: FootprintLevels::default(),
            poc: None,
            tick_size,
            close: None,
            poc_index: None,
            imbalance,
        }
    }

    pub fn from_ticks<'a>(
        time: i64,
        ticks: impl IntoIterator<Item = &'a Tick>,
        tick_size: f64,
        imbalance: ImbalanceConfig,
    ) -> Self {
        let mut data = Self::new(time, tick_size, imbalance);
        for tick in ticks {
            data.add_tick(tick);
        }
        data
    }

    /// Fold one tick into the bar, returning `false` when its price cannot be bucketed.
    ///
    /// A bar created with an unusable tick size takes the default table's tier for the first
    /// traded price.
    pub fn add_tick(&mut self, tick: &Tick) -> bool {
        if !is_valid_tick_size(self.tick_size) {
            self.tick_size = TickSizeTable::default().tick_size_for(tick.price);
        }
        let tick_size = self.tick_size;
        let Some(index) = bucket_index(tick.price, tick_size) else {
            debug!(price = tick.price, tick_size, "price outside bucket range, tick skipped");
            return false;
        };

        let level = self
            .levels
            .entry(index)
            .or_insert_with(|| FootprintLevel::new(bucket_price(index, tick_size)));
        level.add(tick.side, tick.volume);
        let total = level.total_volume();

        self.close = Some(tick.price);
        self.update_poc(index, total);

        for neighbour in [index.checked_sub(1), Some(index), index.checked_add(1)]
            .into_iter()
            .flatten()
        {
            self.refresh_imbalance(neighbour);
        }
        true
    }

    fn update_poc(&mut self, index: i64, total: f64) {
        let replace = match self.poc_index {
            None => true,
            Some(current) if current == index => false,
            Some(current) => {
                let current_total = self
                    .levels
                    .get(&current)
                    .map(FootprintLevel::total_volume)
                    .unwrap_or(0.0);
                total > current_total || (total == current_total && index < current)
            }
        };

        if replace {
            self.poc_index = Some(index);
            self.poc = self.levels.get(&index).map(|level| level.price);
        }
    }

    /// Recompute the point of control from scratch.
    pub fn recalculate_poc(&mut self) {
        self.poc_index = self
            .levels
            .iter()
            .max_by(|(index_a, a), (index_b, b)| {
                a.total_volume()
                    .total_cmp(&b.total_volume())
                    .then_with(|| index_b.cmp(index_a))
            })
            .map(|(index, _)| *index);
        self.poc = self
            .poc_index
            .and_then(|index| self.levels.get(&index))
            .map(|level| level.price);
    }

    /// Recompute imbalance flags on every level, e.g. after the ratio changed.
    pub fn recalculate_imbalances(&mut self, imbalance: ImbalanceConfig) {
        self.imbalance = imbalance;
        let indices = self.levels.keys().copied().collect::<Vec<_>>();
        for index in indices {
            self.refresh_imbalance(index);
        }
    }

    fn refresh_imbalance(&mut self, index: i64) {
        let flag = imbalance_at(&self.levels, index, &self.imbalance);
        if let Some(level) = self.levels.get_mut(&index) {
            level.imbalance = flag;
        }
    }

    pub fn level(&self, price: f64) -> Option<&FootprintLevel> {
        bucket_index(price, self.tick_size).and_then(|index| self.levels.get(&index))
    }

    pub fn poc_level(&self) -> Option<&FootprintLevel> {
        self.poc_index.and_then(|index| self.levels.get(&index))
    }

    /// Levels ordered from the highest price to the lowest.
    pub fn levels_descending(&self) -> Vec<&FootprintLevel> {
        self.levels
            .iter()
            .sorted_by(|(a, _), (b, _)| b.cmp(a))
            .map(|(_, level)| level)
            .collect()
    }

    pub fn buy_volume(&self) -> f64 {
        self.levels.values().map(|level| level.buy_volume).sum()
    }

    pub fn sell_volume(&self) -> f64 {
        self.levels.values().map(|level| level.sell_volume).sum()
    }

    pub fn total_volume(&self) -> f64 {
        self.levels.values().map(FootprintLevel::total_volume).sum()
    }

    /// Bar delta: buy volume minus sell volume across all levels
    pub fn delta(&self) -> f64 {
        self.levels.values().map(|level| level.delta).sum()
    }

    pub fn trades(&self) -> u64 {
        self.levels.values().map(|level| level.trades).sum()
    }

    /// Highest bucketed price traded in the bar
    pub fn high(&self) -> Option<f64> {
        self.levels
            .keys()
            .max()
            .and_then(|index| self.levels.get(index))
            .map(|level| level.price)
    }

    /// Lowest bucketed price traded in the bar
    pub fn low(&self) -> Option<f64> {
        self.levels
            .keys()
            .min()
            .and_then(|index| self.levels.get(index))
            .map(|level| level.price)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Imbalance flag of the level at `index`.
///
/// Buying at P is compared with selling one step below, selling at P with buying one step
/// above. When the diagonal level does not exist the same level's opposite side is used.
fn imbalance_at(levels: &FootprintLevels, index: i64, config: &ImbalanceConfig) -> Option<Side> {
    let level = levels.get(&index)?;

    let buy_comparison = index
        .checked_sub(1)
        .and_then(|below| levels.get(&below))
        .map(|below| below.sell_volume)
        .unwrap_or(level.sell_volume);
    let sell_comparison = index
        .checked_add(1)
        .and_then(|above| levels.get(&above))
        .map(|above| above.buy_volume)
        .unwrap_or(level.buy_volume);

    let buy_imbalance = config.exceeds(level.buy_volume, buy_comparison);
    let sell_imbalance = config.exceeds(level.sell_volume, sell_comparison);

    match (buy_imbalance, sell_imbalance) {
        (true, false) => Some(Side::Buy),
        (false, true) => Some(Side::Sell),
        (true, true) if level.buy_volume >= level.sell_volume => Some(Side::Buy),
        (true, true) => Some(Side::Sell),
        (false, false) => None,
    }
}

/// Bucket a set of ticks into price levels using the default imbalance configuration.
///
/// An unusable `tick_size` falls back to the default table's tier for the first price.
pub fn aggregate<'a>(ticks: impl IntoIterator<Item = &'a Tick>, tick_size: f64) -> FootprintLevels {
    FootprintData::from_ticks(0, ticks, tick_size, ImbalanceConfig::default()).levels
}

/// Aggregation settings shared by historical and incremental footprint building.
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintAggregator {
    pub interval_ms: i64,
    /// Explicit tick size; when `None` the table decides from the first traded price
    pub tick_size: Option<f64>,
    pub table: TickSizeTable,
    pub imbalance: ImbalanceConfig,
}

impl Default for FootprintAggregator {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_BAR_INTERVAL_MS,
            tick_size: None,
            table: TickSizeTable::default(),
            imbalance: ImbalanceConfig::default(),
        }
    }
}

impl FootprintAggregator {
    pub fn resolve_tick_size(&self, reference_price: f64) -> f64 {
        self.tick_size
            .filter(|tick| is_valid_tick_size(*tick))
            .unwrap_or_else(|| self.table.tick_size_for(reference_price))
    }

    /// Bucket a set of ticks into levels with this aggregator's imbalance settings.
    pub fn aggregate<'a>(
        &self,
        ticks: impl IntoIterator<Item = &'a Tick>,
        tick_size: f64,
    ) -> FootprintLevels {
        FootprintData::from_ticks(0, ticks, tick_size, self.imbalance).levels
    }

    /// Build one footprint per bar from a time-ordered historical range.
    pub fn build_bars(&self, ticks: &[Tick]) -> Vec<FootprintData> {
        let Some(first) = ticks.first() else {
            return Vec::new();
        };
        let tick_size = self.resolve_tick_size(first.price);

        let chunks = ticks
            .iter()
            .chunk_by(|tick| align_to_bar(tick.time, self.interval_ms));

        let bars = chunks
            .into_iter()
            .map(|(time, bar_ticks)| {
                FootprintData::from_ticks(time, bar_ticks, tick_size, self.imbalance)
            })
            .collect();
        bars
    }
}

/// Display configuration for the footprint overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintOptions {
    pub aggregator: FootprintAggregator,
    pub show_poc: bool,
    pub show_imbalance: bool,
    /// Maximum number of bars retained (oldest evicted)
    pub max_bars: usize,
}

impl Default for FootprintOptions {
    fn default() -> Self {
        Self {
            aggregator: FootprintAggregator::default(),
            show_poc: true,
            show_imbalance: true,
            max_bars: DEFAULT_MAX_BARS,
        }
    }
}

/// Partial update for [`FootprintOptions`]; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintOptionsPatch {
    pub interval_ms: Option<i64>,
    pub tick_size: Option<Option<f64>>,
    pub imbalance_ratio: Option<f64>,
    pub ignore_zeros: Option<bool>,
    pub show_poc: Option<bool>,
    pub show_imbalance: Option<bool>,
    pub max_bars: Option<usize>,
}

/// Footprint model handed to the rendering collaborator, one [`FootprintData`] per bar.
#[derive(Debug, Clone, Default)]
pub struct FootprintSeries {
    bars: BTreeMap<i64, FootprintData>,
    options: FootprintOptions,
    tick_size: Option<f64>,
    rebuild_required: bool,
}

impl FootprintSeries {
    pub fn new(options: FootprintOptions) -> Self {
        Self {
            bars: BTreeMap::new(),
            options,
            tick_size: None,
            rebuild_required: false,
        }
    }

    /// Fold a live tick into its (possibly new) bar, returning the bar time.
    pub fn add_tick(&mut self, tick: &Tick) -> i64 {
        let aggregator = &self.options.aggregator;
        let tick_size = *self
            .tick_size
            .get_or_insert_with(|| aggregator.resolve_tick_size(tick.price));
        let time = align_to_bar(tick.time, aggregator.interval_ms);
        let imbalance = aggregator.imbalance;

        let bar = self
            .bars
            .entry(time)
            .or_insert_with(|| FootprintData::new(time, tick_size, imbalance));
        if !bar.add_tick(tick) && bar.is_empty() {
            self.bars.remove(&time);
        }

        self.evict();
        time
    }

    /// Replace every bar with footprints rebuilt from a historical range.
    pub fn rebuild(&mut self, ticks: &[Tick]) {
        let bars = self.options.aggregator.build_bars(ticks);
        self.rebuild_required = false;
        self.set_data(bars);
    }

    fn evict(&mut self) {
        while self.bars.len() > self.options.max_bars.max(1) {
            self.bars.pop_first();
        }
    }

    pub fn bars(&self) -> impl Iterator<Item = &FootprintData> {
        self.bars.values()
    }

    pub fn bar(&self, time: i64) -> Option<&FootprintData> {
        self.bars.get(&time)
    }

    pub fn latest(&self) -> Option<&FootprintData> {
        self.bars.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn tick_size(&self) -> Option<f64> {
        self.tick_size
    }

    /// Whether an option change invalidated the bars; cleared by [`FootprintSeries::rebuild`].
    pub fn rebuild_required(&self) -> bool {
        self.rebuild_required
    }
}

impl SeriesModel for FootprintSeries {
    type Point = FootprintData;
    type Options = FootprintOptions;
    type OptionsPatch = FootprintOptionsPatch;

    fn set_data(&mut self, data: Vec<FootprintData>) {
        self.bars = data.into_iter().map(|bar| (bar.time, bar)).collect();
        self.tick_size = self.bars.values().next().map(|bar| bar.tick_size);
        self.evict();
    }

    fn upsert(&mut self, point: FootprintData) {
        self.tick_size.get_or_insert(point.tick_size);
        self.bars.insert(point.time, point);
        self.evict();
    }

    fn options(&self) -> &FootprintOptions {
        &self.options
    }

    fn apply_options(&mut self, patch: FootprintOptionsPatch) {
        let previous = self.options.clone();
        let options = &mut self.options;

        if let Some(interval_ms) = patch.interval_ms.filter(|interval| *interval > 0) {
            options.aggregator.interval_ms = interval_ms;
        }
        if let Some(tick_size) = patch.tick_size {
            options.aggregator.tick_size = tick_size;
        }
        if let Some(ratio) = patch.imbalance_ratio.filter(|ratio| *ratio > 0.0) {
            options.aggregator.imbalance.ratio = ratio;
        }
        if let Some(ignore_zeros) = patch.ignore_zeros {
            options.aggregator.imbalance.ignore_zeros = ignore_zeros;
        }
        if let Some(show_poc) = patch.show_poc {
            options.show_poc = show_poc;
        }
        if let Some(show_imbalance) = patch.show_imbalance {
            options.show_imbalance = show_imbalance;
        }
        if let Some(max_bars) = patch.max_bars {
            options.max_bars = max_bars.max(1);
        }

        let bucketing_changed = previous.aggregator.interval_ms != options.aggregator.interval_ms
            || previous.aggregator.tick_size != options.aggregator.tick_size;

        if bucketing_changed {
            debug!(
                interval_ms = options.aggregator.interval_ms,
                tick_size = ?options.aggregator.tick_size,
                "footprint bucketing changed, bars require rebuild"
            );
            self.bars.clear();
            self.tick_size = None;
            self.rebuild_required = true;
        } else if previous.aggregator.imbalance != options.aggregator.imbalance {
            let imbalance = options.aggregator.imbalance;
            for bar in self.bars.values_mut() {
                bar.recalculate_imbalances(imbalance);
            }
        }

        self.evict();
    }

    fn clear_data(&mut self) {
        self.bars.clear();
        self.tick_size = None;
    }
}
