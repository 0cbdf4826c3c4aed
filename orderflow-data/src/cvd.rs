//! Delta and cumulative delta (CVD) over footprint bars.

use crate::{
    footprint::{DEFAULT_MAX_BARS, FootprintData, FootprintLevel},
    series::SeriesModel,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of trailing bars compared by [`divergence`].
pub const DEFAULT_DIVERGENCE_LOOKBACK: usize = 20;

/// Buy volume minus sell volume at one level.
pub fn delta(level: &FootprintLevel) -> f64 {
    level.buy_volume - level.sell_volume
}

/// Running sum of `deltas`, seeded at zero.
pub fn cumulative_delta(deltas: impl IntoIterator<Item = f64>) -> Vec<f64> {
    deltas
        .into_iter()
        .scan(0.0, |total, delta| {
            *total += delta;
            Some(*total)
        })
        .collect()
}

/// One bar of the cumulative delta series.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DeltaPoint {
    pub time: i64,
    pub delta: f64,
    pub cumulative_delta: f64,
    /// Last traded price of the bar
    pub close: Option<f64>,
}

/// Build the delta series for a set of bars, ordered by bar time.
pub fn delta_series<'a>(bars: impl IntoIterator<Item = &'a FootprintData>) -> Vec<DeltaPoint> {
    let bars = bars
        .into_iter()
        .sorted_by_key(|bar| bar.time)
        .collect::<Vec<_>>();
    let totals = cumulative_delta(bars.iter().map(|bar| bar.delta()));

    bars.into_iter()
        .zip(totals)
        .map(|(bar, cumulative_delta)| DeltaPoint {
            time: bar.time,
            delta: bar.delta(),
            cumulative_delta,
            close: bar.close,
        })
        .collect()
}

/// Relationship between the price trend and the cumulative delta trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum DivergenceSignal {
    /// Price falling while CVD rises
    Bullish,
    /// Price rising while CVD falls
    Bearish,
    Aligned,
    Neutral,
    #[default]
    Unknown,
}

/// Minimum moves counted as a trend by [`divergence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceThresholds {
    /// Price move as a percentage of the latest close
    pub price_pct: f64,
    /// Absolute cumulative delta move
    pub cvd: f64,
}

impl Default for DivergenceThresholds {
    fn default() -> Self {
        Self {
            price_pct: 0.05,
            cvd: 0.0,
        }
    }
}

/// Compare price and CVD trends over the trailing `lookback` points.
///
/// Points without a close are skipped; fewer than two usable points is `Unknown`.
pub fn divergence(
    points: &[DeltaPoint],
    lookback: usize,
    thresholds: DivergenceThresholds,
) -> DivergenceSignal {
    let window = points
        .iter()
        .filter_map(|point| point.close.map(|close| (close, point.cumulative_delta)))
        .collect::<Vec<_>>();
    let window = &window[window.len().saturating_sub(lookback.max(2))..];

    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return DivergenceSignal::Unknown;
    };
    if window.len() < 2 {
        return DivergenceSignal::Unknown;
    }

    let price_trend = last.0 - first.0;
    let cvd_trend = last.1 - first.1;
    let price_threshold = last.0 * thresholds.price_pct / 100.0;

    let price_up = price_trend > price_threshold;
    let price_down = price_trend < -price_threshold;
    let cvd_up = cvd_trend > thresholds.cvd;
    let cvd_down = cvd_trend < -thresholds.cvd;

    match (price_up, price_down, cvd_up, cvd_down) {
        (false, true, true, false) => DivergenceSignal::Bullish,
        (true, false, false, true) => DivergenceSignal::Bearish,
        (true, false, true, false) => DivergenceSignal::Aligned,
        (false, true, false, true) => DivergenceSignal::Aligned,
        _ => DivergenceSignal::Neutral,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaOptions {
    pub divergence_lookback: usize,
    pub thresholds: DivergenceThresholds,
    pub show_divergence: bool,
    /// Maximum number of points retained (oldest evicted)
    pub max_points: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            divergence_lookback: DEFAULT_DIVERGENCE_LOOKBACK,
            thresholds: DivergenceThresholds::default(),
            show_divergence: true,
            max_points: DEFAULT_MAX_BARS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeltaOptionsPatch {
    pub divergence_lookback: Option<usize>,
    pub price_threshold_pct: Option<f64>,
    pub cvd_threshold: Option<f64>,
    pub show_divergence: Option<bool>,
    pub max_points: Option<usize>,
}

/// Cumulative delta model handed to the rendering collaborator.
///
/// Points are keyed by bar time. The cumulative column is always derived from the per-bar
/// deltas, whatever cumulative values the caller supplied. Evicted points keep contributing
/// to the cumulative values of the points that remain.
#[derive(Debug, Clone, Default)]
pub struct DeltaSeries {
    points: BTreeMap<i64, DeltaPoint>,
    options: DeltaOptions,
    /// Cumulative delta of every evicted point
    evicted_total: f64,
    /// Time of the newest evicted point
    evicted_until: Option<i64>,
}

impl DeltaSeries {
    pub fn new(options: DeltaOptions) -> Self {
        Self {
            points: BTreeMap::new(),
            options,
            evicted_total: 0.0,
            evicted_until: None,
        }
    }

    /// Upsert the point for a (possibly still open) footprint bar.
    pub fn update_from_bar(&mut self, bar: &FootprintData) {
        self.upsert(DeltaPoint {
            time: bar.time,
            delta: bar.delta(),
            cumulative_delta: 0.0,
            close: bar.close,
        });
    }

    pub fn points(&self) -> impl Iterator<Item = &DeltaPoint> {
        self.points.values()
    }

    pub fn latest(&self) -> Option<&DeltaPoint> {
        self.points.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn divergence(&self) -> DivergenceSignal {
        if !self.options.show_divergence {
            return DivergenceSignal::Unknown;
        }
        let points = self.points.values().copied().collect::<Vec<_>>();
        divergence(
            &points,
            self.options.divergence_lookback,
            self.options.thresholds,
        )
    }

    /// Recompute cumulative values from `time` onwards.
    fn accumulate_from(&mut self, time: i64) {
        let mut total = self
            .points
            .range(..time)
            .next_back()
            .map(|(_, point)| point.cumulative_delta)
            .unwrap_or(self.evicted_total);

        for point in self.points.range_mut(time..).map(|(_, point)| point) {
            total += point.delta;
            point.cumulative_delta = total;
        }
    }

    fn evict(&mut self) {
        while self.points.len() > self.options.max_points.max(1) {
            if let Some((time, point)) = self.points.pop_first() {
                self.evicted_total = point.cumulative_delta;
                self.evicted_until = Some(time);
            }
        }
    }
}

impl SeriesModel for DeltaSeries {
    type Point = DeltaPoint;
    type Options = DeltaOptions;
    type OptionsPatch = DeltaOptionsPatch;

    fn set_data(&mut self, data: Vec<DeltaPoint>) {
        self.points = data.into_iter().map(|point| (point.time, point)).collect();
        self.evicted_total = 0.0;
        self.evicted_until = None;
        self.accumulate_from(i64::MIN);
        self.evict();
    }

    fn upsert(&mut self, point: DeltaPoint) {
        let time = point.time;
        // Bars at or before the eviction horizon are already folded into the evicted total
        if self.evicted_until.is_some_and(|until| time <= until) {
            return;
        }
        self.points.insert(time, point);
        self.accumulate_from(time);
        self.evict();
    }

    fn options(&self) -> &DeltaOptions {
        &self.options
    }

    fn apply_options(&mut self, patch: DeltaOptionsPatch) {
        if let Some(lookback) = patch.divergence_lookback {
            self.options.divergence_lookback = lookback.max(2);
        }
        if let Some(pct) = patch.price_threshold_pct.filter(|v| v.is_finite() && *v >= 0.0) {
            self.options.thresholds.price_pct = pct;
        }
        if let Some(cvd) = patch.cvd_threshold.filter(|v| v.is_finite() && *v >= 0.0) {
            self.options.thresholds.cvd = cvd;
        }
        if let Some(show_divergence) = patch.show_divergence {
            self.options.show_divergence = show_divergence;
        }
        if let Some(max_points) = patch.max_points {
            self.options.max_points = max_points.max(1);
            self.evict();
        }
    }

    fn clear_data(&mut self) {
        self.points.clear();
        self.evicted_total = 0.0;
        self.evicted_until = None;
    }
}
