//! Contract between derived models and the rendering collaborators that draw them.
//!
//! Every overlay model (footprint, power trades, cumulative delta) exposes the same shape:
//! wholesale replacement, upsert by time key, option read/merge and reset. Overlays never
//! influence the host chart's price axis, so `autoscale_info` reports no effect.

/// Price range an overlay would like the host chart to include when autoscaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoscaleInfo {
    pub min_value: f64,
    pub max_value: f64,
}

pub trait SeriesModel {
    /// One element of the model, keyed by time
    type Point;
    /// Display configuration
    type Options;
    /// Partial display configuration merged by [`SeriesModel::apply_options`]
    type OptionsPatch;

    /// Replace the whole model.
    fn set_data(&mut self, data: Vec<Self::Point>);

    /// Insert a point, replacing any point with the same time key.
    fn upsert(&mut self, point: Self::Point);

    fn options(&self) -> &Self::Options;

    fn apply_options(&mut self, patch: Self::OptionsPatch);

    fn clear_data(&mut self);

    /// Always `None`: overlays never perturb the host chart's price scale.
    fn autoscale_info(&self) -> Option<AutoscaleInfo> {
        None
    }
}
