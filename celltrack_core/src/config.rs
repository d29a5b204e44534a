//! Tracker configuration.
//!
//! One flat parameter record covering every stage of the scan transition.
//! A copy is echoed into the persistent header so a restart can verify the
//! store was written under the same parameters before resuming.

use serde::{Deserialize, Serialize};

/// Forecast trend extraction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecastMode {
    /// Weighted linear trend per scalar
    Trend,
    /// Linear trend with growth damped parabolically over the growth period
    Parabolic,
    /// Trend, falling back to the empirical shape regression for volume
    /// when the volume trend is not monotonic
    Regression,
}

/// All tracking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Forecast extraction mode
    pub forecast_mode: ForecastMode,

    /// Regression weights per history slot, newest first. The length bounds
    /// the history ring.
    pub forecast_weights: Vec<f64>,

    /// Growth period for the parabolic mode (seconds)
    pub parabolic_growth_period: f64,

    /// Scale forecast rates by history length instead of the fixed
    /// two-scan damping
    pub scale_forecasts_by_history: bool,

    /// History length at which rates are fully trusted (seconds), when
    /// scaling by history
    pub history_for_scaling: f64,

    /// Zero out positive rates of size-like scalars
    pub zero_growth: bool,
    /// Zero out negative rates of size-like scalars
    pub zero_decay: bool,

    /// Maximum time gap between matched scans (seconds); a longer gap
    /// degrades to all-births
    pub max_delta_time: i64,

    /// Candidate edges need fraction_prev + fraction_current above this
    pub min_sum_fraction_overlap: f64,

    /// Use run-length footprints for overlap rasters when present
    pub use_runs_for_overlaps: bool,

    /// Maximum parents per current-scan cell
    pub max_parents: usize,
    /// Maximum children per previous-scan cell
    pub max_children: usize,

    /// Residual assignment: weight on centroid distance (per km)
    pub weight_distance: f64,
    /// Residual assignment: weight on |Δ volume^(1/3)|
    pub weight_delta_cube_root_volume: f64,
    /// Maximum plausible cell speed (km/hr); faster pairings are infeasible
    pub max_speed: f64,

    /// History needed before a forecast is considered valid (seconds)
    pub min_history_for_valid_forecast: i64,
    /// Smoothed speed above this invalidates the forecast (km/hr)
    pub max_speed_for_valid_forecast: f64,

    /// Scans of history before the motion-feasibility gate applies in
    /// residual assignment
    pub min_history_for_motion_gate: usize,

    /// Smooth motion vectors across nearby cells
    pub spatial_smoothing: bool,
    /// Radius of influence for spatial smoothing (km)
    pub smoothing_radius: f64,
    /// Minimum cells within the radius before smoothing applies
    pub smoothing_min_cells: usize,
    /// Below-history-gate cells borrow the neighbourhood mean motion
    /// instead of keeping their own unsmoothed vector
    pub smooth_invalid_forecasts: bool,
    /// Replace motion of cells growing/decaying past the thresholds below
    pub smooth_fast_growth_decay: bool,
    /// Area change ratio at or above which growth smoothing kicks in
    pub smoothing_growth_threshold: f64,
    /// Area change ratio at or below which decay smoothing kicks in
    pub smoothing_decay_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            forecast_mode: ForecastMode::Trend,
            forecast_weights: vec![1.0, 1.0, 1.0, 0.5, 0.5],
            parabolic_growth_period: 1800.0,
            scale_forecasts_by_history: false,
            history_for_scaling: 1200.0,
            zero_growth: false,
            zero_decay: false,
            max_delta_time: 1200,
            min_sum_fraction_overlap: 0.3,
            use_runs_for_overlaps: false,
            max_parents: 8,
            max_children: 8,
            weight_distance: 1.0,
            weight_delta_cube_root_volume: 1.0,
            max_speed: 100.0,
            min_history_for_valid_forecast: 900,
            max_speed_for_valid_forecast: 200.0,
            min_history_for_motion_gate: 5,
            spatial_smoothing: false,
            smoothing_radius: 50.0,
            smoothing_min_cells: 2,
            smooth_invalid_forecasts: false,
            smooth_fast_growth_decay: false,
            smoothing_growth_threshold: 0.5,
            smoothing_decay_threshold: -0.5,
        }
    }
}

impl TrackerConfig {
    /// Capacity of the per-lineage history ring.
    pub fn history_capacity(&self) -> usize {
        self.forecast_weights.len()
    }
}
