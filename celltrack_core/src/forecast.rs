//! The forecast engine.
//!
//! Per-lineage rates of change are extracted from the bounded history ring
//! by weighted linear regression against elapsed time. Size-like scalars
//! can be clamped against growth or decay, and in regression mode the
//! volume rate falls back to an empirical fit against shape descriptors
//! when the recent volume trend is not monotonic. Motion vectors are then
//! optionally smoothed across nearby cells.

use tracing::debug;

use crate::config::{ForecastMode, TrackerConfig};
use crate::lineage::{ScalarField, TrackState};
use crate::scan::Cell;

/// Scans over which the volume trend must be monotonic for the plain trend
/// to be trusted in regression mode.
const MONOTONIC_SCANS: usize = 4;

/// Degrees per radian.
const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;

// ============================================================================
// PER-CELL FORECAST
// ============================================================================

/// Computes the forecast rates for one cell's lineage.
pub fn compute_forecast(cell: &mut Cell, config: &TrackerConfig) {
    let object_top = cell.object.top;
    let ht_of_intensity_max = cell.object.ht_of_intensity_max;
    let intensity_p98 = cell.object.intensity_p98;
    let current = cell.current;

    let Some(track) = cell.track.as_mut() else {
        return;
    };

    set_area_change_ratio(track);

    track.forecast_valid = track.history_in_secs >= config.min_history_for_valid_forecast;

    // No rates without history.
    if track.history_in_scans <= 1 {
        return;
    }

    // Damp rates of young tracks: either proportionally to accumulated
    // history, or with the fixed two-scan factor.
    let forecast_scale = if config.scale_forecasts_by_history {
        (track.history_in_secs as f64 / config.history_for_scaling).min(1.0)
    } else if track.history_in_scans > 2 {
        1.0
    } else {
        0.1
    };

    match config.forecast_mode {
        ForecastMode::Trend | ForecastMode::Parabolic => {
            trend_forecast(track, &current, config, forecast_scale);
        }
        ForecastMode::Regression => {
            if volume_trend_monotonic(track) {
                trend_forecast(track, &current, config, forecast_scale);
            } else {
                regression_forecast(
                    track,
                    &current,
                    object_top,
                    ht_of_intensity_max,
                    intensity_p98,
                    config,
                    forecast_scale,
                );
            }
        }
    }
}

/// `(a2 - a1) / a1` over the two newest history entries.
fn set_area_change_ratio(track: &mut TrackState) {
    let mut ratio = 0.0;
    if track.history.len() > 1 {
        let a2 = track.history[0].area;
        let a1 = track.history[1].area;
        if a1 != 0.0 {
            ratio = (a2 - a1) / a1;
        }
    }
    track.area_change_ratio = ratio;
}

/// Weighted linear trend of one scalar, in units per hour, written into the
/// track's rates.
fn get_trend(
    track: &mut TrackState,
    field: ScalarField,
    config: &TrackerConfig,
    forecast_scale: f64,
) {
    let weights = &config.forecast_weights;
    let nhist = track.history.len().min(weights.len());
    if nhist < 2 {
        field.set_rate(&mut track.rates, 0.0);
        return;
    }

    let start_time = track.history[nhist - 1].time_secs as f64;

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_w = 0.0;
    for i in 0..nhist {
        let w = weights[i];
        let y = field.value(&track.history[i]);
        let x = track.history[i].time_secs as f64 - start_time;
        sum_x += x * w;
        sum_y += y * w;
        sum_xx += x * x * w;
        sum_xy += x * y * w;
        sum_w += w;
    }

    let num = sum_w * sum_xy - sum_x * sum_y;
    let denom = sum_w * sum_xx - sum_x * sum_x;

    let mut dval_dt = if denom != 0.0 { (num / denom) * 3600.0 } else { 0.0 };

    if field.clamps_apply() {
        if config.zero_growth && dval_dt > 0.0 {
            dval_dt = 0.0;
        }
        if config.zero_decay && dval_dt < 0.0 {
            dval_dt = 0.0;
        }
    }

    field.set_rate(&mut track.rates, dval_dt * forecast_scale);
}

/// Trend forecast for every scalar, with mass and area re-derived from the
/// volume rate so 3D and 2D stay consistent.
fn trend_forecast(
    track: &mut TrackState,
    current: &crate::lineage::CellProps,
    config: &TrackerConfig,
    forecast_scale: f64,
) {
    for field in ScalarField::ALL {
        get_trend(track, field, config, forecast_scale);
    }
    derive_dependents(track, current, track.rates.volume / nonzero(current.volume));
}

/// Empirical regression forecast for volume when the trend is unusable,
/// fit against the echo-top, the strong-echo height and the 98th-percentile
/// intensity.
fn regression_forecast(
    track: &mut TrackState,
    current: &crate::lineage::CellProps,
    top: f64,
    ht_of_intensity_max: f64,
    intensity_p98: f64,
    config: &TrackerConfig,
    forecast_scale: f64,
) {
    for field in ScalarField::ALL {
        get_trend(track, field, config, forecast_scale);
    }

    let mut nf = 0.0;
    let f1 = if top >= 5.0 {
        nf += 1.0;
        -0.441 + 3.88 * (-0.370 * top).exp()
    } else {
        0.0
    };
    let f2 = if ht_of_intensity_max >= 5.0 {
        nf += 1.0;
        -0.772 + 0.036 * ht_of_intensity_max
    } else {
        0.0
    };
    nf += 1.0;
    let f3 = -0.571 + 430.0 * (-0.168 * intensity_p98).exp();

    let normalized_dvol_dt = (f1 + f2 + f3) / nf;

    track.rates.volume = normalized_dvol_dt * current.volume * forecast_scale;
    derive_dependents(track, current, normalized_dvol_dt * forecast_scale);
}

/// Re-derives mass and area from the (normalized) volume rate; area uses
/// the 2/3 power to map a 3D change onto 2D.
fn derive_dependents(
    track: &mut TrackState,
    current: &crate::lineage::CellProps,
    normalized_dvol_dt: f64,
) {
    let normalized_darea_dt = if normalized_dvol_dt >= 0.0 {
        normalized_dvol_dt.powf(2.0 / 3.0)
    } else {
        -normalized_dvol_dt.abs().powf(2.0 / 3.0)
    };
    track.rates.mass = current.mass * normalized_dvol_dt;
    track.rates.area = current.area * normalized_darea_dt;
}

fn nonzero(v: f64) -> f64 {
    if v == 0.0 {
        1.0
    } else {
        v
    }
}

/// Is the volume trend monotonic over the most recent window?
fn volume_trend_monotonic(track: &TrackState) -> bool {
    let nhist = track.history.len().min(MONOTONIC_SCANS);
    if nhist < 2 {
        return false;
    }
    let mut increasing = false;
    for i in 0..nhist - 1 {
        let rising = track.history[i].volume - track.history[i + 1].volume >= 0.0;
        if i == 0 {
            increasing = rising;
        } else if rising != increasing {
            return false;
        }
    }
    true
}

/// Delta of a scalar over `dt_secs`, with positive (growth) rates damped
/// parabolically over the configured growth period: growth follows
/// `r·t·(1 − t/2P)` and holds at its peak beyond `P`. Decay stays linear.
pub fn parabolic_delta(rate_per_hour: f64, dt_secs: f64, growth_period_secs: f64) -> f64 {
    let dt_hours = dt_secs / 3600.0;
    if rate_per_hour <= 0.0 || growth_period_secs <= 0.0 {
        return rate_per_hour * dt_hours;
    }
    let t = dt_secs.min(growth_period_secs);
    rate_per_hour * t * (1.0 - t / (2.0 * growth_period_secs)) / 3600.0
}

// ============================================================================
// SPEED, DIRECTION AND SPATIAL SMOOTHING
// ============================================================================

/// Computes smoothed motion, speed and direction for all cells of one scan.
///
/// Each cell's motion rate is first copied into its smoothed slot; if any
/// smoothing pass is enabled the smoothed slots are replaced by
/// neighbourhood means and speed/direction recomputed from them.
pub fn compute_speed_and_dirn(cells: &mut [Cell], config: &TrackerConfig) {
    for cell in cells.iter_mut() {
        if let Some(track) = cell.track.as_mut() {
            track.rates.smoothed_dx = track.rates.centroid_x;
            track.rates.smoothed_dy = track.rates.centroid_y;
            track.smoothed_history_secs = track.history_in_secs as f64;
        }
    }

    load_speed_and_dirn(cells, config);

    if config.spatial_smoothing || config.smooth_invalid_forecasts || config.smooth_fast_growth_decay
    {
        smooth_spatial_forecasts(cells, config);
        load_speed_and_dirn(cells, config);
    }
}

/// Speed (km/hr) and direction (degrees clockwise from grid north) of a
/// motion vector.
pub fn motion_speed_and_dirn(dx_dt: f64, dy_dt: f64) -> (f64, f64) {
    let speed = (dx_dt * dx_dt + dy_dt * dy_dt).sqrt();
    let mut dirn = 0.0;
    if dx_dt != 0.0 || dy_dt != 0.0 {
        dirn = dx_dt.atan2(dy_dt) * RAD_TO_DEG;
    }
    if dirn < 0.0 {
        dirn += 360.0;
    }
    (speed, dirn)
}

fn load_speed_and_dirn(cells: &mut [Cell], config: &TrackerConfig) {
    for cell in cells.iter_mut() {
        let Some(track) = cell.track.as_mut() else {
            continue;
        };
        let (speed, dirn) =
            motion_speed_and_dirn(track.rates.smoothed_dx, track.rates.smoothed_dy);
        track.rates.smoothed_speed = speed;
        track.rates.smoothed_direction = dirn;
        if speed > config.max_speed_for_valid_forecast {
            track.forecast_valid = false;
        }
    }
}

/// Pairwise distances between cells, `-1.0` where a pair is outside the
/// smoothing radius or the peer fails the minimum-history gate. The
/// diagonal is `0.0` only for cells that pass the gate themselves.
fn load_distance_array(cells: &[Cell], config: &TrackerConfig) -> Vec<Vec<f64>> {
    let n = cells.len();
    let mut distances = vec![vec![-1.0; n]; n];

    let gate = |cell: &Cell| -> bool {
        cell.track
            .as_ref()
            .map(|t| t.history_in_secs >= config.min_history_for_valid_forecast)
            .unwrap_or(false)
    };

    for i in 0..n {
        if gate(&cells[i]) {
            distances[i][i] = 0.0;
        }
        for j in (i + 1)..n {
            let dx = cells[i].current.centroid_x - cells[j].current.centroid_x;
            let dy = cells[i].current.centroid_y - cells[j].current.centroid_y;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance < config.smoothing_radius {
                if gate(&cells[j]) {
                    distances[i][j] = distance;
                }
                if gate(&cells[i]) {
                    distances[j][i] = distance;
                }
            }
        }
    }
    distances
}

fn smooth_spatial_forecasts(cells: &mut [Cell], config: &TrackerConfig) {
    let distances = load_distance_array(cells, config);

    for i in 0..cells.len() {
        let Some(track) = cells[i].track.as_ref() else {
            continue;
        };

        if config.smooth_fast_growth_decay
            && (track.area_change_ratio >= config.smoothing_growth_threshold
                || track.area_change_ratio <= config.smoothing_decay_threshold)
        {
            debug!(
                cell = i,
                ratio = track.area_change_ratio,
                "smoothing fast growth/decay cell"
            );
            smooth_motion(cells, i, &distances, config, true, true);
            continue;
        }

        if config.smooth_invalid_forecasts && !track.forecast_valid {
            smooth_motion(cells, i, &distances, config, true, false);
            continue;
        }

        if config.spatial_smoothing && track.forecast_valid {
            smooth_motion(cells, i, &distances, config, false, false);
        }
    }

    // Maturity borrowed from the neighbourhood becomes the working history.
    for cell in cells.iter_mut() {
        if let Some(track) = cell.track.as_mut() {
            track.history_in_secs = (track.smoothed_history_secs + 0.5) as i64;
        }
    }
}

/// Replaces one cell's motion with the inverse-distance-weighted mean of
/// its neighbourhood.
///
/// With `ignore_self` the cell's own vector carries zero weight (used for
/// invalid or erratically growing cells). With `history_override` the
/// history ring's positions are rewritten backwards from the newest point
/// using the smoothed motion, so later trend fits see the smoothed path.
fn smooth_motion(
    cells: &mut [Cell],
    istorm: usize,
    distances: &[Vec<f64>],
    config: &TrackerConfig,
    ignore_self: bool,
    history_override: bool,
) {
    let mut sum_dx = 0.0;
    let mut sum_dy = 0.0;
    let mut sum_history = 0.0;
    let mut sum_weights = 0.0;
    let mut n_close = 0;

    for (j, cell) in cells.iter().enumerate() {
        let distance = distances[istorm][j];
        if istorm != j && distance < 0.0 {
            continue;
        }
        if ignore_self && istorm == j {
            continue;
        }
        let Some(track) = cell.track.as_ref() else {
            continue;
        };

        n_close += 1;
        let weight = 1.0 - distance.max(0.0) / config.smoothing_radius;
        sum_dx += track.rates.centroid_x * weight;
        sum_dy += track.rates.centroid_y * weight;
        sum_history += track.history_in_secs as f64 * weight;
        sum_weights += weight;
    }

    if n_close < config.smoothing_min_cells || sum_weights == 0.0 {
        debug!(cell = istorm, n_close, "too few cells within smoothing radius");
        return;
    }

    let mean_dx = sum_dx / sum_weights;
    let mean_dy = sum_dy / sum_weights;
    let mean_history = sum_history / sum_weights;

    let Some(track) = cells[istorm].track.as_mut() else {
        return;
    };
    track.rates.smoothed_dx = mean_dx;
    track.rates.smoothed_dy = mean_dy;
    track.smoothed_history_secs = mean_history;

    if history_override && !track.history.is_empty() {
        let latest_time = track.history[0].time_secs;
        let latest_x = track.history[0].centroid_x;
        let latest_y = track.history[0].centroid_y;
        for k in 1..track.history.len() {
            let dh = (latest_time - track.history[k].time_secs) as f64 / 3600.0;
            track.history[k].centroid_x = latest_x - mean_dx * dh;
            track.history[k].centroid_y = latest_y - mean_dy * dh;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
