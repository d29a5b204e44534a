//! The bounds projector.
//!
//! Each previous-scan cell's shape is extrapolated to the current scan time
//! using its lineage's forecast: the centroid moves with the motion rates,
//! and the area change is converted to an isotropic length ratio applied to
//! every boundary ray. The projected bounding box becomes the cell's
//! overlap-candidate box, and the forecast point and ratio are stored on
//! the track for the overlap matcher and the later speed gating.

use celltrack_env::{GridBox, GridGeom};

use crate::config::{ForecastMode, TrackerConfig};
use crate::forecast::parabolic_delta;
use crate::scan::Cell;

/// Projects every previous-scan cell forward by `dt_hours`; current-scan
/// cells keep their real bounding box.
pub fn project_bounds(
    prev: &mut [Cell],
    curr: &mut [Cell],
    grid: &GridGeom,
    dt_hours: f64,
    config: &TrackerConfig,
) {
    for cell in prev.iter_mut() {
        let current = cell.current;
        let bbox = cell.object.bbox;

        let Some(track) = cell.track.as_mut() else {
            continue;
        };

        let dx_dt = track.rates.centroid_x;
        let dy_dt = track.rates.centroid_y;

        let forecast_x = current.centroid_x + dx_dt * dt_hours;
        let forecast_y = current.centroid_y + dy_dt * dt_hours;

        let darea = match config.forecast_mode {
            ForecastMode::Parabolic => {
                parabolic_delta(track.rates.area, dt_hours * 3600.0, config.parabolic_growth_period)
            }
            _ => track.rates.area * dt_hours,
        };
        // The projected area never collapses below one area unit.
        let forecast_area = (current.area + darea).max(1.0);

        let length_ratio = if current.area > 0.0 {
            (forecast_area / current.area).sqrt()
        } else {
            1.0
        };

        // Scale the box corners about the current centroid, then translate
        // to the forecast point.
        let current_minx = grid.x_for_col(bbox.min_ix) - 0.5 * grid.dx;
        let current_miny = grid.y_for_row(bbox.min_iy) - 0.5 * grid.dy;
        let current_maxx = grid.x_for_col(bbox.max_ix) + 0.5 * grid.dx;
        let current_maxy = grid.y_for_row(bbox.max_iy) + 0.5 * grid.dy;

        let fcast_minx = forecast_x - (current.centroid_x - current_minx) * length_ratio;
        let fcast_miny = forecast_y - (current.centroid_y - current_miny) * length_ratio;
        let fcast_maxx = forecast_x - (current.centroid_x - current_maxx) * length_ratio;
        let fcast_maxy = forecast_y - (current.centroid_y - current_maxy) * length_ratio;

        cell.box_for_overlap = GridBox {
            min_ix: grid.col_for_x(fcast_minx),
            min_iy: grid.row_for_y(fcast_miny),
            max_ix: grid.col_for_x(fcast_maxx),
            max_iy: grid.row_for_y(fcast_maxy),
        };

        track.forecast_x = forecast_x;
        track.forecast_y = forecast_y;
        track.forecast_area = forecast_area;
        track.forecast_length_ratio = length_ratio;
    }

    for cell in curr.iter_mut() {
        cell.box_for_overlap = cell.object.bbox;
    }
}
