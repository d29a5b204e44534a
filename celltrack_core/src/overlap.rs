//! The overlap matcher.
//!
//! For every (previous cell, current cell) pair whose candidate boxes
//! intersect, both footprints are rendered into a shared raster — the
//! previous one projected forward with its forecast — and the symmetric
//! overlap fractions decide whether a candidate edge is recorded.
//!
//! All comparisons use the *sum* of the two fractions, never either alone:
//! a small cell fully engulfed by a huge predicted shape still matches when
//! its own fraction compensates.

use celltrack_env::GridGeom;
use tracing::trace;

use crate::config::TrackerConfig;
use crate::lineage::Edge;
use crate::raster::{rays_to_vertices, OverlapRaster, LAYER_CURRENT, LAYER_PREV};
use crate::scan::Cell;
use crate::store::TrackStore;

/// Finds overlap-based candidate edges between the two scans, recording
/// them symmetrically on both cells' working status.
pub fn find_overlaps(
    store: &TrackStore,
    prev: &mut [Cell],
    curr: &mut [Cell],
    grid: &GridGeom,
    config: &TrackerConfig,
) {
    for i in 0..prev.len() {
        // Edge metadata describes the existing (previous) lineage.
        let (group, group_size) = match prev[i].track.as_ref() {
            Some(track) => {
                let size = store
                    .get_group(track.group)
                    .map(|g| g.members.len())
                    .unwrap_or(1);
                (track.group, size)
            }
            None => continue,
        };

        for j in 0..curr.len() {
            if !prev[i].box_for_overlap.intersects(&curr[j].box_for_overlap) {
                continue;
            }

            let overlap_area = overlap_area(&prev[i], &curr[j], grid, config);
            if overlap_area <= 0.0 {
                continue;
            }

            let area_prev = raster_area_prev(&prev[i], grid, config);
            let area_curr = raster_area_curr(&curr[j], grid, config);
            if area_prev <= 0.0 || area_curr <= 0.0 {
                continue;
            }

            let sum_fraction = overlap_area / area_prev + overlap_area / area_curr;
            trace!(prev = i, curr = j, overlap_area, sum_fraction, "overlap candidate");
            if sum_fraction <= config.min_sum_fraction_overlap {
                continue;
            }

            prev[i].status.add_edge(Edge { peer: j, overlap: overlap_area, group, group_size });
            curr[j].status.add_edge(Edge { peer: i, overlap: overlap_area, group, group_size });
        }
    }
}

/// Rasterizes the projected-previous and current footprints over their
/// shared frame and returns the overlap area (km²).
fn overlap_area(prev: &Cell, curr: &Cell, grid: &GridGeom, config: &TrackerConfig) -> f64 {
    let frame = prev.box_for_overlap.union(&curr.box_for_overlap);
    let mut raster = OverlapRaster::new(frame);

    fill_prev(&mut raster, prev, grid, config);
    fill_curr(&mut raster, curr, grid, config);

    raster.counts().n_both as f64 * grid.cell_area()
}

/// Renders the previous cell's footprint at its forecast position.
fn fill_prev(raster: &mut OverlapRaster, prev: &Cell, grid: &GridGeom, config: &TrackerConfig) {
    let Some(track) = prev.track.as_ref() else {
        return;
    };

    if config.use_runs_for_overlaps {
        if let Some(runs) = prev.object.runs.as_ref() {
            // Runs translate by the forecast motion in whole cells; growth
            // scaling applies only to the polygon mode.
            let shift_cols =
                grid.col_for_x(track.forecast_x) - grid.col_for_x(prev.current.centroid_x);
            let shift_rows =
                grid.row_for_y(track.forecast_y) - grid.row_for_y(prev.current.centroid_y);
            raster.fill_runs(runs, shift_cols, shift_rows, LAYER_PREV);
            return;
        }
    }

    let vertices = rays_to_vertices(
        &prev.object.rays,
        track.forecast_x,
        track.forecast_y,
        track.forecast_length_ratio,
    );
    raster.fill_polygon(&vertices, grid, LAYER_PREV);
}

/// Renders the current cell's footprint in place.
fn fill_curr(raster: &mut OverlapRaster, curr: &Cell, grid: &GridGeom, config: &TrackerConfig) {
    if config.use_runs_for_overlaps {
        if let Some(runs) = curr.object.runs.as_ref() {
            raster.fill_runs(runs, 0, 0, LAYER_CURRENT);
            return;
        }
    }
    let vertices = rays_to_vertices(
        &curr.object.rays,
        curr.current.centroid_x,
        curr.current.centroid_y,
        1.0,
    );
    raster.fill_polygon(&vertices, grid, LAYER_CURRENT);
}

/// Raster area of the projected previous footprint alone.
fn raster_area_prev(prev: &Cell, grid: &GridGeom, config: &TrackerConfig) -> f64 {
    let mut raster = OverlapRaster::new(prev.box_for_overlap);
    fill_prev(&mut raster, prev, grid, config);
    raster.counts().n_prev() as f64 * grid.cell_area()
}

/// Raster area of the current footprint alone.
fn raster_area_curr(curr: &Cell, grid: &GridGeom, config: &TrackerConfig) -> f64 {
    let mut raster = OverlapRaster::new(curr.box_for_overlap);
    fill_curr(&mut raster, curr, grid, config);
    raster.counts().n_current() as f64 * grid.cell_area()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::project_bounds;
    use crate::lineage::TrackState;
    use crate::scan::test_support::{cell_at, with_runs};
    use approx::assert_relative_eq;

    fn grid() -> GridGeom {
        GridGeom { min_x: -100.0, min_y: -100.0, dx: 1.0, dy: 1.0 }
    }

    fn store() -> (tempfile::TempDir, TrackStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackStore::create(dir.path(), &TrackerConfig::default()).unwrap();
        (dir, store)
    }

    fn with_track(mut cell: Cell, store: &mut TrackStore) -> Cell {
        let mut track = TrackState::init_new(store, 0, 0, None).unwrap();
        track.enter_scan(cell.current, 0, 4);
        cell.track = Some(track);
        cell
    }

    fn run_matcher(
        prev: &mut Vec<Cell>,
        curr: &mut Vec<Cell>,
        store: &TrackStore,
        config: &TrackerConfig,
    ) {
        project_bounds(prev, curr, &grid(), 0.25, config);
        find_overlaps(store, prev, curr, &grid(), config);
    }

    #[test]
    fn test_stationary_cell_matches_itself() {
        let (_dir, mut store) = store();
        let config = TrackerConfig::default();

        let mut prev = vec![with_track(cell_at(0.0, 0.0, 6.0, &grid(), 0), &mut store)];
        let mut curr = vec![cell_at(0.5, 0.0, 6.0, &grid(), 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(prev[0].status.n_match(), 1);
        assert_eq!(curr[0].status.n_match(), 1);
        let edge = &curr[0].status.edges[0];
        assert_eq!(edge.peer, 0);
        assert!(edge.overlap > 0.0);
        assert_relative_eq!(curr[0].status.sum_overlap, edge.overlap);
    }

    #[test]
    fn test_distant_cells_do_not_match() {
        let (_dir, mut store) = store();
        let config = TrackerConfig::default();

        let mut prev = vec![with_track(cell_at(0.0, 0.0, 4.0, &grid(), 0), &mut store)];
        let mut curr = vec![cell_at(50.0, 50.0, 4.0, &grid(), 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(prev[0].status.n_match(), 0);
        assert_eq!(curr[0].status.n_match(), 0);
    }

    #[test]
    fn test_small_cell_engulfed_by_large_one_matches() {
        let (_dir, mut store) = store();
        let config = TrackerConfig { min_sum_fraction_overlap: 0.9, ..Default::default() };

        // The small current cell sits inside the big previous one: its own
        // fraction is ~1.0 even though the big cell's fraction is tiny.
        let mut prev = vec![with_track(cell_at(0.0, 0.0, 20.0, &grid(), 0), &mut store)];
        let mut curr = vec![cell_at(3.0, 0.0, 3.0, &grid(), 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(curr[0].status.n_match(), 1);
    }

    #[test]
    fn test_projection_carries_moving_cell_onto_match() {
        let (_dir, mut store) = store();
        let config = TrackerConfig::default();

        // Previous cell at origin moving +40 km/hr in x; current cell 10 km
        // east. Without projection the boxes barely touch; with it they
        // coincide.
        let mut cell = with_track(cell_at(0.0, 0.0, 5.0, &grid(), 0), &mut store);
        cell.track.as_mut().unwrap().rates.centroid_x = 40.0;
        let mut prev = vec![cell];
        let mut curr = vec![cell_at(10.0, 0.0, 5.0, &grid(), 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(curr[0].status.n_match(), 1);
    }

    #[test]
    fn test_run_mode_matches_like_polygon_mode() {
        let (_dir, mut store) = store();
        let config = TrackerConfig { use_runs_for_overlaps: true, ..Default::default() };

        let prev_object = with_runs(
            crate::scan::test_support::circular_object(0.0, 0.0, 6.0, &grid()),
            &grid(),
        );
        let curr_object = with_runs(
            crate::scan::test_support::circular_object(1.0, 0.0, 6.0, &grid()),
            &grid(),
        );
        let mut prev = vec![with_track(Cell::from_object(prev_object, 0), &mut store)];
        let mut curr = vec![Cell::from_object(curr_object, 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(curr[0].status.n_match(), 1);
    }

    #[test]
    fn test_matcher_is_idempotent() {
        let (_dir, mut store) = store();
        let config = TrackerConfig::default();

        let mut prev = vec![with_track(cell_at(0.0, 0.0, 6.0, &grid(), 0), &mut store)];
        let mut curr = vec![cell_at(0.5, 0.0, 6.0, &grid(), 900)];
        run_matcher(&mut prev, &mut curr, &store, &config);
        let first: Vec<_> = curr[0].status.edges.clone();

        // Re-run on cleared working state: identical edge set and weights.
        crate::scan::reset_for_transition(&mut prev);
        crate::scan::reset_for_transition(&mut curr);
        run_matcher(&mut prev, &mut curr, &store, &config);

        assert_eq!(curr[0].status.edges, first);
    }
}
