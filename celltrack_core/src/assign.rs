//! The residual assigner.
//!
//! Cells left without any overlap edge get one more chance: an optimal
//! bipartite assignment over centroid distance and growth-rate difference.
//! Pairs that already hold an overlap edge, exceed the maximum plausible
//! speed, or fail the motion-feasibility gate are infeasible. The solver is
//! a maximum-weight Kuhn–Munkres over an integer benefit matrix; it
//! requires rows ≤ columns, so the smaller side is transposed into rows and
//! the solution mapped back.

use nalgebra::DMatrix;
use tracing::trace;

use crate::config::TrackerConfig;
use crate::scan::Cell;

/// Sentinel for an infeasible pairing.
const INFEASIBLE: f64 = f64::INFINITY;

/// Fixed-point scale when converting costs to integer benefits.
const BENEFIT_SCALE: f64 = 1000.0;

// ============================================================================
// RESIDUAL ASSIGNMENT
// ============================================================================

/// Runs the optimal assignment and records mutual best matches on both
/// sides' working status. Cells that already hold overlap edges keep their
/// rows in the matrix (marked infeasible pairwise) so they cannot steal a
/// residual candidate, but only edge-less cells will act on the result.
pub fn assign_residuals(
    prev: &mut [Cell],
    curr: &mut [Cell],
    dt_hours: f64,
    config: &TrackerConfig,
) {
    if prev.is_empty() || curr.is_empty() || dt_hours <= 0.0 {
        return;
    }

    let mut costs = DMatrix::from_element(prev.len(), curr.len(), INFEASIBLE);
    let mut any_feasible = false;
    for i in 0..prev.len() {
        for j in 0..curr.len() {
            let cost = pair_cost(&prev[i], &curr[j], j, dt_hours, config);
            if cost < INFEASIBLE {
                any_feasible = true;
            }
            costs[(i, j)] = cost;
        }
    }
    // Nothing feasible degenerates to "no match", not an error.
    if !any_feasible {
        return;
    }

    let ceiling = costs
        .iter()
        .copied()
        .filter(|c| c.is_finite())
        .fold(0.0_f64, f64::max)
        + 1.0;

    let benefits = costs.map(|c| {
        if c.is_finite() {
            ((ceiling - c) * BENEFIT_SCALE).round() as i64
        } else {
            0
        }
    });

    for (i, j) in max_weight_assignment(&benefits) {
        // A pairing the solver chose for lack of alternatives may still be
        // infeasible; discard it.
        if !costs[(i, j)].is_finite() {
            continue;
        }
        trace!(prev = i, curr = j, cost = costs[(i, j)], "residual match");
        prev[i].status.best_match = Some(j);
        curr[j].status.best_match = Some(i);
    }
}

/// Assignment cost of pairing a previous cell with a current cell, or the
/// infeasible sentinel.
fn pair_cost(
    prev: &Cell,
    curr: &Cell,
    curr_index: usize,
    dt_hours: f64,
    config: &TrackerConfig,
) -> f64 {
    // Pairs already connected by an overlap edge are not assignment
    // candidates.
    if prev.status.edges.iter().any(|e| e.peer == curr_index) {
        return INFEASIBLE;
    }

    let dx = curr.current.centroid_x - prev.current.centroid_x;
    let dy = curr.current.centroid_y - prev.current.centroid_y;
    let distance = (dx * dx + dy * dy).sqrt();

    if distance / dt_hours > config.max_speed {
        return INFEASIBLE;
    }

    // Motion feasibility: once a lineage has real history, a candidate must
    // predict better than plain extrapolation — closer to the forecast
    // point than the previous cell itself is.
    if let Some(track) = prev.track.as_ref() {
        if track.history_in_scans >= config.min_history_for_motion_gate {
            let d_cand = ((curr.current.centroid_x - track.forecast_x).powi(2)
                + (curr.current.centroid_y - track.forecast_y).powi(2))
            .sqrt();
            let d_self = ((prev.current.centroid_x - track.forecast_x).powi(2)
                + (prev.current.centroid_y - track.forecast_y).powi(2))
            .sqrt();
            if d_cand >= d_self {
                return INFEASIBLE;
            }
        }
    }

    let dvol = curr.current.volume.max(0.0).cbrt() - prev.current.volume.max(0.0).cbrt();

    config.weight_distance * distance + config.weight_delta_cube_root_volume * dvol.abs()
}

// ============================================================================
// KUHN–MUNKRES
// ============================================================================

/// Maximum-weight bipartite assignment.
///
/// Accepts any shape; the smaller-cardinality side is transposed into rows
/// internally (the solver proper requires rows ≤ columns) and the result is
/// mapped back to `(row, col)` pairs in the caller's orientation. Every row
/// of the smaller side is assigned.
pub fn max_weight_assignment(benefits: &DMatrix<i64>) -> Vec<(usize, usize)> {
    if benefits.nrows() == 0 || benefits.ncols() == 0 {
        return Vec::new();
    }

    let transposed = benefits.nrows() > benefits.ncols();
    let work = if transposed { benefits.transpose() } else { benefits.clone() };

    // Maximize by minimizing (max - benefit).
    let max_benefit = work.iter().copied().max().unwrap_or(0);
    let cost = work.map(|b| max_benefit - b);

    let assignment = min_cost_assignment(&cost);

    assignment
        .into_iter()
        .enumerate()
        .map(|(row, col)| if transposed { (col, row) } else { (row, col) })
        .collect()
}

/// Minimum-cost assignment via shortest augmenting paths with potentials.
/// Requires `nrows <= ncols`; returns the matched column per row.
fn min_cost_assignment(cost: &DMatrix<i64>) -> Vec<usize> {
    let n = cost.nrows();
    let m = cost.ncols();
    debug_assert!(n <= m);

    const INF: i64 = i64::MAX / 2;

    // 1-indexed potentials and matching; p[j] is the row matched to
    // column j, 0 meaning unmatched.
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![INF; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = INF;
            let mut j1 = 0usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[(i0 - 1, j - 1)] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Unwind the augmenting path.
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![usize::MAX; n];
    for j in 1..=m {
        if p[j] != 0 {
            result[p[j] - 1] = j - 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::test_support::cell_at;
    use celltrack_env::GridGeom;

    fn grid() -> GridGeom {
        GridGeom { min_x: -200.0, min_y: -200.0, dx: 1.0, dy: 1.0 }
    }

    #[test]
    fn test_min_cost_simple() {
        let cost = DMatrix::from_row_slice(2, 2, &[1, 10, 10, 1]);
        assert_eq!(min_cost_assignment(&cost), vec![0, 1]);

        let crossed = DMatrix::from_row_slice(2, 2, &[10, 1, 1, 10]);
        assert_eq!(min_cost_assignment(&crossed), vec![1, 0]);
    }

    #[test]
    fn test_min_cost_rectangular() {
        // 2 rows, 3 cols: rows pick the two cheapest distinct columns.
        let cost = DMatrix::from_row_slice(2, 3, &[5, 1, 9, 1, 5, 9]);
        assert_eq!(min_cost_assignment(&cost), vec![1, 0]);
    }

    #[test]
    fn test_max_weight_transposes_wide_side() {
        // 3 rows, 2 cols: nrows > ncols forces the transposition path.
        let benefits = DMatrix::from_row_slice(3, 2, &[9, 1, 1, 9, 5, 5]);
        let mut pairs = max_weight_assignment(&benefits);
        pairs.sort();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_residual_match_by_proximity() {
        let config = TrackerConfig { max_speed: 1000.0, ..Default::default() };

        let mut prev = vec![
            cell_at(0.0, 0.0, 4.0, &grid(), 0),
            cell_at(100.0, 0.0, 4.0, &grid(), 0),
        ];
        let mut curr = vec![
            cell_at(98.0, 0.0, 4.0, &grid(), 900),
            cell_at(2.0, 0.0, 4.0, &grid(), 900),
        ];

        assign_residuals(&mut prev, &mut curr, 0.25, &config);

        assert_eq!(prev[0].status.best_match, Some(1));
        assert_eq!(prev[1].status.best_match, Some(0));
        assert_eq!(curr[0].status.best_match, Some(1));
        assert_eq!(curr[1].status.best_match, Some(0));
    }

    #[test]
    fn test_speed_gate_blocks_distant_pairs() {
        let config = TrackerConfig { max_speed: 50.0, ..Default::default() };

        let mut prev = vec![cell_at(0.0, 0.0, 4.0, &grid(), 0)];
        let mut curr = vec![cell_at(100.0, 0.0, 4.0, &grid(), 900)];

        // 100 km in 15 minutes is 400 km/hr: infeasible.
        assign_residuals(&mut prev, &mut curr, 0.25, &config);

        assert_eq!(prev[0].status.best_match, None);
        assert_eq!(curr[0].status.best_match, None);
    }

    #[test]
    fn test_motion_gate_rejects_worse_than_extrapolation() {
        let config = TrackerConfig {
            max_speed: 1000.0,
            min_history_for_motion_gate: 5,
            ..Default::default()
        };

        let dir = tempfile::tempdir().unwrap();
        let mut store =
            crate::store::TrackStore::create(dir.path(), &TrackerConfig::default()).unwrap();

        let mut cell = cell_at(0.0, 0.0, 4.0, &grid(), 0);
        let mut track = crate::lineage::TrackState::init_new(&mut store, 0, 0, None).unwrap();
        track.history_in_scans = 6;
        // Forecast point east of the cell.
        track.forecast_x = 10.0;
        track.forecast_y = 0.0;
        cell.track = Some(track);
        let mut prev = vec![cell];

        // A candidate west of the cell is farther from the forecast point
        // than the cell itself (10 km): rejected.
        let mut curr = vec![cell_at(-5.0, 0.0, 4.0, &grid(), 900)];
        assign_residuals(&mut prev, &mut curr, 0.25, &config);
        assert_eq!(curr[0].status.best_match, None);

        // A candidate near the forecast point passes.
        let mut curr = vec![cell_at(8.0, 0.0, 4.0, &grid(), 900)];
        prev[0].status.best_match = None;
        assign_residuals(&mut prev, &mut curr, 0.25, &config);
        assert_eq!(curr[0].status.best_match, Some(0));
    }

    #[test]
    fn test_all_infeasible_is_no_match() {
        let config = TrackerConfig { max_speed: 1.0, ..Default::default() };
        let mut prev = vec![cell_at(0.0, 0.0, 4.0, &grid(), 0)];
        let mut curr = vec![cell_at(50.0, 50.0, 4.0, &grid(), 900)];
        assign_residuals(&mut prev, &mut curr, 0.25, &config);
        assert_eq!(prev[0].status.best_match, None);
    }
}
