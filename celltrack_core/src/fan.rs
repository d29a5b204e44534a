//! The fan limiter.
//!
//! After overlap matching, no previous-scan cell may keep more child edges
//! than `max_children` and no current-scan cell more parent edges than
//! `max_parents`. Excess edges are evicted lowest-overlap-first, with the
//! mirrored edge removed from the peer and both cells' aggregates
//! corrected.
//!
//! When several edges share the minimum overlap, the one encountered first
//! scanning the cell's edge list (ascending peer order, the order the
//! matcher inserted them) is evicted. The choice is deterministic but not
//! semantically significant.

use tracing::debug;

use crate::config::TrackerConfig;
use crate::error::TrackError;
use crate::scan::Cell;

/// Enforces the parent/children limits on both sides.
pub fn limit_fan(
    prev: &mut [Cell],
    curr: &mut [Cell],
    config: &TrackerConfig,
) -> Result<(), TrackError> {
    // Previous-scan cells: limit children.
    for i in 0..prev.len() {
        while prev[i].status.n_match() > config.max_children {
            let victim = lowest_overlap_peer(&prev[i]);
            evict(prev, curr, i, victim)?;
        }
    }

    // Current-scan cells: limit parents.
    for j in 0..curr.len() {
        while curr[j].status.n_match() > config.max_parents {
            let victim = lowest_overlap_peer(&curr[j]);
            evict(curr, prev, j, victim)?;
        }
    }

    Ok(())
}

/// Peer index of the cell's lowest-overlap edge. First-encountered wins a
/// tie.
fn lowest_overlap_peer(cell: &Cell) -> usize {
    let mut best_peer = 0;
    let mut best_overlap = f64::INFINITY;
    for edge in &cell.status.edges {
        if edge.overlap < best_overlap {
            best_overlap = edge.overlap;
            best_peer = edge.peer;
        }
    }
    best_peer
}

/// Removes the edge between `side[index]` and `other[peer]` from both
/// cells. Failure to find either half is an internal-consistency error.
fn evict(
    side: &mut [Cell],
    other: &mut [Cell],
    index: usize,
    peer: usize,
) -> Result<(), TrackError> {
    debug!(index, peer, "evicting lowest-overlap edge");

    side[index]
        .status
        .remove_edge_to(peer)
        .ok_or(TrackError::EdgeNotFound { prev: index, current: peer })?;

    other
        .get_mut(peer)
        .and_then(|cell| cell.status.remove_edge_to(index))
        .ok_or(TrackError::EdgeNotFound { prev: index, current: peer })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::{Edge, GroupId};
    use crate::scan::test_support::cell_at;
    use celltrack_env::GridGeom;

    fn grid() -> GridGeom {
        GridGeom { min_x: -100.0, min_y: -100.0, dx: 1.0, dy: 1.0 }
    }

    fn bare_cell() -> Cell {
        cell_at(0.0, 0.0, 4.0, &grid(), 0)
    }

    /// Wires a symmetric edge between prev[i] and curr[j].
    fn link(prev: &mut [Cell], curr: &mut [Cell], i: usize, j: usize, overlap: f64) {
        let group = GroupId(i as u64);
        prev[i].status.add_edge(Edge { peer: j, overlap, group, group_size: 1 });
        curr[j].status.add_edge(Edge { peer: i, overlap, group, group_size: 1 });
    }

    #[test]
    fn test_within_limits_untouched() {
        let mut prev = vec![bare_cell()];
        let mut curr = vec![bare_cell(), bare_cell()];
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 0, 1, 3.0);

        let config = TrackerConfig { max_children: 2, max_parents: 2, ..Default::default() };
        limit_fan(&mut prev, &mut curr, &config).unwrap();

        assert_eq!(prev[0].status.n_match(), 2);
    }

    #[test]
    fn test_lowest_overlap_edges_evicted_symmetrically() {
        let mut prev = vec![bare_cell()];
        let mut curr = vec![bare_cell(), bare_cell(), bare_cell()];
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 0, 1, 1.0);
        link(&mut prev, &mut curr, 0, 2, 3.0);

        let config = TrackerConfig { max_children: 2, max_parents: 2, ..Default::default() };
        limit_fan(&mut prev, &mut curr, &config).unwrap();

        // The weakest child edge (to curr 1) went, from both sides.
        assert_eq!(prev[0].status.n_match(), 2);
        assert!(prev[0].status.edges.iter().all(|e| e.peer != 1));
        assert_eq!(curr[1].status.n_match(), 0);
        assert_eq!(curr[0].status.n_match(), 1);

        // Aggregates match a fresh recomputation over the survivors.
        let expected: f64 = prev[0].status.edges.iter().map(|e| e.overlap).sum();
        assert_eq!(prev[0].status.sum_overlap, expected);
    }

    #[test]
    fn test_parent_limit_on_current_side() {
        let mut prev = vec![bare_cell(), bare_cell(), bare_cell()];
        let mut curr = vec![bare_cell()];
        link(&mut prev, &mut curr, 0, 0, 2.0);
        link(&mut prev, &mut curr, 1, 0, 6.0);
        link(&mut prev, &mut curr, 2, 0, 4.0);

        let config = TrackerConfig { max_children: 8, max_parents: 2, ..Default::default() };
        limit_fan(&mut prev, &mut curr, &config).unwrap();

        assert_eq!(curr[0].status.n_match(), 2);
        assert_eq!(prev[0].status.n_match(), 0);
        assert_eq!(prev[1].status.n_match(), 1);
    }

    #[test]
    fn test_tie_break_evicts_first_encountered() {
        let mut prev = vec![bare_cell()];
        let mut curr = vec![bare_cell(), bare_cell(), bare_cell()];
        link(&mut prev, &mut curr, 0, 0, 2.0);
        link(&mut prev, &mut curr, 0, 1, 2.0);
        link(&mut prev, &mut curr, 0, 2, 5.0);

        let config = TrackerConfig { max_children: 2, max_parents: 8, ..Default::default() };
        limit_fan(&mut prev, &mut curr, &config).unwrap();

        // Both ties have overlap 2.0; the first-listed edge (to curr 0)
        // is the deterministic victim.
        assert!(prev[0].status.edges.iter().all(|e| e.peer != 0));
        assert_eq!(curr[1].status.n_match(), 1);
    }

    #[test]
    fn test_missing_mirror_edge_is_fatal() {
        let mut prev = vec![bare_cell()];
        let mut curr = vec![bare_cell(), bare_cell()];
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 0, 1, 1.0);
        // Corrupt the symmetry: curr 1 loses its half of the edge.
        curr[1].status.remove_edge_to(0).unwrap();

        let config = TrackerConfig { max_children: 1, max_parents: 8, ..Default::default() };
        let result = limit_fan(&mut prev, &mut curr, &config);
        assert!(matches!(result, Err(TrackError::EdgeNotFound { .. })));
    }
}
