//! The topology classifier.
//!
//! After overlap matching, fan limiting and residual assignment, every cell
//! on both sides of the transition gets its lifecycle label: `starts`,
//! `stops`, `continues`, or membership in a combination (`has_merger` /
//! `has_split`). Both directions are computed independently — fan limiting
//! may have produced asymmetric edge counts, so the previous-scan view is
//! not simply the mirror of the current-scan view.

use crate::scan::Cell;

/// Labels every cell on both sides.
pub fn classify(prev: &mut [Cell], curr: &mut [Cell]) {
    // Residual continuations: a mutual best match between two edge-less
    // cells continues the lineage.
    for j in 0..curr.len() {
        if !curr[j].status.edges.is_empty() {
            continue;
        }
        if let Some(i) = curr[j].status.best_match {
            let mutual = prev[i].status.edges.is_empty()
                && prev[i].status.best_match == Some(j);
            if mutual {
                curr[j].status.continues = true;
                prev[i].status.continues = true;
            } else {
                curr[j].status.best_match = None;
            }
        }
    }

    // Singleton overlap edges whose peer is also a singleton continue.
    for j in 0..curr.len() {
        if curr[j].status.edges.len() != 1 {
            continue;
        }
        let i = curr[j].status.edges[0].peer;
        if prev[i].status.edges.len() == 1 {
            curr[j].status.continues = true;
            curr[j].status.best_match = Some(i);
            prev[i].status.continues = true;
            prev[i].status.best_match = Some(j);
        }
    }

    // Current-scan combination flags, computed against the settled edge
    // counts.
    let mut curr_flags = vec![(false, false); curr.len()]; // (merger, split)
    for j in 0..curr.len() {
        let status = &curr[j].status;
        if status.continues || status.edges.is_empty() {
            continue;
        }

        let mut merger = status.edges.len() > 1;
        let mut split = false;
        for edge in &status.edges {
            let parent = &prev[edge.peer].status;
            if parent.edges.len() > 1 {
                split = true;
            }
            // A sibling with several parents hides a merge one hop away.
            for sibling_edge in &parent.edges {
                if curr[sibling_edge.peer].status.edges.len() > 1 {
                    merger = true;
                }
            }
        }
        curr_flags[j] = (merger, split);
    }

    // Previous-scan combination flags, mirrored.
    let mut prev_flags = vec![(false, false); prev.len()];
    for i in 0..prev.len() {
        let status = &prev[i].status;
        if status.continues || status.edges.is_empty() {
            continue;
        }

        let mut split = status.edges.len() > 1;
        let mut merger = false;
        for edge in &status.edges {
            let child = &curr[edge.peer].status;
            if child.edges.len() > 1 {
                merger = true;
            }
            // A co-parent with several children hides a split one hop away.
            for co_parent_edge in &child.edges {
                if prev[co_parent_edge.peer].status.edges.len() > 1 {
                    split = true;
                }
            }
        }
        prev_flags[i] = (merger, split);
    }

    for (j, (merger, split)) in curr_flags.into_iter().enumerate() {
        let status = &mut curr[j].status;
        status.has_merger = merger;
        status.has_split = split;
        if status.edges.is_empty() && !status.continues {
            status.starts = true;
        }
    }

    for (i, (merger, split)) in prev_flags.into_iter().enumerate() {
        let status = &mut prev[i].status;
        status.has_merger = merger;
        status.has_split = split;
        if status.edges.is_empty() && !status.continues {
            status.stops = true;
        }
    }
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

    fn cells(n: usize) -> Vec<Cell> {
        (0..n).map(|k| cell_at(k as f64 * 10.0, 0.0, 3.0, &grid(), 0)).collect()
    }

    fn link(prev: &mut [Cell], curr: &mut [Cell], i: usize, j: usize, overlap: f64) {
        let group = GroupId(i as u64);
        prev[i].status.add_edge(Edge { peer: j, overlap, group, group_size: 1 });
        curr[j].status.add_edge(Edge { peer: i, overlap, group, group_size: 1 });
    }

    #[test]
    fn test_singleton_edge_continues() {
        let mut prev = cells(1);
        let mut curr = cells(1);
        link(&mut prev, &mut curr, 0, 0, 5.0);

        classify(&mut prev, &mut curr);

        assert!(curr[0].status.continues);
        assert!(prev[0].status.continues);
        assert_eq!(curr[0].status.best_match, Some(0));
        assert!(!curr[0].status.starts);
        assert!(!prev[0].status.stops);
    }

    #[test]
    fn test_birth_and_death() {
        let mut prev = cells(1);
        let mut curr = cells(1);
        // No edges, no assignment.

        classify(&mut prev, &mut curr);

        assert!(curr[0].status.starts);
        assert!(prev[0].status.stops);
        assert!(!curr[0].status.continues);
    }

    #[test]
    fn test_residual_continuation_requires_mutual_match() {
        let mut prev = cells(2);
        let mut curr = cells(2);
        prev[0].status.best_match = Some(0);
        curr[0].status.best_match = Some(0);
        // One-sided claim: curr 1 thinks it matched prev 1, but not back.
        curr[1].status.best_match = Some(1);

        classify(&mut prev, &mut curr);

        assert!(curr[0].status.continues);
        assert!(prev[0].status.continues);
        assert!(curr[1].status.starts);
        assert_eq!(curr[1].status.best_match, None);
        assert!(prev[1].status.stops);
    }

    #[test]
    fn test_merge_flags() {
        let mut prev = cells(2);
        let mut curr = cells(1);
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 1, 0, 3.0);

        classify(&mut prev, &mut curr);

        assert!(curr[0].status.has_merger);
        assert!(!curr[0].status.has_split);
        // Each parent sees the merge from its side.
        assert!(prev[0].status.has_merger);
        assert!(prev[1].status.has_merger);
        assert!(!prev[0].status.has_split);
    }

    #[test]
    fn test_split_flags() {
        let mut prev = cells(1);
        let mut curr = cells(2);
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 0, 1, 3.0);

        classify(&mut prev, &mut curr);

        assert!(prev[0].status.has_split);
        assert!(curr[0].status.has_split);
        assert!(curr[1].status.has_split);
        assert!(!curr[0].status.has_merger);
        assert!(!curr[0].status.continues);
    }

    #[test]
    fn test_transitive_merge_reaches_split_sibling() {
        // prev 0 splits into curr 0 and curr 1; curr 1 also absorbs prev 1.
        // curr 0 has a single parent but must still see the merger hidden
        // one hop away through its sibling.
        let mut prev = cells(2);
        let mut curr = cells(2);
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 0, 1, 4.0);
        link(&mut prev, &mut curr, 1, 1, 3.0);

        classify(&mut prev, &mut curr);

        assert!(curr[0].status.has_split);
        assert!(curr[0].status.has_merger, "sibling's merge must propagate");
        assert!(curr[1].status.has_merger);
        assert!(curr[1].status.has_split);
        // prev 1 has one child, but that child merges; and its co-parent
        // splits, which reaches prev 1 as has_split.
        assert!(prev[1].status.has_merger);
        assert!(prev[1].status.has_split);
    }

    #[test]
    fn test_asymmetric_counts_after_fan_limiting() {
        // An edge surviving on one side only (as fan limiting can leave
        // transiently inconsistent aggregates) must not panic and must not
        // classify as continuation on the broken side.
        let mut prev = cells(2);
        let mut curr = cells(1);
        link(&mut prev, &mut curr, 0, 0, 5.0);
        link(&mut prev, &mut curr, 1, 0, 3.0);
        prev[1].status.remove_edge_to(0).unwrap();

        classify(&mut prev, &mut curr);

        assert!(!curr[0].status.continues);
        assert!(prev[1].status.stops);
    }
}
