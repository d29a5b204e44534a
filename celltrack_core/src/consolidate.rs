//! The lineage consolidator.
//!
//! A merge/split cluster can connect cells whose lineages live in different
//! groups; after classification those groups must become one. For every
//! not-yet-visited current cell flagged as part of a combination, a
//! depth-first traversal alternating between current-cell edges and
//! previous-cell edges (never revisiting a previous cell) collects the set
//! of distinct group ids touched; all are then unioned into the minimum id.
//!
//! Group ids stay dense: removing the absorbed group's slot renumbers every
//! higher-numbered group down by one, and **all** back-references — member
//! lineage records on disk, and every in-flight track state and candidate
//! edge in the transition — are rewritten in the same pass. External code
//! must therefore address groups by id lookup only, never hold a slot
//! across a consolidation.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::TrackError;
use crate::lineage::GroupId;
use crate::scan::Cell;
use crate::store::TrackStore;

/// Consolidates all merge/split clusters of the transition.
pub fn consolidate(
    store: &mut TrackStore,
    prev: &mut [Cell],
    curr: &mut [Cell],
) -> Result<(), TrackError> {
    let mut visited_prev = vec![false; prev.len()];
    let mut visited_curr = vec![false; curr.len()];

    for j in 0..curr.len() {
        if visited_curr[j] {
            continue;
        }
        if !(curr[j].status.has_merger || curr[j].status.has_split) {
            continue;
        }

        let groups = collect_cluster_groups(prev, curr, j, &mut visited_prev, &mut visited_curr)?;
        if groups.len() < 2 {
            continue;
        }

        let survivor = *groups.keys().next().expect("cluster has groups");
        // Union highest-first so pending ids are not disturbed by the
        // renumbering each removal triggers.
        let absorbed: Vec<GroupId> = groups.keys().copied().skip(1).rev().collect();
        for other in absorbed {
            debug!(?survivor, ?other, "uniting lineage groups");
            union_groups(store, survivor, other, prev, curr)?;
        }
    }

    Ok(())
}

/// Walks one cluster, marking visits and returning the distinct groups
/// touched, each with one representative previous-cell index.
fn collect_cluster_groups(
    prev: &[Cell],
    curr: &[Cell],
    start: usize,
    visited_prev: &mut [bool],
    visited_curr: &mut [bool],
) -> Result<BTreeMap<GroupId, usize>, TrackError> {
    let mut groups: BTreeMap<GroupId, usize> = BTreeMap::new();
    let mut stack = vec![start];
    visited_curr[start] = true;

    while let Some(j) = stack.pop() {
        for edge in &curr[j].status.edges {
            let i = edge.peer;
            if visited_prev[i] {
                continue;
            }
            visited_prev[i] = true;

            let track = prev[i]
                .track
                .as_ref()
                .ok_or_else(|| TrackError::internal("previous cell without track state"))?;
            groups.entry(track.group).or_insert(i);

            for back_edge in &prev[i].status.edges {
                let k = back_edge.peer;
                if !visited_curr[k] {
                    visited_curr[k] = true;
                    stack.push(k);
                }
            }
        }
    }

    Ok(groups)
}

/// Unions `absorbed` into `survivor`, removes the absorbed slot, renumbers
/// every higher group down by one, and rewrites all back-references.
fn union_groups(
    store: &mut TrackStore,
    survivor: GroupId,
    absorbed: GroupId,
    prev: &mut [Cell],
    curr: &mut [Cell],
) -> Result<(), TrackError> {
    debug_assert!(survivor < absorbed);

    let mut survivor_record = store.get_group(survivor)?;
    let absorbed_record = store.get_group(absorbed)?;

    // Re-home the absorbed group's member lineages.
    for member in &absorbed_record.members {
        let mut lineage = store.get_lineage(*member)?;
        lineage.group = survivor;
        store.put_lineage(&lineage)?;
    }

    survivor_record.members.extend(absorbed_record.members.iter().copied());
    survivor_record.members.sort();
    survivor_record.members.dedup();
    survivor_record.start_scan = survivor_record.start_scan.min(absorbed_record.start_scan);
    survivor_record.end_scan = survivor_record.end_scan.max(absorbed_record.end_scan);
    survivor_record.start_time = survivor_record.start_time.min(absorbed_record.start_time);
    survivor_record.end_time = survivor_record.end_time.max(absorbed_record.end_time);
    store.put_group(&survivor_record)?;
    store.remove_group(absorbed)?;

    // Compact the id space: shift every higher-numbered group down one
    // slot, rewriting its members' group references as well.
    let n_groups = store.n_groups();
    for old_id in (absorbed.0 + 1)..n_groups {
        let mut record = store.get_group(GroupId(old_id))?;
        record.id = GroupId(old_id - 1);
        for member in &record.members {
            let mut lineage = store.get_lineage(*member)?;
            lineage.group = record.id;
            store.put_lineage(&lineage)?;
        }
        store.put_group(&record)?;
        store.remove_group(GroupId(old_id))?;
    }
    store.note_group_removed();

    // Rewrite every in-flight reference in the same pass.
    let remap = |g: GroupId| -> GroupId {
        if g == absorbed {
            survivor
        } else if g > absorbed {
            GroupId(g.0 - 1)
        } else {
            g
        }
    };
    for cell in prev.iter_mut().chain(curr.iter_mut()) {
        if let Some(track) = cell.track.as_mut() {
            track.group = remap(track.group);
        }
        for edge in &mut cell.status.edges {
            edge.group = remap(edge.group);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::lineage::{Edge, LineageId, TrackState};
    use crate::scan::test_support::cell_at;
    use celltrack_env::GridGeom;
    use proptest::prelude::*;

    fn grid() -> GridGeom {
        GridGeom { min_x: -100.0, min_y: -100.0, dx: 1.0, dy: 1.0 }
    }

    fn store() -> (tempfile::TempDir, TrackStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackStore::create(dir.path(), &TrackerConfig::default()).unwrap();
        (dir, store)
    }

    fn tracked_cell(store: &mut TrackStore, x: f64) -> Cell {
        let mut cell = cell_at(x, 0.0, 3.0, &grid(), 0);
        let mut track = TrackState::init_new(store, 0, 0, None).unwrap();
        track.enter_scan(cell.current, 0, 4);
        cell.track = Some(track);
        cell
    }

    fn link(prev: &mut [Cell], curr: &mut [Cell], i: usize, j: usize, overlap: f64) {
        let group = prev[i].track.as_ref().unwrap().group;
        prev[i].status.add_edge(Edge { peer: j, overlap, group, group_size: 1 });
        curr[j].status.add_edge(Edge { peer: i, overlap, group, group_size: 1 });
    }

    /// Invariant checks shared by the tests: dense ids, partition of all
    /// lineages over the groups.
    fn assert_store_invariants(store: &TrackStore) {
        let groups = store.all_groups().unwrap();
        assert_eq!(groups.len() as u64, store.n_groups());
        for (slot, group) in groups.iter().enumerate() {
            assert_eq!(group.id.0, slot as u64, "group ids must be dense");
        }

        let lineages = store.all_lineages().unwrap();
        let mut seen: Vec<LineageId> = Vec::new();
        for group in &groups {
            for member in &group.members {
                let record = store.get_lineage(*member).unwrap();
                assert_eq!(record.group, group.id, "member back-reference");
                seen.push(*member);
            }
        }
        seen.sort();
        let mut all: Vec<LineageId> = lineages.iter().map(|l| l.id).collect();
        all.sort();
        assert_eq!(seen, all, "groups must partition the lineages");
    }

    #[test]
    fn test_merge_unions_two_groups() {
        let (_dir, mut store) = store();
        let mut prev = vec![tracked_cell(&mut store, 0.0), tracked_cell(&mut store, 10.0)];
        let mut curr = vec![cell_at(5.0, 0.0, 3.0, &grid(), 300)];
        link(&mut prev, &mut curr, 0, 0, 4.0);
        link(&mut prev, &mut curr, 1, 0, 3.0);
        curr[0].status.has_merger = true;

        assert_eq!(store.n_groups(), 2);
        consolidate(&mut store, &mut prev, &mut curr).unwrap();

        assert_eq!(store.n_groups(), 1);
        let survivor = store.get_group(GroupId(0)).unwrap();
        assert_eq!(survivor.members.len(), 2);
        // In-flight references rewritten.
        assert_eq!(prev[0].track.as_ref().unwrap().group, GroupId(0));
        assert_eq!(prev[1].track.as_ref().unwrap().group, GroupId(0));
        assert_eq!(curr[0].status.edges[1].group, GroupId(0));
        assert_store_invariants(&store);
    }

    #[test]
    fn test_renumbering_shifts_unrelated_groups_down() {
        let (_dir, mut store) = store();
        // Four groups; cluster joins groups 0 and 2, so group 3 must slide
        // to slot 2 and the bystander group 1 stay put.
        let mut prev = vec![
            tracked_cell(&mut store, 0.0),   // group 0
            tracked_cell(&mut store, 50.0),  // group 1, bystander
            tracked_cell(&mut store, 10.0),  // group 2
            tracked_cell(&mut store, 80.0),  // group 3, bystander
        ];
        let mut curr = vec![cell_at(5.0, 0.0, 3.0, &grid(), 300)];
        link(&mut prev, &mut curr, 0, 0, 4.0);
        link(&mut prev, &mut curr, 2, 0, 3.0);
        curr[0].status.has_merger = true;

        consolidate(&mut store, &mut prev, &mut curr).unwrap();

        assert_eq!(store.n_groups(), 3);
        assert_eq!(prev[1].track.as_ref().unwrap().group, GroupId(1));
        assert_eq!(prev[3].track.as_ref().unwrap().group, GroupId(2));
        assert_store_invariants(&store);
    }

    #[test]
    fn test_split_within_one_group_is_a_noop() {
        let (_dir, mut store) = store();
        let mut prev = vec![tracked_cell(&mut store, 0.0)];
        let mut curr = vec![
            cell_at(-3.0, 0.0, 2.0, &grid(), 300),
            cell_at(3.0, 0.0, 2.0, &grid(), 300),
        ];
        link(&mut prev, &mut curr, 0, 0, 2.0);
        link(&mut prev, &mut curr, 0, 1, 2.0);
        curr[0].status.has_split = true;
        curr[1].status.has_split = true;

        consolidate(&mut store, &mut prev, &mut curr).unwrap();

        assert_eq!(store.n_groups(), 1);
        assert_store_invariants(&store);
    }

    #[test]
    fn test_chained_cluster_unites_all_touched_groups() {
        let (_dir, mut store) = store();
        // prev 0 and 1 merge into curr 0; prev 1 also feeds curr 1, which
        // merges with prev 2: one connected cluster spanning three groups.
        let mut prev = vec![
            tracked_cell(&mut store, 0.0),
            tracked_cell(&mut store, 10.0),
            tracked_cell(&mut store, 20.0),
        ];
        let mut curr = vec![
            cell_at(5.0, 0.0, 3.0, &grid(), 300),
            cell_at(15.0, 0.0, 3.0, &grid(), 300),
        ];
        link(&mut prev, &mut curr, 0, 0, 4.0);
        link(&mut prev, &mut curr, 1, 0, 3.0);
        link(&mut prev, &mut curr, 1, 1, 2.0);
        link(&mut prev, &mut curr, 2, 1, 5.0);
        for cell in curr.iter_mut() {
            cell.status.has_merger = true;
            cell.status.has_split = true;
        }

        consolidate(&mut store, &mut prev, &mut curr).unwrap();

        assert_eq!(store.n_groups(), 1);
        let group = store.get_group(GroupId(0)).unwrap();
        assert_eq!(group.members.len(), 3);
        for cell in &prev {
            assert_eq!(cell.track.as_ref().unwrap().group, GroupId(0));
        }
        assert_store_invariants(&store);
    }

    proptest! {
        /// Random bipartite transitions keep the partition and compaction
        /// invariants, whatever the cluster shapes.
        #[test]
        fn prop_consolidation_invariants(
            edges in proptest::collection::vec((0usize..6, 0usize..6), 0..16)
        ) {
            let (_dir, mut store) = store();
            let mut prev: Vec<Cell> =
                (0..6).map(|i| tracked_cell(&mut store, i as f64 * 10.0)).collect();
            let mut curr: Vec<Cell> =
                (0..6).map(|j| cell_at(j as f64 * 10.0, 5.0, 3.0, &grid(), 300)).collect();

            for (i, j) in edges {
                let already = prev[i].status.edges.iter().any(|e| e.peer == j);
                if !already {
                    link(&mut prev, &mut curr, i, j, 1.0 + (i + j) as f64);
                }
            }

            crate::classify::classify(&mut prev, &mut curr);
            consolidate(&mut store, &mut prev, &mut curr).unwrap();

            assert_store_invariants(&store);

            // Every combination cluster settles on a single group.
            for cell in &curr {
                if cell.status.has_merger || cell.status.has_split {
                    let groups: Vec<GroupId> = cell
                        .status
                        .edges
                        .iter()
                        .map(|e| prev[e.peer].track.as_ref().unwrap().group)
                        .collect();
                    for g in &groups {
                        prop_assert_eq!(*g, groups[0]);
                    }
                }
            }
        }
    }
}
