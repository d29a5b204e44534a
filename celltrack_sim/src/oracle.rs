//! Invariant oracle.
//!
//! After every committed scan the oracle re-derives, from first principles,
//! the invariants the engine is supposed to maintain, and reports the first
//! violation as a failure string:
//!
//! - **Group partition**: every lineage belongs to exactly one group, and
//!   the union of all groups' member lists equals the set of all lineages
//!   ever created.
//! - **Id compaction**: group ids form the contiguous range `[0, n)`.
//! - **Fan limits**: no live cell holds more edges than the configured
//!   maximum parents/children.
//! - **Aggregate consistency**: each cell's cached overlap and group-size
//!   sums equal a fresh recomputation over its remaining edges.

use std::collections::BTreeMap;

use celltrack_core::{Cell, LineageId, TrackStore, TrackerConfig};

/// Runs every check; the first violation wins.
pub fn check_all(
    store: &TrackStore,
    live_cells: &[Cell],
    config: &TrackerConfig,
) -> Result<(), String> {
    check_group_partition(store)?;
    check_id_compaction(store)?;
    check_fan_limits(live_cells, config)?;
    check_aggregates(live_cells)?;
    Ok(())
}

/// Every lineage in exactly one group; groups cover all lineages.
pub fn check_group_partition(store: &TrackStore) -> Result<(), String> {
    let groups = store.all_groups().map_err(|e| e.to_string())?;
    let lineages = store.all_lineages().map_err(|e| e.to_string())?;

    let mut owner: BTreeMap<LineageId, u64> = BTreeMap::new();
    for group in &groups {
        for member in &group.members {
            if let Some(previous) = owner.insert(*member, group.id.0) {
                return Err(format!(
                    "lineage {} is a member of groups {} and {}",
                    member.0, previous, group.id.0
                ));
            }
            let record = store.get_lineage(*member).map_err(|e| e.to_string())?;
            if record.group != group.id {
                return Err(format!(
                    "lineage {} back-references group {} but lives in {}",
                    member.0, record.group.0, group.id.0
                ));
            }
        }
    }

    for lineage in &lineages {
        if !owner.contains_key(&lineage.id) {
            return Err(format!("lineage {} belongs to no group", lineage.id.0));
        }
    }
    if owner.len() != lineages.len() {
        return Err(format!(
            "groups reference {} lineages but {} exist",
            owner.len(),
            lineages.len()
        ));
    }
    Ok(())
}

/// Group ids are dense in `[0, n)`.
pub fn check_id_compaction(store: &TrackStore) -> Result<(), String> {
    let groups = store.all_groups().map_err(|e| e.to_string())?;
    if groups.len() as u64 != store.n_groups() {
        return Err(format!(
            "store counts {} groups but {} records exist",
            store.n_groups(),
            groups.len()
        ));
    }
    for (slot, group) in groups.iter().enumerate() {
        if group.id.0 != slot as u64 {
            return Err(format!("group id {} found in slot {}", group.id.0, slot));
        }
    }
    Ok(())
}

/// Edge counts respect the configured fan limits.
pub fn check_fan_limits(live_cells: &[Cell], config: &TrackerConfig) -> Result<(), String> {
    let limit = config.max_parents.max(config.max_children);
    for (i, cell) in live_cells.iter().enumerate() {
        if cell.status.edges.len() > limit {
            return Err(format!(
                "cell {} holds {} edges, over the fan limit {}",
                i,
                cell.status.edges.len(),
                limit
            ));
        }
    }
    Ok(())
}

/// Cached aggregates equal a fresh recomputation.
pub fn check_aggregates(live_cells: &[Cell]) -> Result<(), String> {
    for (i, cell) in live_cells.iter().enumerate() {
        let sum_overlap: f64 = cell.status.edges.iter().map(|e| e.overlap).sum();
        if (sum_overlap - cell.status.sum_overlap).abs() > 1e-6 {
            return Err(format!(
                "cell {} caches overlap sum {} but edges sum to {}",
                i, cell.status.sum_overlap, sum_overlap
            ));
        }

        let mut seen = Vec::new();
        let mut sum_group_size = 0usize;
        for edge in &cell.status.edges {
            if !seen.contains(&edge.group) {
                seen.push(edge.group);
                sum_group_size += edge.group_size;
            }
        }
        if sum_group_size != cell.status.sum_group_size {
            return Err(format!(
                "cell {} caches group-size sum {} but edges sum to {}",
                i, cell.status.sum_group_size, sum_group_size
            ));
        }
    }
    Ok(())
}
