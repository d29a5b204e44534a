//! The restart snapshot.
//!
//! A local-only file holding everything needed to resume tracking from the
//! last committed scan without replaying earlier ones: a success flag, the
//! modify-code tag shared with the store header, the last committed scan
//! number, and the full working-cell array with lineage cursors.
//!
//! The file is written to a temp path and renamed into place, so a torn
//! write leaves either the old snapshot or none; the `complete` flag is
//! checked on read as a second guard.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use celltrack_env::{GridGeom, ScanObject};

use crate::lineage::{CellProps, TrackState};
use crate::scan::Cell;
use crate::store::StoreError;

const SNAPSHOT_NAME: &str = "tracking_state.json";

/// One carried-forward cell in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCell {
    pub object: ScanObject,
    pub current: CellProps,
    pub track: TrackState,
}

/// The serialized restart state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// True only if the snapshot was fully written
    pub complete: bool,
    /// Must equal the store header's modify code for a resume
    pub modify_code: Uuid,
    /// Last scan whose writes fully committed
    pub last_scan: usize,
    /// Time of that scan
    pub time_secs: i64,
    /// Grid the working cells are expressed on
    pub grid: GridGeom,
    /// The full working-cell array
    pub cells: Vec<SnapshotCell>,
    /// Lineage count at save time; must match the header on resume
    pub n_lineages: u64,
}

/// Path of the snapshot inside an output directory.
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_NAME)
}

/// Saves the current working state.
pub fn save(
    dir: &Path,
    modify_code: Uuid,
    last_scan: usize,
    time_secs: i64,
    grid: GridGeom,
    cells: &[Cell],
    n_lineages: u64,
) -> Result<(), StoreError> {
    let snapshot_cells: Vec<SnapshotCell> = cells
        .iter()
        .filter_map(|cell| {
            cell.track.as_ref().map(|track| SnapshotCell {
                object: cell.object.clone(),
                current: cell.current,
                track: track.clone(),
            })
        })
        .collect();

    let snapshot = Snapshot {
        complete: true,
        modify_code,
        last_scan,
        time_secs,
        grid,
        cells: snapshot_cells,
        n_lineages,
    };

    let path = snapshot_path(dir);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(&snapshot)?).map_err(io_to_store)?;
    fs::rename(&tmp, &path).map_err(io_to_store)?;
    Ok(())
}

/// Loads the snapshot, or `None` when there is no usable one.
pub fn load(dir: &Path) -> Option<Snapshot> {
    let path = snapshot_path(dir);
    let data = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<Snapshot>(&data) {
        Ok(snapshot) if snapshot.complete => Some(snapshot),
        Ok(_) => {
            warn!("snapshot {} is incomplete, ignoring", path.display());
            None
        }
        Err(e) => {
            warn!("snapshot {} is unreadable: {}", path.display(), e);
            None
        }
    }
}

/// Removes the snapshot after a failed tracking step, so a restart cannot
/// fast-resume over an inconsistent store.
pub fn remove(dir: &Path) {
    let path = snapshot_path(dir);
    if path.exists() {
        warn!("removing tracking state file {}", path.display());
        if let Err(e) = fs::remove_file(&path) {
            warn!("cannot remove state file {}: {}", path.display(), e);
        }
    }
}

/// Rebuilds working cells from a snapshot.
pub fn restore_cells(snapshot: &Snapshot) -> Vec<Cell> {
    snapshot
        .cells
        .iter()
        .map(|sc| {
            let mut cell = Cell::from_object(sc.object.clone(), sc.current.time_secs);
            cell.current = sc.current;
            cell.track = Some(sc.track.clone());
            cell
        })
        .collect()
}

fn io_to_store(e: std::io::Error) -> StoreError {
    StoreError::Db(sled::Error::Io(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::lineage::TrackState;
    use crate::scan::test_support::cell_at;
    use crate::store::TrackStore;

    fn grid() -> GridGeom {
        GridGeom { min_x: -100.0, min_y: -100.0, dx: 1.0, dy: 1.0 }
    }

    fn tracked_cells(n: usize) -> (tempfile::TempDir, Vec<Cell>) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrackStore::create(dir.path(), &TrackerConfig::default()).unwrap();
        let cells = (0..n)
            .map(|k| {
                let mut cell = cell_at(k as f64 * 10.0, 0.0, 3.0, &grid(), 600);
                let mut track = TrackState::init_new(&mut store, 0, 600, None).unwrap();
                track.enter_scan(cell.current, 0, 4);
                cell.track = Some(track);
                cell
            })
            .collect();
        (dir, cells)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (dir, cells) = tracked_cells(3);
        let tag = Uuid::new_v4();

        save(dir.path(), tag, 7, 600, grid(), &cells, 3).unwrap();
        let snapshot = load(dir.path()).expect("snapshot should load");

        assert_eq!(snapshot.modify_code, tag);
        assert_eq!(snapshot.last_scan, 7);
        assert_eq!(snapshot.cells.len(), 3);
        assert_eq!(snapshot.n_lineages, 3);

        let restored = restore_cells(&snapshot);
        assert_eq!(restored.len(), 3);
        assert_eq!(
            restored[1].track.as_ref().unwrap().lineage,
            cells[1].track.as_ref().unwrap().lineage
        );
        assert_eq!(restored[2].current.centroid_x, 20.0);
    }

    #[test]
    fn test_incomplete_snapshot_rejected() {
        let (dir, cells) = tracked_cells(1);
        save(dir.path(), Uuid::new_v4(), 0, 0, grid(), &cells, 1).unwrap();

        // Flip the completeness flag on disk.
        let path = snapshot_path(dir.path());
        let data = fs::read_to_string(&path).unwrap();
        fs::write(&path, data.replace("\"complete\":true", "\"complete\":false")).unwrap();

        assert!(load(dir.path()).is_none());
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let (dir, cells) = tracked_cells(1);
        save(dir.path(), Uuid::new_v4(), 0, 0, grid(), &cells, 1).unwrap();
        let path = snapshot_path(dir.path());
        fs::write(&path, b"{not json").unwrap();
        assert!(load(dir.path()).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (dir, cells) = tracked_cells(1);
        save(dir.path(), Uuid::new_v4(), 0, 0, grid(), &cells, 1).unwrap();
        remove(dir.path());
        assert!(load(dir.path()).is_none());
        remove(dir.path());
    }
}
