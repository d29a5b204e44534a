//! Scan loading: turning one scan's read-only records into working cells.
//!
//! A `Cell` pairs the immutable `ScanObject` from the source with the
//! mutable per-transition scratch (`WorkingStatus`) and, once the lifecycle
//! has resolved it, the lineage cursor (`TrackState`). Previous-scan cells
//! always carry a track; current-scan cells acquire one during the
//! transition.

use celltrack_env::{GridBox, Scan, ScanObject};

use crate::lineage::{CellProps, TrackState, WorkingStatus};

/// One storm cell being worked on during a scan transition.
#[derive(Debug, Clone)]
pub struct Cell {
    /// The read-only source record
    pub object: ScanObject,
    /// Scalar snapshot of the object at this scan
    pub current: CellProps,
    /// Per-transition scratch
    pub status: WorkingStatus,
    /// Lineage cursor; `None` until the lifecycle step assigns one
    pub track: Option<TrackState>,
    /// Bounding box used for overlap candidate pruning (the forecast box
    /// for previous-scan cells, the real box for current-scan cells)
    pub box_for_overlap: GridBox,
}

impl Cell {
    /// Builds a working cell from a source object.
    pub fn from_object(object: ScanObject, time_secs: i64) -> Self {
        let current = CellProps {
            time_secs,
            centroid_x: object.centroid_x,
            centroid_y: object.centroid_y,
            height: object.height,
            intensity_centroid_z: object.intensity_centroid_z,
            top: object.top,
            intensity_max: object.intensity_max,
            intensity_mean: object.intensity_mean,
            volume: object.volume,
            flux: object.flux,
            mass: object.mass,
            area: object.area,
        };
        let box_for_overlap = object.bbox;
        Self {
            object,
            current,
            status: WorkingStatus::default(),
            track: None,
            box_for_overlap,
        }
    }
}

/// Loads all of one scan's objects into working cells.
pub fn load_cells(scan: &Scan) -> Vec<Cell> {
    scan.objects
        .iter()
        .map(|object| Cell::from_object(object.clone(), scan.time_secs))
        .collect()
}

/// Resets the working state of carried-forward cells for a new transition.
pub fn reset_for_transition(cells: &mut [Cell]) {
    for cell in cells {
        cell.status.reset();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use celltrack_env::GridGeom;

    #[test]
    fn test_load_cells_snapshots_scalars() {
        let grid = GridGeom { min_x: 0.0, min_y: 0.0, dx: 1.0, dy: 1.0 };
        let scan = Scan {
            index: 0,
            time_secs: 1000,
            grid,
            objects: vec![test_support::circular_object(10.0, 20.0, 3.0, &grid)],
        };

        let cells = load_cells(&scan);
        assert_eq!(cells.len(), 1);
        let cell = &cells[0];
        assert_eq!(cell.current.time_secs, 1000);
        assert_eq!(cell.current.centroid_x, 10.0);
        assert_eq!(cell.current.area, cell.object.area);
        assert!(cell.track.is_none());
        assert_eq!(cell.box_for_overlap, cell.object.bbox);
    }
}
