//! Wire-level scan records.
//!
//! One `Scan` is one discrete time-step's full set of detected storm cells,
//! exactly as the upstream identification stage produced them. These records
//! are read-only to the tracker; all mutable bookkeeping lives in the
//! engine's own working structures.

use serde::{Deserialize, Serialize};

/// Grid geometry for one scan: the Cartesian radar grid the storm shapes
/// are expressed on. Distances are km, areas km².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeom {
    /// X coordinate of the center of cell column 0
    pub min_x: f64,
    /// Y coordinate of the center of cell row 0
    pub min_y: f64,
    /// Cell width (km)
    pub dx: f64,
    /// Cell height (km)
    pub dy: f64,
}

impl GridGeom {
    /// Area of one grid cell in km².
    pub fn cell_area(&self) -> f64 {
        self.dx * self.dy
    }

    /// Converts an x coordinate to the nearest cell column.
    pub fn col_for_x(&self, x: f64) -> i64 {
        ((x - self.min_x) / self.dx + 0.5).floor() as i64
    }

    /// Converts a y coordinate to the nearest cell row.
    pub fn row_for_y(&self, y: f64) -> i64 {
        ((y - self.min_y) / self.dy + 0.5).floor() as i64
    }

    /// X coordinate of the center of a cell column.
    pub fn x_for_col(&self, col: i64) -> f64 {
        self.min_x + col as f64 * self.dx
    }

    /// Y coordinate of the center of a cell row.
    pub fn y_for_row(&self, row: i64) -> f64 {
        self.min_y + row as f64 * self.dy
    }
}

/// Integer bounding box in grid cells, inclusive on all sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBox {
    pub min_ix: i64,
    pub min_iy: i64,
    pub max_ix: i64,
    pub max_iy: i64,
}

impl GridBox {
    /// Does this box share at least one cell with `other`?
    pub fn intersects(&self, other: &GridBox) -> bool {
        self.min_ix <= other.max_ix
            && other.min_ix <= self.max_ix
            && self.min_iy <= other.max_iy
            && other.min_iy <= self.max_iy
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &GridBox) -> GridBox {
        GridBox {
            min_ix: self.min_ix.min(other.min_ix),
            min_iy: self.min_iy.min(other.min_iy),
            max_ix: self.max_ix.max(other.max_ix),
            max_iy: self.max_iy.max(other.max_iy),
        }
    }

    /// Number of cell columns spanned.
    pub fn width(&self) -> usize {
        (self.max_ix - self.min_ix + 1).max(0) as usize
    }

    /// Number of cell rows spanned.
    pub fn height(&self) -> usize {
        (self.max_iy - self.min_iy + 1).max(0) as usize
    }
}

/// One horizontal span of a run-length-encoded storm footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Grid row of the span
    pub row: i64,
    /// First column covered
    pub start_col: i64,
    /// Number of columns covered
    pub len: u32,
}

/// One detected storm cell at one scan time.
///
/// The polygon boundary is stored as `rays.len()` equally-spaced radial
/// distances from the centroid, the first ray at azimuth 0 (grid north),
/// stepping clockwise. The run-length footprint is optional; sources that
/// carry it enable run-based overlap matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanObject {
    /// Centroid of the projected area (km)
    pub centroid_x: f64,
    pub centroid_y: f64,

    /// Echo-top height (km)
    pub top: f64,
    /// Cell volume (km³)
    pub volume: f64,
    /// Cell mass (ktons)
    pub mass: f64,
    /// Precipitation flux (m³/s)
    pub flux: f64,
    /// Peak intensity (dBZ-equivalent)
    pub intensity_max: f64,
    /// Mean intensity
    pub intensity_mean: f64,
    /// Height of the volume centroid (km)
    pub height: f64,
    /// Height of the intensity-weighted centroid (km)
    pub intensity_centroid_z: f64,
    /// Projected area (km²)
    pub area: f64,

    /// Height of the strongest-echo layer (km); shape descriptor for the
    /// regression forecast
    pub ht_of_intensity_max: f64,
    /// 98th percentile of the intensity distribution; shape descriptor for
    /// the regression forecast
    pub intensity_p98: f64,

    /// Polygon boundary: equally-spaced radial distances from the centroid
    pub rays: Vec<f64>,
    /// Integer bounding box in grid cells
    pub bbox: GridBox,
    /// Optional run-length footprint
    pub runs: Option<Vec<Run>>,
}

/// One time-step's full set of detected storm cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    /// Monotonically increasing scan index
    pub index: usize,
    /// Scan time, seconds since the Unix epoch
    pub time_secs: i64,
    /// Grid the shapes are expressed on
    pub grid: GridGeom,
    /// Detected cells
    pub objects: Vec<ScanObject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gridbox_intersects() {
        let a = GridBox { min_ix: 0, min_iy: 0, max_ix: 10, max_iy: 10 };
        let b = GridBox { min_ix: 10, min_iy: 5, max_ix: 20, max_iy: 15 };
        let c = GridBox { min_ix: 11, min_iy: 11, max_ix: 12, max_iy: 12 };

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_gridbox_union() {
        let a = GridBox { min_ix: 0, min_iy: 2, max_ix: 4, max_iy: 6 };
        let b = GridBox { min_ix: -3, min_iy: 4, max_ix: 2, max_iy: 9 };
        let u = a.union(&b);
        assert_eq!(u, GridBox { min_ix: -3, min_iy: 2, max_ix: 4, max_iy: 9 });
        assert_eq!(u.width(), 8);
        assert_eq!(u.height(), 8);
    }

    #[test]
    fn test_grid_coordinate_roundtrip() {
        let grid = GridGeom { min_x: -150.0, min_y: -150.0, dx: 1.0, dy: 1.0 };
        assert_eq!(grid.col_for_x(-150.0), 0);
        assert_eq!(grid.col_for_x(-149.0), 1);
        assert_eq!(grid.x_for_col(3), -147.0);
        assert_eq!(grid.row_for_y(grid.y_for_row(42)), 42);
    }
}
