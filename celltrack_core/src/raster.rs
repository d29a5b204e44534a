//! The shared overlap raster.
//!
//! Two storm footprints are rendered into one small grid covering the union
//! of their bounding boxes, one bit per layer, and the overlap is read off
//! as cell counts. Fill is by polygon scanline (even-odd rule over cell
//! centers) or by run-length spans, depending on what the source carries.

use celltrack_env::{GridBox, GridGeom, Run};

/// Bit marking the projected previous-scan footprint.
pub const LAYER_PREV: u8 = 0b01;
/// Bit marking the current-scan footprint.
pub const LAYER_CURRENT: u8 = 0b10;

/// Cell counts for the two layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlapCounts {
    /// Cells touched by the previous layer only
    pub n_prev_only: usize,
    /// Cells touched by the current layer only
    pub n_current_only: usize,
    /// Cells touched by both
    pub n_both: usize,
}

impl OverlapCounts {
    /// Total cells of the previous footprint.
    pub fn n_prev(&self) -> usize {
        self.n_prev_only + self.n_both
    }

    /// Total cells of the current footprint.
    pub fn n_current(&self) -> usize {
        self.n_current_only + self.n_both
    }
}

/// A small raster frame over a bounding box, one byte of layer bits per
/// cell.
pub struct OverlapRaster {
    frame: GridBox,
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl OverlapRaster {
    /// Allocates a raster covering `frame`.
    pub fn new(frame: GridBox) -> Self {
        let width = frame.width();
        let height = frame.height();
        Self { frame, width, height, cells: vec![0; width * height] }
    }

    /// Marks one cell, ignoring cells outside the frame.
    fn mark(&mut self, col: i64, row: i64, layer: u8) {
        if col < self.frame.min_ix
            || col > self.frame.max_ix
            || row < self.frame.min_iy
            || row > self.frame.max_iy
        {
            return;
        }
        let c = (col - self.frame.min_ix) as usize;
        let r = (row - self.frame.min_iy) as usize;
        self.cells[r * self.width + c] |= layer;
    }

    /// Fills a polygon given in world coordinates: every cell whose center
    /// falls inside (even-odd rule) is marked.
    pub fn fill_polygon(&mut self, vertices: &[(f64, f64)], grid: &GridGeom, layer: u8) {
        if vertices.len() < 3 {
            return;
        }
        for row in self.frame.min_iy..=self.frame.max_iy {
            let y = grid.y_for_row(row);

            // Collect x crossings of polygon edges with this row of cell
            // centers.
            let mut crossings: Vec<f64> = Vec::new();
            for i in 0..vertices.len() {
                let (x1, y1) = vertices[i];
                let (x2, y2) = vertices[(i + 1) % vertices.len()];
                // Half-open rule so a vertex exactly on the row is counted
                // once.
                if (y1 <= y && y < y2) || (y2 <= y && y < y1) {
                    let t = (y - y1) / (y2 - y1);
                    crossings.push(x1 + t * (x2 - x1));
                }
            }
            crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            // Fill between alternate crossing pairs.
            for pair in crossings.chunks(2) {
                if pair.len() < 2 {
                    break;
                }
                let start = grid.col_for_x(pair[0]);
                let end = grid.col_for_x(pair[1]);
                for col in start..=end {
                    let x = grid.x_for_col(col);
                    if x >= pair[0] && x <= pair[1] {
                        self.mark(col, row, layer);
                    }
                }
            }
        }
    }

    /// Fills run-length spans, translated by whole cells.
    pub fn fill_runs(&mut self, runs: &[Run], shift_cols: i64, shift_rows: i64, layer: u8) {
        for run in runs {
            let row = run.row + shift_rows;
            for i in 0..run.len as i64 {
                self.mark(run.start_col + shift_cols + i, row, layer);
            }
        }
    }

    /// Counts cells per layer combination.
    pub fn counts(&self) -> OverlapCounts {
        let mut counts = OverlapCounts::default();
        for &cell in &self.cells {
            match cell {
                x if x == LAYER_PREV => counts.n_prev_only += 1,
                x if x == LAYER_CURRENT => counts.n_current_only += 1,
                x if x == LAYER_PREV | LAYER_CURRENT => counts.n_both += 1,
                _ => {}
            }
        }
        counts
    }

    /// The frame this raster covers.
    pub fn frame(&self) -> &GridBox {
        &self.frame
    }

    #[allow(dead_code)]
    pub(crate) fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// Converts a radial-ray boundary into polygon vertices, scaled about the
/// anchor point by `length_ratio`.
///
/// Ray 0 points at azimuth 0 (grid north, +y); azimuths step clockwise.
pub fn rays_to_vertices(
    rays: &[f64],
    anchor_x: f64,
    anchor_y: f64,
    length_ratio: f64,
) -> Vec<(f64, f64)> {
    let n = rays.len();
    let mut vertices = Vec::with_capacity(n);
    for (k, &r) in rays.iter().enumerate() {
        let az = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
        let scaled = r * length_ratio;
        vertices.push((anchor_x + scaled * az.sin(), anchor_y + scaled * az.cos()));
    }
    vertices
}
