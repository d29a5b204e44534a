//! Ground truth world for simulation.
//!
//! The world maintains the "truth" side of a scenario: circular storm
//! cells with position, drift and growth, stepped forward in time and
//! rendered into the same `Scan` records the production scan source
//! produces, with optional measurement noise.

use celltrack_env::{EnvError, GridBox, GridGeom, Scan, ScanObject, ScanSource};
use nalgebra::Vector2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex};

/// Number of boundary rays rendered per cell.
const N_RAYS: usize = 36;

/// One true storm cell.
#[derive(Debug, Clone)]
pub struct TruthCell {
    pub id: u64,
    /// Centroid (km)
    pub position: Vector2<f64>,
    /// Drift (km/hr)
    pub velocity: Vector2<f64>,
    /// Radius (km)
    pub radius: f64,
    /// Radius growth (km/hr)
    pub growth: f64,
    pub active: bool,
}

/// The ground-truth world: spawns, steps and renders storm cells.
pub struct StormWorld {
    rng: ChaCha8Rng,
    cells: Vec<TruthCell>,
    next_id: u64,
    /// Current world time (seconds)
    time_secs: i64,
    grid: GridGeom,
    /// Centroid noise applied when rendering (km)
    position_noise: f64,
}

impl StormWorld {
    /// Creates a world with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            cells: Vec::new(),
            next_id: 0,
            time_secs: 0,
            grid: GridGeom { min_x: -150.0, min_y: -150.0, dx: 1.0, dy: 1.0 },
            position_noise: 0.0,
        }
    }

    /// Sets the rendering noise standard deviation.
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise = std_dev;
    }

    /// The grid scans are rendered on.
    pub fn grid(&self) -> GridGeom {
        self.grid
    }

    /// Current world time.
    pub fn time_secs(&self) -> i64 {
        self.time_secs
    }

    /// Spawns a new cell and returns its id.
    pub fn spawn(&mut self, x: f64, y: f64, radius: f64, vx: f64, vy: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.cells.push(TruthCell {
            id,
            position: Vector2::new(x, y),
            velocity: Vector2::new(vx, vy),
            radius,
            growth: 0.0,
            active: true,
        });
        id
    }

    /// Removes a cell from the world (death).
    pub fn kill(&mut self, id: u64) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.active = false;
        }
    }

    /// Mutable access to one cell, for scenario scripting.
    pub fn cell_mut(&mut self, id: u64) -> Option<&mut TruthCell> {
        self.cells.iter_mut().find(|c| c.id == id)
    }

    /// Replaces one cell by two fragments offset sideways (a true split).
    pub fn split(&mut self, id: u64, separation: f64) -> Option<(u64, u64)> {
        let parent = self.cells.iter().find(|c| c.id == id && c.active)?.clone();
        self.kill(id);
        let r = parent.radius / 2.0_f64.sqrt();
        let a = self.spawn(
            parent.position.x - separation / 2.0,
            parent.position.y,
            r,
            parent.velocity.x,
            parent.velocity.y,
        );
        let b = self.spawn(
            parent.position.x + separation / 2.0,
            parent.position.y,
            r,
            parent.velocity.x,
            parent.velocity.y,
        );
        Some((a, b))
    }

    /// Replaces two cells by one covering both (a true merge).
    pub fn merge(&mut self, id_a: u64, id_b: u64) -> Option<u64> {
        let a = self.cells.iter().find(|c| c.id == id_a && c.active)?.clone();
        let b = self.cells.iter().find(|c| c.id == id_b && c.active)?.clone();
        self.kill(id_a);
        self.kill(id_b);
        let center = (a.position + b.position) / 2.0;
        let spread = (b.position - a.position).norm() / 2.0;
        let radius = (a.radius * a.radius + b.radius * b.radius).sqrt() + spread;
        let velocity = (a.velocity + b.velocity) / 2.0;
        Some(self.spawn(center.x, center.y, radius, velocity.x, velocity.y))
    }

    /// Advances the world by `dt_secs`.
    pub fn step(&mut self, dt_secs: i64) {
        let dt_hours = dt_secs as f64 / 3600.0;
        self.time_secs += dt_secs;
        for cell in self.cells.iter_mut().filter(|c| c.active) {
            cell.position += cell.velocity * dt_hours;
            cell.radius = (cell.radius + cell.growth * dt_hours).max(0.5);
        }
    }

    /// Renders the current world into a scan record.
    pub fn render_scan(&mut self, index: usize) -> Scan {
        let noise = Normal::new(0.0, self.position_noise.max(1e-12)).unwrap();
        let mut objects = Vec::new();
        for cell in self.cells.iter().filter(|c| c.active) {
            let jitter = if self.position_noise > 0.0 {
                Vector2::new(noise.sample(&mut self.rng), noise.sample(&mut self.rng))
            } else {
                Vector2::zeros()
            };
            objects.push(render_object(cell, jitter, &self.grid));
        }

        Scan { index, time_secs: self.time_secs, grid: self.grid, objects }
    }
}

/// Renders one truth cell as a circular scan object.
fn render_object(cell: &TruthCell, jitter: Vector2<f64>, grid: &GridGeom) -> ScanObject {
    let center = cell.position + jitter;
    let r = cell.radius;
    let area = std::f64::consts::PI * r * r;

    ScanObject {
        centroid_x: center.x,
        centroid_y: center.y,
        top: 8.0 + r * 0.2,
        volume: area * 5.0,
        mass: area * 2.5,
        flux: area * 10.0,
        intensity_max: 50.0 + r,
        intensity_mean: 35.0 + r * 0.5,
        height: 4.0,
        intensity_centroid_z: 3.5,
        area,
        ht_of_intensity_max: 4.5,
        intensity_p98: 48.0 + r,
        rays: vec![r; N_RAYS],
        bbox: GridBox {
            min_ix: grid.col_for_x(center.x - r),
            min_iy: grid.row_for_y(center.y - r),
            max_ix: grid.col_for_x(center.x + r),
            max_iy: grid.row_for_y(center.y + r),
        },
        runs: None,
    }
}

// ============================================================================
// SHARED SCAN SOURCE
// ============================================================================

/// A scan source fed incrementally by the scenario runner, standing in for
/// the external producer process: the runner appends rendered scans, the
/// tracker polls them through the normal `ScanSource` interface.
#[derive(Clone)]
pub struct SharedScanSource {
    scans: Arc<Mutex<Vec<Scan>>>,
}

impl SharedScanSource {
    pub fn new() -> Self {
        Self { scans: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Appends one scan (the producer side).
    pub fn push(&self, scan: Scan) {
        self.scans.lock().expect("scan source poisoned").push(scan);
    }
}

impl Default for SharedScanSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSource for SharedScanSource {
    fn refresh(&mut self) -> Result<(), EnvError> {
        Ok(())
    }

    fn n_scans(&self) -> usize {
        self.scans.lock().expect("scan source poisoned").len()
    }

    fn load_scan(&self, index: usize) -> Result<Scan, EnvError> {
        let scans = self.scans.lock().expect("scan source poisoned");
        scans.get(index).cloned().ok_or(EnvError::ScanOutOfRange { index, count: scans.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_step_moves_cells() {
        let mut world = StormWorld::new(42);
        let id = world.spawn(0.0, 0.0, 5.0, 20.0, 0.0);
        world.step(1800); // half an hour

        let cell = world.cell_mut(id).unwrap();
        assert!((cell.position.x - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic_rendering() {
        let build = || {
            let mut world = StormWorld::new(7);
            world.set_position_noise(0.5);
            world.spawn(0.0, 0.0, 5.0, 10.0, 0.0);
            world.step(300);
            world.render_scan(0)
        };
        let a = build();
        let b = build();
        assert_eq!(a.objects[0].centroid_x, b.objects[0].centroid_x);
    }

    #[test]
    fn test_split_conserves_rough_area() {
        let mut world = StormWorld::new(1);
        let id = world.spawn(0.0, 0.0, 6.0, 0.0, 0.0);
        let (a, b) = world.split(id, 8.0).unwrap();

        let scan = world.render_scan(0);
        assert_eq!(scan.objects.len(), 2);
        let total: f64 = scan.objects.iter().map(|o| o.area).sum();
        let original = std::f64::consts::PI * 36.0;
        assert!((total - original).abs() / original < 0.01);
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_source_grows() {
        let source = SharedScanSource::new();
        let producer = source.clone();

        let mut world = StormWorld::new(3);
        world.spawn(0.0, 0.0, 4.0, 0.0, 0.0);
        producer.push(world.render_scan(0));

        assert_eq!(source.n_scans(), 1);
        assert!(source.load_scan(0).is_ok());
        assert!(source.load_scan(1).is_err());
    }
}
