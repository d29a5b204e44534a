//! Scenario runner.
//!
//! Each scenario scripts a ground-truth world, feeds its rendered scans to
//! a real `Tracker` through the shared scan source (playing the producer
//! role), and checks the invariant oracle after every committed scan plus
//! scenario-specific expectations at the end.

use celltrack_core::{LineageId, Rates, TrackEntry, TrackStore, Tracker, TrackerConfig};
use celltrack_env::ScanSource;
use tracing::debug;

use crate::oracle;
use crate::scenarios::ScenarioId;
use crate::world::{SharedScanSource, StormWorld};

/// Scan cadence used by every scenario (seconds).
const SCAN_INTERVAL: i64 = 300;

/// Outcome of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,
    pub scans_tracked: usize,
    pub n_lineages: u64,
    pub n_groups: u64,
    pub failure_reason: Option<String>,
}

/// Runs scenarios with a fixed seed and scan count.
pub struct ScenarioRunner {
    seed: u64,
    n_scans: usize,
}

impl ScenarioRunner {
    pub fn new(seed: u64, n_scans: usize) -> Self {
        Self { seed, n_scans: n_scans.max(4) }
    }

    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let outcome = match scenario {
            ScenarioId::Continuation => self.run_continuation(),
            ScenarioId::BirthDeath => self.run_birth_death(),
            ScenarioId::Merge => self.run_merge(),
            ScenarioId::Split => self.run_split(),
            ScenarioId::MixedCluster => self.run_mixed_cluster(),
            ScenarioId::CrashMidWrite => self.run_crash_mid_write(),
            ScenarioId::TimeGap => self.run_time_gap(),
        };

        match outcome {
            Ok((scans_tracked, n_lineages, n_groups)) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: true,
                scans_tracked,
                n_lineages,
                n_groups,
                failure_reason: None,
            },
            Err(reason) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                scans_tracked: 0,
                n_lineages: 0,
                n_groups: 0,
                failure_reason: Some(reason),
            },
        }
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    fn run_continuation(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        harness.world.spawn(0.0, 0.0, 5.0, 12.0, 6.0);
        harness.bootstrap()?;

        for _ in 1..self.n_scans {
            harness.advance(SCAN_INTERVAL)?;
        }

        harness.expect_counts(1, 1)?;
        if !harness.tracker.live_cells()[0].status.continues {
            return Err("cell did not continue on the last scan".into());
        }
        harness.finish(self.n_scans)
    }

    fn run_birth_death(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        let first = harness.world.spawn(0.0, 0.0, 5.0, 10.0, 0.0);
        harness.bootstrap()?;

        for iscan in 1..self.n_scans {
            if iscan == 2 {
                harness.world.spawn(60.0, 60.0, 4.0, -8.0, 0.0);
            }
            if iscan == self.n_scans - 2 {
                harness.world.kill(first);
            }
            harness.advance(SCAN_INTERVAL)?;
        }

        harness.expect_counts(2, 2)?;
        harness.finish(self.n_scans)
    }

    fn run_merge(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        let a = harness.world.spawn(-16.0, 0.0, 5.0, 12.0, 0.0);
        let b = harness.world.spawn(16.0, 0.0, 5.0, -12.0, 0.0);
        harness.bootstrap()?;

        let merge_at = 4;
        for iscan in 1..self.n_scans {
            if iscan == merge_at {
                harness.world.merge(a, b).ok_or("merge script failed")?;
            }
            harness.advance(SCAN_INTERVAL)?;
        }

        // Two parents plus the combined lineage, in one united group.
        harness.expect_counts(3, 1)?;
        harness.finish(self.n_scans)
    }

    fn run_split(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        let parent = harness.world.spawn(0.0, 0.0, 8.0, 6.0, 0.0);
        harness.bootstrap()?;

        let split_at = 4;
        for iscan in 1..self.n_scans {
            if iscan == split_at {
                harness.world.split(parent, 12.0).ok_or("split script failed")?;
            }
            harness.advance(SCAN_INTERVAL)?;
        }

        // The parent plus two children, all in the original group.
        harness.expect_counts(3, 1)?;
        harness.finish(self.n_scans)
    }

    fn run_mixed_cluster(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        let a = harness.world.spawn(-6.0, 0.0, 6.0, 0.0, 0.0);
        let b = harness.world.spawn(10.0, 0.0, 6.0, 0.0, 0.0);
        harness.bootstrap()?;

        let rearrange_at = 4;
        for iscan in 1..self.n_scans {
            if iscan == rearrange_at {
                // One fragment stays under the first parent; the other
                // straddles both: a merge and a split in one cluster.
                harness.world.kill(a);
                harness.world.kill(b);
                harness.world.spawn(-9.0, 0.0, 4.0, 0.0, 0.0);
                harness.world.spawn(2.0, 0.0, 7.0, 0.0, 0.0);
            }
            harness.advance(SCAN_INTERVAL)?;
        }

        // Two parents plus two combined children, one united group.
        harness.expect_counts(4, 1)?;
        harness.finish(self.n_scans)
    }

    fn run_time_gap(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        harness.world.spawn(0.0, 0.0, 5.0, 10.0, 0.0);
        harness.bootstrap()?;

        harness.advance(SCAN_INTERVAL)?;
        // A gap past the matching limit: the engine must log, skip
        // matching, and rebirth the cell rather than fail.
        harness.advance(100_000)?;
        harness.advance(SCAN_INTERVAL)?;

        harness.expect_counts(2, 2)?;
        harness.finish(4)
    }

    fn run_crash_mid_write(&self) -> Result<(usize, u64, u64), String> {
        let mut harness = SimHarness::new(self.seed)?;
        harness.world.spawn(0.0, 0.0, 5.0, 10.0, 0.0);
        harness.bootstrap()?;
        harness.advance(SCAN_INTERVAL)?;
        harness.advance(SCAN_INTERVAL)?;

        let SimHarness { dir, world: _, source, tracker, config } = harness;
        drop(tracker);

        // Simulate dying inside WRITE_ENTRIES: the header was cleared and
        // never set valid again. A sentinel entry marks the old log so a
        // (forbidden) resume would be detectable.
        {
            let mut store =
                TrackStore::open(dir.path()).map_err(|e| e.to_string())?;
            store
                .append_entry(&TrackEntry {
                    lineage: LineageId(9999),
                    group: celltrack_core::GroupId(0),
                    scan: 99,
                    cell_index: 0,
                    time_secs: 0,
                    history_in_scans: 0,
                    history_in_secs: 0,
                    duration_in_scans: 0,
                    duration_in_secs: 0,
                    forecast_valid: false,
                    rates: Rates::default(),
                    prev_in_lineage: None,
                    prev_in_scan: None,
                })
                .map_err(|e| e.to_string())?;
            store.set_invalid().map_err(|e| e.to_string())?;
        }

        // Restart: the invalid header must force a full retrack on a fresh
        // store, never a fast resume over the suspect log.
        let mut restarted = Tracker::new(config.clone(), dir.path(), source.clone());
        restarted.prepare_for_append().map_err(|e| e.to_string())?;

        let store = restarted.store().ok_or("restarted tracker has no store")?;
        let header = store.header().map_err(|e| e.to_string())?;
        if !header.valid {
            return Err("restarted store did not commit".into());
        }
        let sentinel_alive = store
            .entries_from(0)
            .filter_map(|e| e.ok())
            .any(|(_, entry)| entry.scan == 99);
        if sentinel_alive {
            return Err("tracker resumed over an invalid header".into());
        }

        oracle::check_all(store, restarted.live_cells(), &config)?;
        Ok((3, store.n_lineages(), store.n_groups()))
    }
}

// ======================================================================
// HARNESS
// ======================================================================

/// One scenario's shared machinery: the world, the producer-side scan
/// source, and a tracker over a scratch store directory.
struct SimHarness {
    dir: tempfile::TempDir,
    world: StormWorld,
    source: SharedScanSource,
    tracker: Tracker<SharedScanSource>,
    config: TrackerConfig,
}

impl SimHarness {
    fn new(seed: u64) -> Result<Self, String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let mut world = StormWorld::new(seed);
        world.set_position_noise(0.05);
        let source = SharedScanSource::new();
        let config = TrackerConfig::default();
        let tracker = Tracker::new(config.clone(), dir.path(), source.clone());
        Ok(Self { dir, world, source, tracker, config })
    }

    /// Renders scan 0 and prepares the store.
    fn bootstrap(&mut self) -> Result<(), String> {
        let scan = self.world.render_scan(0);
        self.source.push(scan);
        self.tracker.prepare_new().map_err(|e| e.to_string())?;
        self.check()
    }

    /// Steps the world, publishes the next scan, tracks it, and checks
    /// the oracle.
    fn advance(&mut self, dt_secs: i64) -> Result<(), String> {
        self.world.step(dt_secs);
        let index = self.source.n_scans();
        let scan = self.world.render_scan(index);
        debug!(index, n_objects = scan.objects.len(), "publishing scan");
        self.source.push(scan);
        self.tracker.track_last_scan().map_err(|e| e.to_string())?;
        self.check()
    }

    fn check(&self) -> Result<(), String> {
        let store = self.tracker.store().ok_or("tracker has no store")?;
        oracle::check_all(store, self.tracker.live_cells(), &self.config)
    }

    fn expect_counts(&self, n_lineages: u64, n_groups: u64) -> Result<(), String> {
        let store = self.tracker.store().ok_or("tracker has no store")?;
        if store.n_lineages() != n_lineages {
            return Err(format!(
                "expected {} lineages, store has {}",
                n_lineages,
                store.n_lineages()
            ));
        }
        if store.n_groups() != n_groups {
            return Err(format!(
                "expected {} groups, store has {}",
                n_groups,
                store.n_groups()
            ));
        }
        Ok(())
    }

    fn finish(self, scans_tracked: usize) -> Result<(usize, u64, u64), String> {
        let store = self.tracker.store().ok_or("tracker has no store")?;
        Ok((scans_tracked, store.n_lineages(), store.n_groups()))
    }
}
