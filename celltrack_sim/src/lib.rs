//! Deterministic simulation harness for the celltrack engine.
//!
//! Scripts ground-truth storm scenarios (continuation, births and deaths,
//! merges, splits, mixed clusters, crashes, time gaps), drives the real
//! tracking orchestrator over their rendered scans, and checks the
//! engine's structural invariants after every committed scan. All entropy
//! derives from one 64-bit seed, so any failure is reproducible from its
//! seed number.

pub mod oracle;
pub mod runner;
pub mod scenarios;
pub mod world;

pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use world::{SharedScanSource, StormWorld, TruthCell};
