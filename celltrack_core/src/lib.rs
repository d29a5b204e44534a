//! Celltrack Core - Storm-Cell Association and Track Consolidation Engine
//!
//! This library maintains a persistent database of storm-cell lineages
//! across a time-ordered sequence of radar scans:
//! 1. **Association**: overlap-based matching of projected shapes, fan
//!    limiting, and residual optimal assignment
//! 2. **Topology**: birth/death/continuation/split/merge classification and
//!    connected-component consolidation of lineage groups
//! 3. **Forecasting**: per-lineage trend extraction and spatial smoothing
//! 4. **Persistence**: a crash-safe header/entry-log store with a restart
//!    snapshot fast path

pub mod assign;
pub mod bounds;
pub mod classify;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod fan;
pub mod forecast;
pub mod lineage;
pub mod orchestrator;
pub mod overlap;
pub mod raster;
pub mod scan;
pub mod snapshot;
pub mod store;

// Re-export key types for convenience
pub use config::{ForecastMode, TrackerConfig};
pub use error::TrackError;
pub use lineage::{CellProps, GroupId, LineageId, Rates, TrackState, WorkingStatus};
pub use orchestrator::Tracker;
pub use scan::Cell;
pub use store::{GroupRecord, HeaderRecord, LineageRecord, StoreError, TrackEntry, TrackStore};
