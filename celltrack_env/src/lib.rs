//! Celltrack Environment Abstraction Layer
//!
//! This crate is the seam between the tracking engine and the outside world.
//! The engine never talks to a transport directly; it sees only:
//! - a read-only **scan source handle** (`ScanSource`) supplying one
//!   time-step of detected storm cells at a time,
//! - a two-flag **control mailbox** (`Mailbox`) carrying "new scan data
//!   ready" and "shutdown requested" signals from an external producer,
//! - **locks** guarding the output directory and the per-scan mutation
//!   window of the persistent store.
//!
//! Keeping these behind traits/types lets the simulation harness drive the
//! engine with an in-memory world and no producer process at all.

mod error;
mod lock;
mod mailbox;
mod source;
mod types;

pub use error::EnvError;
pub use lock::{DirLock, ScanWindowLock};
pub use mailbox::{ControlRequest, Mailbox, OperatingMode, Signal};
pub use source::{JsonScanSource, ScanSource};
pub use types::{GridBox, GridGeom, Run, Scan, ScanObject};
