//! The read-only scan source handle.
//!
//! The tracker re-reads the full index context on every invocation instead
//! of diffing incrementally: a producer may have appended scans (or replaced
//! the file wholesale) since the last poll, and the file is the only truth.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EnvError;
use crate::types::Scan;

/// Supplier of time-ordered scans to the tracking engine.
///
/// Implementations must treat the underlying data as append-only between
/// `refresh()` calls: scan indices already handed out never change meaning.
pub trait ScanSource {
    /// Re-reads the source so that `n_scans()` reflects any newly
    /// appended scans.
    fn refresh(&mut self) -> Result<(), EnvError>;

    /// Number of scans currently available.
    fn n_scans(&self) -> usize;

    /// Loads one scan by index.
    fn load_scan(&self, index: usize) -> Result<Scan, EnvError>;
}

/// Scan source backed by a single JSON file holding an array of scans.
///
/// `refresh()` re-opens and re-parses the whole file, mirroring the
/// close-and-reopen discipline the producer contract requires.
pub struct JsonScanSource {
    path: PathBuf,
    scans: Vec<Scan>,
}

impl JsonScanSource {
    /// Opens and reads the scan file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EnvError> {
        let mut source = Self {
            path: path.as_ref().to_path_buf(),
            scans: Vec::new(),
        };
        source.refresh()?;
        Ok(source)
    }

    /// The path this source reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScanSource for JsonScanSource {
    fn refresh(&mut self) -> Result<(), EnvError> {
        let data = fs::read_to_string(&self.path)?;
        let scans: Vec<Scan> = serde_json::from_str(&data)
            .map_err(|e| EnvError::parse(format!("{}: {}", self.path.display(), e)))?;

        // Scan indices must match positions; a producer that violates this
        // has handed us a corrupt file.
        for (i, scan) in scans.iter().enumerate() {
            if scan.index != i {
                return Err(EnvError::parse(format!(
                    "{}: scan at position {} carries index {}",
                    self.path.display(),
                    i,
                    scan.index
                )));
            }
        }

        self.scans = scans;
        Ok(())
    }

    fn n_scans(&self) -> usize {
        self.scans.len()
    }

    fn load_scan(&self, index: usize) -> Result<Scan, EnvError> {
        self.scans.get(index).cloned().ok_or(EnvError::ScanOutOfRange {
            index,
            count: self.scans.len(),
        })
    }
}
