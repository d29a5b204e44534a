//! The persistent lineage store.
//!
//! Three abstractions layered over one embedded `sled` database:
//!
//! - a **parameter store**: lineage, group and per-scan index records,
//!   randomly rewritable by numeric id;
//! - an **entry log**: append-only track entries keyed by a monotonically
//!   increasing offset, threaded by two backward link chains (previous
//!   entry of the same lineage, previous entry of the same scan);
//! - a **header** carrying the parameter echo, record counts, the last
//!   committed scan and the single `valid` flag that is the crash-recovery
//!   discriminant.
//!
//! The validity bracket is the durability unit: `set_invalid()` is flushed
//! before any scan's writes begin, and `set_valid()` flushes after they
//! end. A header found invalid on open means the last scan's entries are
//! not committed and the scan must be re-tracked; there is no partial
//! replay.

use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::lineage::{GroupId, LineageId, Rates};

/// Offset of one entry in the entry log.
pub type EntryId = u64;

/// Store-layer errors. Always fatal to the tracking process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("record encode/decode error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("missing {kind} record {id}")]
    Missing { kind: &'static str, id: u64 },

    #[error("store has no header")]
    NoHeader,
}

// ============================================================================
// RECORDS
// ============================================================================

/// Parameter record of one lineage ("simple track").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: LineageId,
    /// Owning group; rewritten when consolidation renumbers groups
    pub group: GroupId,
    pub start_scan: usize,
    pub end_scan: usize,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_in_scans: usize,
    pub duration_in_secs: i64,
    pub history_in_scans: usize,
    pub history_in_secs: i64,
    /// First and last entry offsets of this lineage's chain
    pub first_entry: Option<EntryId>,
    pub last_entry: Option<EntryId>,
    /// Lineages this one was combined from / into
    pub parents: Vec<LineageId>,
    pub children: Vec<LineageId>,
}

/// Parameter record of one lineage group ("complex track").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    /// Member lineages, sorted ascending
    pub members: Vec<LineageId>,
    pub start_scan: usize,
    pub end_scan: usize,
    pub start_time: i64,
    pub end_time: i64,
}

/// Per-scan index record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanIndexRecord {
    pub scan: usize,
    pub time_secs: i64,
    pub n_entries: usize,
    pub first_entry: Option<EntryId>,
}

/// One persisted track entry: a (lineage, scan, cell) triple plus the
/// forecast snapshot taken at that scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub lineage: LineageId,
    pub group: GroupId,
    pub scan: usize,
    /// Index of the cell within its scan
    pub cell_index: usize,
    pub time_secs: i64,
    pub history_in_scans: usize,
    pub history_in_secs: i64,
    pub duration_in_scans: usize,
    pub duration_in_secs: i64,
    pub forecast_valid: bool,
    /// Forecast rates at this scan
    pub rates: Rates,
    /// Previous entry of the same lineage
    pub prev_in_lineage: Option<EntryId>,
    /// Previous entry of the same scan
    pub prev_in_scan: Option<EntryId>,
}

/// The store header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// Echo of the tracking parameters the store was written under
    pub params: TrackerConfig,
    pub n_lineages: u64,
    pub n_groups: u64,
    pub n_entries: u64,
    /// Last scan whose writes fully committed
    pub last_scan: Option<usize>,
    /// False while a scan's writes are in progress
    pub valid: bool,
    /// Tag shared with the restart snapshot; regenerated on every commit
    pub modify_code: Uuid,
}

// ============================================================================
// STORE
// ============================================================================

const TREE_LINEAGES: &str = "lineages";
const TREE_GROUPS: &str = "groups";
const TREE_ENTRIES: &str = "entries";
const TREE_SCANS: &str = "scans";
const TREE_META: &str = "meta";
const KEY_HEADER: &[u8] = b"header";

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// The persistent lineage store.
pub struct TrackStore {
    db: sled::Db,
    lineages: sled::Tree,
    groups: sled::Tree,
    entries: sled::Tree,
    scans: sled::Tree,
    meta: sled::Tree,
    n_lineages: u64,
    n_groups: u64,
    n_entries: u64,
}

impl TrackStore {
    /// Creates a fresh store under `dir`, discarding any existing one, and
    /// writes an initial (invalid, empty) header.
    pub fn create(dir: &Path, config: &TrackerConfig) -> Result<Self, StoreError> {
        let db = sled::open(dir.join("lineage_store"))?;
        for tree in [TREE_LINEAGES, TREE_GROUPS, TREE_ENTRIES, TREE_SCANS, TREE_META] {
            db.drop_tree(tree)?;
        }
        let store = Self::from_db(db)?;
        let header = HeaderRecord {
            params: config.clone(),
            n_lineages: 0,
            n_groups: 0,
            n_entries: 0,
            last_scan: None,
            valid: false,
            modify_code: Uuid::nil(),
        };
        store.meta.insert(KEY_HEADER, encode(&header)?)?;
        store.db.flush()?;
        Ok(store)
    }

    /// Opens an existing store and restores the id counters from its
    /// header.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let db = sled::open(dir.join("lineage_store"))?;
        let mut store = Self::from_db(db)?;
        let header = store.header()?;
        store.n_lineages = header.n_lineages;
        store.n_groups = header.n_groups;
        store.n_entries = header.n_entries;
        Ok(store)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let lineages = db.open_tree(TREE_LINEAGES)?;
        let groups = db.open_tree(TREE_GROUPS)?;
        let entries = db.open_tree(TREE_ENTRIES)?;
        let scans = db.open_tree(TREE_SCANS)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            lineages,
            groups,
            entries,
            scans,
            meta,
            n_lineages: 0,
            n_groups: 0,
            n_entries: 0,
        })
    }

    // ------------------------------------------------------------------
    // Header / validity bracket
    // ------------------------------------------------------------------

    /// Reads the header.
    pub fn header(&self) -> Result<HeaderRecord, StoreError> {
        let bytes = self.meta.get(KEY_HEADER)?.ok_or(StoreError::NoHeader)?;
        decode(&bytes)
    }

    /// Clears the valid flag and flushes, marking a mutation window open.
    pub fn set_invalid(&mut self) -> Result<(), StoreError> {
        let mut header = self.header()?;
        header.valid = false;
        self.meta.insert(KEY_HEADER, encode(&header)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// Records the committed scan, regenerates the modify code, sets the
    /// valid flag and flushes. Returns the new modify code for the restart
    /// snapshot.
    pub fn set_valid(&mut self, last_scan: usize) -> Result<Uuid, StoreError> {
        let mut header = self.header()?;
        header.n_lineages = self.n_lineages;
        header.n_groups = self.n_groups;
        header.n_entries = self.n_entries;
        header.last_scan = Some(last_scan);
        header.modify_code = Uuid::new_v4();
        header.valid = true;
        self.meta.insert(KEY_HEADER, encode(&header)?)?;
        self.db.flush()?;
        Ok(header.modify_code)
    }

    // ------------------------------------------------------------------
    // Id allocation
    // ------------------------------------------------------------------

    /// Allocates the next lineage id. Never reused.
    pub fn alloc_lineage(&mut self) -> LineageId {
        let id = LineageId(self.n_lineages);
        self.n_lineages += 1;
        id
    }

    /// Allocates the next group id. Group ids stay dense: this is always
    /// the current group count.
    pub fn alloc_group(&mut self) -> GroupId {
        let id = GroupId(self.n_groups);
        self.n_groups += 1;
        id
    }

    pub fn n_lineages(&self) -> u64 {
        self.n_lineages
    }

    pub fn n_groups(&self) -> u64 {
        self.n_groups
    }

    /// Called by consolidation after it removes a group slot.
    pub(crate) fn note_group_removed(&mut self) {
        debug_assert!(self.n_groups > 0);
        self.n_groups -= 1;
    }

    // ------------------------------------------------------------------
    // Parameter store
    // ------------------------------------------------------------------

    pub fn put_lineage(&mut self, record: &LineageRecord) -> Result<(), StoreError> {
        self.lineages.insert(key(record.id.0), encode(record)?)?;
        Ok(())
    }

    pub fn get_lineage(&self, id: LineageId) -> Result<LineageRecord, StoreError> {
        let bytes = self
            .lineages
            .get(key(id.0))?
            .ok_or(StoreError::Missing { kind: "lineage", id: id.0 })?;
        decode(&bytes)
    }

    pub fn put_group(&mut self, record: &GroupRecord) -> Result<(), StoreError> {
        self.groups.insert(key(record.id.0), encode(record)?)?;
        Ok(())
    }

    pub fn get_group(&self, id: GroupId) -> Result<GroupRecord, StoreError> {
        let bytes = self
            .groups
            .get(key(id.0))?
            .ok_or(StoreError::Missing { kind: "group", id: id.0 })?;
        decode(&bytes)
    }

    pub fn remove_group(&mut self, id: GroupId) -> Result<(), StoreError> {
        self.groups.remove(key(id.0))?;
        Ok(())
    }

    /// All group records, ascending by id.
    pub fn all_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        self.groups
            .iter()
            .map(|kv| {
                let (_, v) = kv?;
                decode(&v)
            })
            .collect()
    }

    /// All lineage records, ascending by id.
    pub fn all_lineages(&self) -> Result<Vec<LineageRecord>, StoreError> {
        self.lineages
            .iter()
            .map(|kv| {
                let (_, v) = kv?;
                decode(&v)
            })
            .collect()
    }

    pub fn put_scan_index(&mut self, record: &ScanIndexRecord) -> Result<(), StoreError> {
        self.scans.insert(key(record.scan as u64), encode(record)?)?;
        Ok(())
    }

    pub fn get_scan_index(&self, scan: usize) -> Result<ScanIndexRecord, StoreError> {
        let bytes = self
            .scans
            .get(key(scan as u64))?
            .ok_or(StoreError::Missing { kind: "scan index", id: scan as u64 })?;
        decode(&bytes)
    }

    // ------------------------------------------------------------------
    // Entry log
    // ------------------------------------------------------------------

    /// Appends one entry and returns its offset.
    pub fn append_entry(&mut self, entry: &TrackEntry) -> Result<EntryId, StoreError> {
        let id = self.n_entries;
        self.entries.insert(key(id), encode(entry)?)?;
        self.n_entries += 1;
        Ok(id)
    }

    pub fn get_entry(&self, id: EntryId) -> Result<TrackEntry, StoreError> {
        let bytes = self
            .entries
            .get(key(id))?
            .ok_or(StoreError::Missing { kind: "entry", id })?;
        decode(&bytes)
    }

    /// Iterates entries from the given offset onward, in append order.
    pub fn entries_from(
        &self,
        from: EntryId,
    ) -> impl Iterator<Item = Result<(EntryId, TrackEntry), StoreError>> + '_ {
        self.entries.range(key(from)..).map(|kv| {
            let (k, v) = kv?;
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&k);
            Ok((u64::from_be_bytes(id_bytes), decode(&v)?))
        })
    }

    /// Flushes all dirty state to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
