//! Lineages, lineage groups and the per-transition working state.
//!
//! A **lineage** ("simple track") is one uninterrupted segment of a cell's
//! existence. A **lineage group** ("complex track") is the set of lineages
//! connected transitively through merges and splits. Both are addressed by
//! dense integer ids into the persistent store — never by slot or pointer.
//!
//! This module owns the in-memory side: the `TrackState` cursor carried
//! along with each live cell, the `WorkingStatus` scratch used during one
//! scan transition, and the lifecycle operations (create / continue /
//! combine).

use serde::{Deserialize, Serialize};

use crate::error::TrackError;
use crate::store::{EntryId, GroupRecord, LineageRecord, StoreError, TrackStore};

// ============================================================================
// IDS
// ============================================================================

/// Identifier of one lineage. Allocated monotonically, never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LineageId(pub u64);

/// Identifier of one lineage group. Group ids are kept dense: at any time
/// they form the contiguous range `[0, n_groups)`, and consolidation
/// renumbers higher groups down when one is absorbed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub u64);

impl std::fmt::Display for LineageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "G{}", self.0)
    }
}

// ============================================================================
// TRACKED SCALARS
// ============================================================================

/// One history snapshot: the tracked scalar properties of a cell at one
/// scan time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CellProps {
    /// Scan time, seconds since the Unix epoch
    pub time_secs: i64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub height: f64,
    pub intensity_centroid_z: f64,
    pub top: f64,
    pub intensity_max: f64,
    pub intensity_mean: f64,
    pub volume: f64,
    pub flux: f64,
    pub mass: f64,
    pub area: f64,
}

/// Forecast rates of change, one per tracked scalar (units per hour),
/// plus the spatially smoothed motion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rates {
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub height: f64,
    pub intensity_centroid_z: f64,
    pub top: f64,
    pub intensity_max: f64,
    pub intensity_mean: f64,
    pub volume: f64,
    pub flux: f64,
    pub mass: f64,
    pub area: f64,
    /// Smoothed centroid motion (km/hr)
    pub smoothed_dx: f64,
    pub smoothed_dy: f64,
    /// Smoothed speed (km/hr)
    pub smoothed_speed: f64,
    /// Smoothed direction (degrees clockwise from grid north)
    pub smoothed_direction: f64,
}

/// How a scalar participates when parent histories are blended into a
/// combined lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendKind {
    /// Summed across contributors, each weighted by its share of its own
    /// parent's outgoing overlap (volume, mass, area, ...)
    Extensive,
    /// Averaged across contributors with weights normalized over the
    /// combination's incoming overlap (heights, intensities)
    Intensive,
    /// As Intensive, but with a per-contributor position correction added
    /// before blending (the centroid)
    Position,
}

/// The tracked scalar fields, enumerated so the forecast and blend loops
/// can iterate them without per-field code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarField {
    CentroidX,
    CentroidY,
    Height,
    IntensityCentroidZ,
    Top,
    IntensityMax,
    IntensityMean,
    Volume,
    Flux,
    Mass,
    Area,
}

impl ScalarField {
    pub const ALL: [ScalarField; 11] = [
        ScalarField::CentroidX,
        ScalarField::CentroidY,
        ScalarField::Height,
        ScalarField::IntensityCentroidZ,
        ScalarField::Top,
        ScalarField::IntensityMax,
        ScalarField::IntensityMean,
        ScalarField::Volume,
        ScalarField::Flux,
        ScalarField::Mass,
        ScalarField::Area,
    ];

    /// Reads this field from a snapshot.
    pub fn value(&self, props: &CellProps) -> f64 {
        match self {
            ScalarField::CentroidX => props.centroid_x,
            ScalarField::CentroidY => props.centroid_y,
            ScalarField::Height => props.height,
            ScalarField::IntensityCentroidZ => props.intensity_centroid_z,
            ScalarField::Top => props.top,
            ScalarField::IntensityMax => props.intensity_max,
            ScalarField::IntensityMean => props.intensity_mean,
            ScalarField::Volume => props.volume,
            ScalarField::Flux => props.flux,
            ScalarField::Mass => props.mass,
            ScalarField::Area => props.area,
        }
    }

    /// Writes this field into a snapshot.
    pub fn set_value(&self, props: &mut CellProps, v: f64) {
        match self {
            ScalarField::CentroidX => props.centroid_x = v,
            ScalarField::CentroidY => props.centroid_y = v,
            ScalarField::Height => props.height = v,
            ScalarField::IntensityCentroidZ => props.intensity_centroid_z = v,
            ScalarField::Top => props.top = v,
            ScalarField::IntensityMax => props.intensity_max = v,
            ScalarField::IntensityMean => props.intensity_mean = v,
            ScalarField::Volume => props.volume = v,
            ScalarField::Flux => props.flux = v,
            ScalarField::Mass => props.mass = v,
            ScalarField::Area => props.area = v,
        }
    }

    /// Reads this field's rate.
    pub fn rate(&self, rates: &Rates) -> f64 {
        match self {
            ScalarField::CentroidX => rates.centroid_x,
            ScalarField::CentroidY => rates.centroid_y,
            ScalarField::Height => rates.height,
            ScalarField::IntensityCentroidZ => rates.intensity_centroid_z,
            ScalarField::Top => rates.top,
            ScalarField::IntensityMax => rates.intensity_max,
            ScalarField::IntensityMean => rates.intensity_mean,
            ScalarField::Volume => rates.volume,
            ScalarField::Flux => rates.flux,
            ScalarField::Mass => rates.mass,
            ScalarField::Area => rates.area,
        }
    }

    /// Writes this field's rate.
    pub fn set_rate(&self, rates: &mut Rates, v: f64) {
        match self {
            ScalarField::CentroidX => rates.centroid_x = v,
            ScalarField::CentroidY => rates.centroid_y = v,
            ScalarField::Height => rates.height = v,
            ScalarField::IntensityCentroidZ => rates.intensity_centroid_z = v,
            ScalarField::Top => rates.top = v,
            ScalarField::IntensityMax => rates.intensity_max = v,
            ScalarField::IntensityMean => rates.intensity_mean = v,
            ScalarField::Volume => rates.volume = v,
            ScalarField::Flux => rates.flux = v,
            ScalarField::Mass => rates.mass = v,
            ScalarField::Area => rates.area = v,
        }
    }

    /// Do the zero-growth / zero-decay clamps apply to this scalar?
    pub fn clamps_apply(&self) -> bool {
        matches!(
            self,
            ScalarField::IntensityMax
                | ScalarField::IntensityMean
                | ScalarField::Volume
                | ScalarField::Flux
                | ScalarField::Mass
                | ScalarField::Area
        )
    }

    /// How this scalar blends in a combination.
    pub fn blend_kind(&self) -> BlendKind {
        match self {
            ScalarField::CentroidX | ScalarField::CentroidY => BlendKind::Position,
            ScalarField::Volume | ScalarField::Flux | ScalarField::Mass | ScalarField::Area => {
                BlendKind::Extensive
            }
            _ => BlendKind::Intensive,
        }
    }
}

// ============================================================================
// WORKING STATUS
// ============================================================================

/// One candidate association edge between a previous-scan cell and a
/// current-scan cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Index of the peer cell on the other side of the transition
    pub peer: usize,
    /// Overlap area (km²); the edge weight
    pub overlap: f64,
    /// Peer's lineage-group id at edge creation time
    pub group: GroupId,
    /// Peer's group member count at edge creation time
    pub group_size: usize,
}

/// Per-cell scratch state for one scan transition.
#[derive(Debug, Clone, Default)]
pub struct WorkingStatus {
    /// Candidate edges to the other side
    pub edges: Vec<Edge>,
    /// Sum of edge overlaps
    pub sum_overlap: f64,
    /// Sum of peer group sizes, counting each group once
    pub sum_group_size: usize,
    /// Single best match from residual assignment
    pub best_match: Option<usize>,
    pub starts: bool,
    pub stops: bool,
    pub continues: bool,
    pub has_split: bool,
    pub has_merger: bool,
}

impl WorkingStatus {
    /// Resets everything for a new transition.
    pub fn reset(&mut self) {
        *self = WorkingStatus::default();
    }

    /// Adds an edge and maintains the aggregates. The group-size sum counts
    /// each distinct peer group once, however many edges reach it.
    pub fn add_edge(&mut self, edge: Edge) {
        self.sum_overlap += edge.overlap;
        if !self.edges.iter().any(|e| e.group == edge.group) {
            self.sum_group_size += edge.group_size;
        }
        self.edges.push(edge);
    }

    /// Removes the edge to `peer`, correcting the aggregates. The group
    /// contribution is subtracted only when no remaining edge still
    /// references the same group.
    ///
    /// Returns the removed edge, or `None` if no such edge exists — the
    /// caller treats that as an internal-consistency failure.
    pub fn remove_edge_to(&mut self, peer: usize) -> Option<Edge> {
        let pos = self.edges.iter().position(|e| e.peer == peer)?;
        let edge = self.edges.remove(pos);
        self.sum_overlap -= edge.overlap;
        if !self.edges.iter().any(|e| e.group == edge.group) {
            self.sum_group_size -= edge.group_size;
        }
        Some(edge)
    }

    /// Number of candidate edges.
    pub fn n_match(&self) -> usize {
        self.edges.len()
    }
}

// ============================================================================
// TRACK STATE
// ============================================================================

/// The live cursor of one lineage: identity, history ring and forecast.
///
/// Carried forward from scan to scan with the cell it belongs to, and
/// serialized wholesale into the restart snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackState {
    /// Lineage id
    pub lineage: LineageId,
    /// Owning group id; rewritten when consolidation renumbers groups
    pub group: GroupId,
    /// Scan at which this lineage began
    pub origin_scan: usize,
    /// Time at which this lineage began
    pub origin_time: i64,

    /// History ring, newest first, bounded by the forecast window
    pub history: Vec<CellProps>,
    /// Scans of accumulated history (may exceed the ring length; survives
    /// combinations)
    pub history_in_scans: usize,
    /// Seconds of accumulated history
    pub history_in_secs: i64,
    /// History after spatial smoothing borrowed neighbourhood maturity
    pub smoothed_history_secs: f64,

    /// Scans this lineage itself has existed
    pub duration_in_scans: usize,
    /// Seconds this lineage itself has existed
    pub duration_in_secs: i64,

    /// Forecast rates
    pub rates: Rates,
    /// (a2 - a1) / a1 over the two newest history entries
    pub area_change_ratio: f64,

    /// Forecast point and shape scaling, set by the bounds projector
    pub forecast_x: f64,
    pub forecast_y: f64,
    pub forecast_area: f64,
    pub forecast_length_ratio: f64,
    /// Whether the forecast meets the history and speed gates
    pub forecast_valid: bool,

    /// Offset of the last entry written for this lineage
    pub last_entry: Option<EntryId>,
}

impl TrackState {
    /// Allocates a brand-new lineage.
    ///
    /// With `group = None` a fresh single-member group is created; otherwise
    /// the lineage joins the given group and that group's record is
    /// rewritten.
    pub fn init_new(
        store: &mut TrackStore,
        scan: usize,
        time: i64,
        group: Option<GroupId>,
    ) -> Result<Self, StoreError> {
        let lineage = store.alloc_lineage();

        let group_id = match group {
            None => {
                let gid = store.alloc_group();
                store.put_group(&GroupRecord {
                    id: gid,
                    members: vec![lineage],
                    start_scan: scan,
                    end_scan: scan,
                    start_time: time,
                    end_time: time,
                })?;
                gid
            }
            Some(gid) => {
                let mut record = store.get_group(gid)?;
                record.members.push(lineage);
                record.members.sort();
                record.end_scan = record.end_scan.max(scan);
                record.end_time = record.end_time.max(time);
                store.put_group(&record)?;
                gid
            }
        };

        store.put_lineage(&LineageRecord {
            id: lineage,
            group: group_id,
            start_scan: scan,
            end_scan: scan,
            start_time: time,
            end_time: time,
            duration_in_scans: 0,
            duration_in_secs: 0,
            history_in_scans: 0,
            history_in_secs: 0,
            first_entry: None,
            last_entry: None,
            parents: Vec::new(),
            children: Vec::new(),
        })?;

        Ok(Self {
            lineage,
            group: group_id,
            origin_scan: scan,
            origin_time: time,
            history: Vec::new(),
            history_in_scans: 0,
            history_in_secs: 0,
            smoothed_history_secs: 0.0,
            duration_in_scans: 0,
            duration_in_secs: 0,
            rates: Rates::default(),
            area_change_ratio: 0.0,
            forecast_x: 0.0,
            forecast_y: 0.0,
            forecast_area: 0.0,
            forecast_length_ratio: 1.0,
            forecast_valid: false,
            last_entry: None,
        })
    }

    /// Advances the lineage into a new scan: shifts the history ring,
    /// inserting the newest snapshot at the front and discarding the oldest
    /// once the ring is full, and extends the history/duration clocks.
    pub fn enter_scan(&mut self, props: CellProps, dt_secs: i64, capacity: usize) {
        self.history.insert(0, props);
        self.history.truncate(capacity);

        // A combined lineage inherits history but starts its own duration
        // clock, so the two advance independently.
        if self.history_in_scans > 0 {
            self.history_in_secs += dt_secs;
        }
        if self.duration_in_scans > 0 {
            self.duration_in_secs += dt_secs;
        }
        self.history_in_scans += 1;
        self.duration_in_scans += 1;
        self.smoothed_history_secs = self.history_in_secs as f64;
    }

    /// Newest recorded snapshot, if any.
    pub fn current(&self) -> Option<&CellProps> {
        self.history.first()
    }
}

// ============================================================================
// COMBINATION
// ============================================================================

/// One parent feeding a combination.
#[derive(Debug, Clone)]
pub struct Contribution<'a> {
    /// Index of the parent cell in the previous scan
    pub parent_index: usize,
    /// The parent's track state
    pub track: &'a TrackState,
    /// Overlap weight of the parent→child edge
    pub overlap: f64,
    /// The parent's total outgoing (child-edge) overlap
    pub parent_total_overlap: f64,
}

/// Position-correction strategy, selected by the combination's shape.
///
/// Each variant carries exactly the data its strategy needs.
#[derive(Debug, Clone, PartialEq)]
pub enum CombineKind {
    /// Pure merge (several parents, one child): each contributor is offset
    /// by the difference between its forecast point and the realized child
    /// centroid.
    Merge,
    /// Pure split (one parent, several children): every sibling shares one
    /// parent, and each is offset from the siblings' area-weighted
    /// centroid.
    Split {
        /// Area-weighted centroid of all split children
        cluster_centroid: (f64, f64),
    },
    /// Mixed merge+split cluster: neither single-parent nor single-child
    /// assumptions hold, so each contributor is offset from its own
    /// independently-forecast point.
    Mixed {
        /// Transition length in hours, for the per-contributor forecast
        dt_hours: f64,
    },
}

/// Creates the lineage for a cell that results from a merge/split
/// combination.
///
/// A brand-new lineage is always allocated — never reused, even when only
/// one parent or one child exists — under the lowest-numbered contributing
/// group. Its history ring is synthesized entry-by-entry as an
/// overlap-weighted blend of each parent's own history at the same offset.
pub fn combine_lineages(
    store: &mut TrackStore,
    contributions: &[Contribution<'_>],
    child_centroid: (f64, f64),
    kind: &CombineKind,
    scan: usize,
    time: i64,
) -> Result<TrackState, TrackError> {
    if contributions.is_empty() {
        return Err(TrackError::internal("combination with no contributors"));
    }

    let group = contributions
        .iter()
        .map(|c| c.track.group)
        .min()
        .expect("non-empty contributions");

    let mut track = TrackState::init_new(store, scan, time, Some(group))?;

    // Per-contributor position correction.
    let corrections: Vec<(f64, f64)> = contributions
        .iter()
        .map(|c| match kind {
            CombineKind::Merge => (
                child_centroid.0 - c.track.forecast_x,
                child_centroid.1 - c.track.forecast_y,
            ),
            CombineKind::Split { cluster_centroid } => (
                child_centroid.0 - cluster_centroid.0,
                child_centroid.1 - cluster_centroid.1,
            ),
            CombineKind::Mixed { dt_hours } => {
                let newest = c.track.current();
                let (px, py) = newest
                    .map(|p| (p.centroid_x, p.centroid_y))
                    .unwrap_or((c.track.forecast_x, c.track.forecast_y));
                (
                    child_centroid.0 - (px + c.track.rates.centroid_x * dt_hours),
                    child_centroid.1 - (py + c.track.rates.centroid_y * dt_hours),
                )
            }
        })
        .collect();

    let n_hist = contributions
        .iter()
        .map(|c| c.track.history.len())
        .max()
        .unwrap_or(0);

    let mut history = Vec::with_capacity(n_hist);
    for offset in 0..n_hist {
        let mut blended = CellProps::default();

        // Intensive/position weights are normalized over the combination's
        // total incoming overlap; at depths some contributors do not reach,
        // only the present subset counts.
        let position_total: f64 = contributions
            .iter()
            .filter(|c| c.track.history.len() > offset)
            .map(|c| c.overlap)
            .sum();
        if position_total <= 0.0 {
            break;
        }

        let mut time_at_offset = i64::MIN;
        for (c, corr) in contributions.iter().zip(&corrections) {
            let Some(snapshot) = c.track.history.get(offset) else {
                continue;
            };
            time_at_offset = time_at_offset.max(snapshot.time_secs);

            let size_weight = if c.parent_total_overlap > 0.0 {
                c.overlap / c.parent_total_overlap
            } else {
                0.0
            };
            let position_weight = c.overlap / position_total;

            for field in ScalarField::ALL {
                let v = field.value(snapshot);
                let contribution = match field.blend_kind() {
                    BlendKind::Extensive => size_weight * v,
                    BlendKind::Intensive => position_weight * v,
                    BlendKind::Position => {
                        let corrected = match field {
                            ScalarField::CentroidX => v + corr.0,
                            ScalarField::CentroidY => v + corr.1,
                            _ => unreachable!("only centroids are position-blended"),
                        };
                        position_weight * corrected
                    }
                };
                let current = field.value(&blended);
                field.set_value(&mut blended, current + contribution);
            }
        }
        blended.time_secs = time_at_offset;
        history.push(blended);
    }

    track.history = history;
    track.history_in_scans = contributions
        .iter()
        .map(|c| c.track.history_in_scans)
        .max()
        .unwrap_or(0);
    track.history_in_secs = contributions
        .iter()
        .map(|c| c.track.history_in_secs)
        .max()
        .unwrap_or(0);
    track.smoothed_history_secs = track.history_in_secs as f64;

    // Cross-link parent and child lineage records.
    let parent_ids: Vec<LineageId> = contributions.iter().map(|c| c.track.lineage).collect();
    let mut record = store.get_lineage(track.lineage)?;
    record.parents = parent_ids.clone();
    record.history_in_scans = track.history_in_scans;
    record.history_in_secs = track.history_in_secs;
    store.put_lineage(&record)?;
    for parent in &parent_ids {
        let mut parent_record = store.get_lineage(*parent)?;
        if !parent_record.children.contains(&track.lineage) {
            parent_record.children.push(track.lineage);
            store.put_lineage(&parent_record)?;
        }
    }

    Ok(track)
}

// ============================================================================
// TESTS
// ============================================================================
