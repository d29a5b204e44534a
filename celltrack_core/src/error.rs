//! Error types for the tracking engine.
//!
//! The taxonomy follows the propagation policy: store and invariant
//! failures are fatal and escalate to process termination; degraded scans
//! (oversized time gap, empty sides) are handled inline by the orchestrator
//! and never surface here; per-cell degradation (infeasible pairs,
//! non-monotonic windows) is expressed as sentinels, not errors.

use thiserror::Error;

use crate::lineage::GroupId;
use crate::store::StoreError;

/// Fatal tracking errors.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Persistent store failure; the on-disk structures have no
    /// partial-write recovery below the header validity flag
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Process-boundary failure (scan source, locks)
    #[error("environment error: {0}")]
    Env(#[from] celltrack_env::EnvError),

    /// Scan times must strictly increase
    #[error("scan time not monotonic: dt = {dt} secs")]
    NonMonotonicTime { dt: i64 },

    /// The fan limiter computed a lowest-overlap edge it then could not
    /// locate on the peer
    #[error("fan limiter cannot locate edge {prev} -> {current}")]
    EdgeNotFound { prev: usize, current: usize },

    /// Two lineages in one consolidated cluster claim different groups
    #[error("cluster group mismatch: {0} vs {1}")]
    GroupMismatch(GroupId, GroupId),

    /// Any other internal consistency violation
    #[error("internal consistency failure: {0}")]
    Internal(String),
}

impl TrackError {
    /// Creates an internal-consistency error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
