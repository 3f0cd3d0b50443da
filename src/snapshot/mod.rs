//! Snapshot boundary.
//!
//! Snapshot storage is an external collaborator, like the log and the state
//! store. The engine decides WHEN a snapshot is taken and becomes valid; the
//! controller implements HOW.

pub mod director;
pub mod memory;

pub use director::{SnapshotDirector, SnapshotRequest, SnapshotRequestSender};
pub use memory::InMemorySnapshotController;

use std::fmt;

/// Errors surfaced by the snapshot controller.
#[derive(Debug, Clone)]
pub enum SnapshotError {
    /// The snapshot store failed.
    Storage { reason: String },

    /// Finalization without a matching temporary snapshot.
    NoPendingSnapshot,

    /// The snapshot was not taken, e.g. nothing new was processed or the
    /// engine is shutting down.
    NotTaken { reason: String },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Storage { reason } => write!(f, "Snapshot store failure: {}", reason),
            SnapshotError::NoPendingSnapshot => {
                write!(f, "No temporary snapshot to finalize")
            }
            SnapshotError::NotTaken { reason } => write!(f, "Snapshot not taken: {}", reason),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Storage-side snapshot lifecycle.
///
/// A snapshot is first taken as temporary, then moved to valid once every
/// record it may reference is durably committed on the log.
pub trait SnapshotController: Send + Sync {
    /// Capture the current state as a temporary snapshot tagged with the
    /// last processed position it covers.
    fn take_temporary_snapshot(&self, last_processed_position: i64) -> Result<(), SnapshotError>;

    /// Promote the temporary snapshot with the given position to valid.
    fn move_valid_snapshot(&self, last_processed_position: i64) -> Result<(), SnapshotError>;

    /// Drop the oldest valid snapshots until at most `max` remain.
    fn ensure_max_snapshot_count(&self, max: usize) -> Result<(), SnapshotError>;

    fn valid_snapshots_count(&self) -> usize;

    /// Position below which the log is no longer needed for recovery, i.e.
    /// the position of the oldest retained valid snapshot.
    fn position_to_delete(&self) -> Option<i64>;

    /// Offer the newest valid snapshot for replication to other nodes.
    fn replicate_latest_snapshot(&self) -> Result<(), SnapshotError>;

    /// Position of the newest valid snapshot, `UNSET_POSITION` when none
    /// exists. Recovery replays the log from here.
    fn last_valid_snapshot_position(&self) -> i64;
}
