//! In-memory snapshot controller.
//!
//! Tracks snapshot positions only; the actual state lives in the in-memory
//! state store and needs no copying. Used in tests and single-process
//! deployments.

use crate::log::record::UNSET_POSITION;
use crate::snapshot::{SnapshotController, SnapshotError};
use std::sync::{Arc, Mutex, MutexGuard};

struct ControllerInner {
    pending: Option<i64>,
    /// Valid snapshot positions, ascending.
    valid: Vec<i64>,
    replications: u32,
    fail_next_take: bool,
}

#[derive(Clone)]
pub struct InMemorySnapshotController {
    inner: Arc<Mutex<ControllerInner>>,
}

impl InMemorySnapshotController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                pending: None,
                valid: Vec::new(),
                replications: 0,
                fail_next_take: false,
            })),
        }
    }

    /// Seed an existing valid snapshot, as if taken in an earlier run.
    pub fn with_valid_snapshot(position: i64) -> Self {
        let controller = Self::new();
        controller.lock().valid.push(position);
        controller
    }

    pub fn valid_positions(&self) -> Vec<i64> {
        self.lock().valid.clone()
    }

    pub fn pending_position(&self) -> Option<i64> {
        self.lock().pending
    }

    pub fn replication_count(&self) -> u32 {
        self.lock().replications
    }

    /// Inject a failure into the next `take_temporary_snapshot` call.
    pub fn fail_next_take(&self) {
        self.lock().fail_next_take = true;
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemorySnapshotController {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotController for InMemorySnapshotController {
    fn take_temporary_snapshot(&self, last_processed_position: i64) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        if inner.fail_next_take {
            inner.fail_next_take = false;
            return Err(SnapshotError::Storage {
                reason: "injected snapshot failure".to_string(),
            });
        }
        inner.pending = Some(last_processed_position);
        Ok(())
    }

    fn move_valid_snapshot(&self, last_processed_position: i64) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        match inner.pending.take() {
            Some(position) if position == last_processed_position => {
                inner.valid.push(position);
                inner.valid.sort_unstable();
                Ok(())
            }
            _ => Err(SnapshotError::NoPendingSnapshot),
        }
    }

    fn ensure_max_snapshot_count(&self, max: usize) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        while inner.valid.len() > max.max(1) {
            inner.valid.remove(0);
        }
        Ok(())
    }

    fn valid_snapshots_count(&self) -> usize {
        self.lock().valid.len()
    }

    fn position_to_delete(&self) -> Option<i64> {
        self.lock().valid.first().copied()
    }

    fn replicate_latest_snapshot(&self) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        if inner.valid.is_empty() {
            return Err(SnapshotError::NoPendingSnapshot);
        }
        inner.replications += 1;
        Ok(())
    }

    fn last_valid_snapshot_position(&self) -> i64 {
        self.lock().valid.last().copied().unwrap_or(UNSET_POSITION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_then_valid_lifecycle() {
        let controller = InMemorySnapshotController::new();
        assert_eq!(controller.last_valid_snapshot_position(), UNSET_POSITION);

        controller.take_temporary_snapshot(5).unwrap();
        assert_eq!(controller.pending_position(), Some(5));
        assert_eq!(controller.valid_snapshots_count(), 0);

        controller.move_valid_snapshot(5).unwrap();
        assert_eq!(controller.pending_position(), None);
        assert_eq!(controller.last_valid_snapshot_position(), 5);
    }

    #[test]
    fn test_finalize_without_pending_fails() {
        let controller = InMemorySnapshotController::new();
        assert!(matches!(
            controller.move_valid_snapshot(5),
            Err(SnapshotError::NoPendingSnapshot)
        ));
    }

    #[test]
    fn test_retention_drops_oldest() {
        let controller = InMemorySnapshotController::new();
        for position in [3, 7, 12] {
            controller.take_temporary_snapshot(position).unwrap();
            controller.move_valid_snapshot(position).unwrap();
        }

        controller.ensure_max_snapshot_count(2).unwrap();
        assert_eq!(controller.valid_positions(), vec![7, 12]);
        assert_eq!(controller.position_to_delete(), Some(7));
        assert_eq!(controller.last_valid_snapshot_position(), 12);
    }

    #[test]
    fn test_replication_requires_a_valid_snapshot() {
        let controller = InMemorySnapshotController::new();
        assert!(controller.replicate_latest_snapshot().is_err());

        controller.take_temporary_snapshot(1).unwrap();
        controller.move_valid_snapshot(1).unwrap();
        controller.replicate_latest_snapshot().unwrap();
        assert_eq!(controller.replication_count(), 1);
    }

    #[test]
    fn test_injected_take_failure() {
        let controller = InMemorySnapshotController::new();
        controller.fail_next_take();
        assert!(matches!(
            controller.take_temporary_snapshot(1),
            Err(SnapshotError::Storage { .. })
        ));
        // One-shot injection.
        controller.take_temporary_snapshot(1).unwrap();
    }
}
