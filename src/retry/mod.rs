//! Retry strategies.
//!
//! All three strategies re-invoke an operation that reports `Ok(true)` for
//! success and `Ok(false)` for "not yet, try again" (e.g. backpressure),
//! with an abort predicate checked before each attempt. They differ only in
//! how errors and the abort condition are treated.

use crate::error::EngineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared shutdown flag, true once the engine is closing. Retry loops consult
/// it cooperatively before each attempt.
#[derive(Clone)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once the signal has been triggered.
    pub async fn aborted(&self) {
        while !self.is_aborted() {
            self.notify.notified().await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops retrying, without error, as soon as the abort condition holds.
/// Errors are surfaced to the caller. Used for the write and side-effect
/// phases, where giving up is safe because a future pass retries the record.
pub struct AbortableRetryStrategy {
    backoff: Duration,
}

impl AbortableRetryStrategy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Returns `Ok(true)` on success, `Ok(false)` when aborted.
    pub async fn run<F>(&self, mut operation: F, abort: &AbortSignal) -> Result<bool, EngineError>
    where
        F: FnMut() -> Result<bool, EngineError>,
    {
        loop {
            if abort.is_aborted() {
                return Ok(false);
            }
            match operation() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(error) => return Err(error),
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// Retries only failures classified as recoverable; anything else is
/// surfaced immediately. Used for commit and rollback, where non-recoverable
/// failures must be escalated, not silently looped.
pub struct RecoverableRetryStrategy {
    backoff: Duration,
}

impl RecoverableRetryStrategy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Returns `Ok(true)` on success, `Ok(false)` when aborted.
    pub async fn run<F>(&self, mut operation: F, abort: &AbortSignal) -> Result<bool, EngineError>
    where
        F: FnMut() -> Result<bool, EngineError>,
    {
        loop {
            if abort.is_aborted() {
                return Ok(false);
            }
            match operation() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(error) if error.is_recoverable() => {}
                Err(error) => return Err(error),
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// Retries unconditionally, ignoring the abort condition. Used exclusively
/// during reprocessing, where the record must eventually succeed rather than
/// be skipped.
pub struct EndlessRetryStrategy {
    backoff: Duration,
}

impl EndlessRetryStrategy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    pub async fn run<F>(&self, mut operation: F)
    where
        F: FnMut() -> Result<bool, EngineError>,
    {
        loop {
            match operation() {
                Ok(true) => return,
                Ok(false) | Err(_) => {}
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}
