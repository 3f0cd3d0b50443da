//! Shared processing context.
//!
//! Gathers the collaborators each state machine needs, plus the position
//! cursors. The cursors are mutated only by the engine task; the snapshot
//! director reads them through the async accessors.

use crate::dispatch::DispatchTable;
use crate::log::record::{LogRecord, UNSET_POSITION};
use crate::log::stream::LogStream;
use crate::processor::response::ResponseTransport;
use crate::retry::AbortSignal;
use crate::state::TransactionContext;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Optional predicate deciding which records are processed; rejected records
/// are skipped without a transaction.
pub type RecordFilter = Arc<dyn Fn(&LogRecord) -> bool + Send + Sync>;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Producer id tagged onto every record this engine appends.
    pub producer_id: i64,

    /// Period of the snapshot director's trigger.
    pub snapshot_period: Duration,

    /// Maximum number of valid snapshots retained.
    pub max_snapshots: usize,

    /// Delay before re-applying a record after a recoverable failure.
    pub processing_retry_delay: Duration,

    /// Backoff between attempts inside the retry strategies.
    pub retry_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            producer_id: 1,
            snapshot_period: Duration::from_secs(10),
            max_snapshots: 3,
            processing_retry_delay: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(1),
        }
    }
}

/// Copy of the processing cursor state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CursorState {
    pub last_processed: i64,
    pub last_written: i64,
    pub on_error_handling: bool,
    pub error_record_position: i64,
}

impl CursorState {
    fn unset() -> Self {
        Self {
            last_processed: UNSET_POSITION,
            last_written: UNSET_POSITION,
            on_error_handling: false,
            error_record_position: UNSET_POSITION,
        }
    }
}

/// Shared processing cursor. Owned by the processing state machine; the
/// snapshot director and the engine handle read it via accessors.
#[derive(Clone)]
pub struct EnginePositions {
    inner: Arc<Mutex<CursorState>>,
}

impl EnginePositions {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CursorState::unset())),
        }
    }

    pub async fn state(&self) -> CursorState {
        *self.inner.lock().await
    }

    pub async fn last_processed(&self) -> i64 {
        self.inner.lock().await.last_processed
    }

    pub async fn last_written(&self) -> i64 {
        self.inner.lock().await.last_written
    }

    pub async fn error_record_position(&self) -> i64 {
        self.inner.lock().await.error_record_position
    }

    /// Initialize both cursors after recovery.
    pub(crate) async fn restore(&self, processed: i64, written: i64) {
        let mut inner = self.inner.lock().await;
        inner.last_processed = processed;
        inner.last_written = written;
    }

    /// Advance the cursors after a successful commit. `written` may be
    /// `UNSET_POSITION` when the record produced no follow-ups.
    pub(crate) async fn record_committed(&self, processed: i64, written: i64) {
        let mut inner = self.inner.lock().await;
        if processed > inner.last_processed {
            inner.last_processed = processed;
        }
        if written != UNSET_POSITION && written > inner.last_written {
            inner.last_written = written;
        }
    }

    /// Skipped records still advance the read cursor.
    pub(crate) async fn record_skipped(&self, position: i64) {
        let mut inner = self.inner.lock().await;
        if position > inner.last_processed {
            inner.last_processed = position;
        }
    }

    pub(crate) async fn begin_error_handling(&self) {
        self.inner.lock().await.on_error_handling = true;
    }

    pub(crate) async fn finish_error_handling(&self) {
        self.inner.lock().await.on_error_handling = false;
    }

    /// Gate: reads must not advance past this position until the log has
    /// durably committed it.
    pub(crate) async fn set_error_record_position(&self, position: i64) {
        self.inner.lock().await.error_record_position = position;
    }

    pub(crate) async fn clear_error_record_position(&self) {
        self.inner.lock().await.error_record_position = UNSET_POSITION;
    }
}

impl Default for EnginePositions {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the state machines are constructed from.
#[derive(Clone)]
pub struct ProcessingContext {
    pub log: Arc<dyn LogStream>,
    pub transaction_context: Arc<dyn TransactionContext>,
    pub dispatch: Arc<DispatchTable>,
    pub responses: Arc<dyn ResponseTransport>,
    pub filter: Option<RecordFilter>,
    pub positions: EnginePositions,
    pub abort: AbortSignal,
    pub config: ProcessorConfig,
    pub logger: Logger,
}
