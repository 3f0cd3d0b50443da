//! In-memory log stream.
//!
//! Backs the engine in tests and single-process deployments. Positions are
//! assigned 1..n, batches are appended atomically, and the commit watermark
//! either follows appends automatically or is advanced manually to exercise
//! the commit-gated paths.

use crate::log::record::{LogRecord, UNSET_POSITION};
use crate::log::stream::{LogEntry, LogError, LogEvent, LogStream, LogStreamReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

struct LogInner {
    records: Vec<LogRecord>,
    commit_position: i64,
    next_position: i64,
    reclaimed_up_to: i64,
}

/// In-memory `LogStream` implementation.
#[derive(Clone)]
pub struct InMemoryLogStream {
    inner: Arc<RwLock<LogInner>>,
    events: broadcast::Sender<LogEvent>,
    auto_commit: bool,
    backpressured: Arc<AtomicBool>,
}

impl InMemoryLogStream {
    /// Create a log whose commit watermark follows appends immediately.
    pub fn new() -> Self {
        Self::create(true)
    }

    /// Create a log whose commit watermark only advances via
    /// `advance_commit_position`, for exercising commit-gated behavior.
    pub fn with_manual_commit() -> Self {
        Self::create(false)
    }

    fn create(auto_commit: bool) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(RwLock::new(LogInner {
                records: Vec::new(),
                commit_position: UNSET_POSITION,
                next_position: 1,
                reclaimed_up_to: UNSET_POSITION,
            })),
            events,
            auto_commit,
            backpressured: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Advance the durable watermark; only moves forward and never past the
    /// last appended position.
    pub fn advance_commit_position(&self, position: i64) {
        let advanced = {
            let mut inner = self.write_lock();
            let last = inner.next_position - 1;
            let target = position.min(last);
            if target > inner.commit_position {
                inner.commit_position = target;
                Some(target)
            } else {
                None
            }
        };
        if let Some(position) = advanced {
            let _ = self.events.send(LogEvent::CommitAdvanced(position));
        }
    }

    /// While set, appends fail with `LogError::Backpressure`.
    pub fn set_backpressure(&self, backpressured: bool) {
        self.backpressured.store(backpressured, Ordering::SeqCst);
    }

    /// Position below which segments have been reclaimed.
    pub fn reclaimed_up_to(&self) -> i64 {
        self.read_lock().reclaimed_up_to
    }

    /// Number of records currently on the log.
    pub fn record_count(&self) -> usize {
        self.read_lock().records.len()
    }

    /// Snapshot of a record by position, for assertions.
    pub fn record_at(&self, position: i64) -> Option<LogRecord> {
        self.read_lock()
            .records
            .iter()
            .find(|r| r.position == position)
            .cloned()
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, LogInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, LogInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl Default for InMemoryLogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStream for InMemoryLogStream {
    fn append(&self, batch: Vec<LogEntry>) -> Result<i64, LogError> {
        if batch.is_empty() {
            return Err(LogError::AppendFailed {
                reason: "empty batch".to_string(),
            });
        }
        if self.backpressured.load(Ordering::SeqCst) {
            return Err(LogError::Backpressure);
        }

        let timestamp = Self::now_millis();
        let (last_position, committed) = {
            let mut inner = self.write_lock();
            let mut last = UNSET_POSITION;
            for entry in batch {
                let position = inner.next_position;
                inner.next_position += 1;
                inner.records.push(LogRecord {
                    key: entry.key,
                    position,
                    source_record_position: entry.source_record_position,
                    producer_id: entry.producer_id,
                    timestamp,
                    record_kind: entry.record_kind,
                    value_kind: entry.value_kind,
                    intent: entry.intent,
                    rejection: entry.rejection,
                    value: entry.value,
                });
                last = position;
            }
            let committed = if self.auto_commit {
                inner.commit_position = last;
                Some(last)
            } else {
                None
            };
            (last, committed)
        };

        let _ = self.events.send(LogEvent::Appended(last_position));
        if let Some(position) = committed {
            let _ = self.events.send(LogEvent::CommitAdvanced(position));
        }
        Ok(last_position)
    }

    fn commit_position(&self) -> i64 {
        self.read_lock().commit_position
    }

    fn last_position(&self) -> i64 {
        let inner = self.read_lock();
        inner.next_position - 1
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    fn reclaim_up_to(&self, position: i64) {
        let mut inner = self.write_lock();
        if position > inner.reclaimed_up_to {
            inner.reclaimed_up_to = position;
        }
    }

    fn new_reader(&self) -> Box<dyn LogStreamReader> {
        Box::new(InMemoryLogReader {
            inner: self.inner.clone(),
            next_index: 0,
        })
    }
}

struct InMemoryLogReader {
    inner: Arc<RwLock<LogInner>>,
    next_index: usize,
}

impl InMemoryLogReader {
    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, LogInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LogStreamReader for InMemoryLogReader {
    fn has_next(&mut self) -> bool {
        self.next_index < self.read_lock().records.len()
    }

    fn next(&mut self) -> Option<LogRecord> {
        let record = self.read_lock().records.get(self.next_index).cloned();
        if record.is_some() {
            self.next_index += 1;
        }
        record
    }

    fn seek_after(&mut self, position: i64) {
        let index = {
            let inner = self.read_lock();
            inner
                .records
                .iter()
                .position(|r| r.position > position)
                .unwrap_or(inner.records.len())
        };
        self.next_index = index;
    }
}
