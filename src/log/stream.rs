//! Log-stream boundary.
//!
//! The replicated log is an external collaborator: it provides a durable,
//! appendable sequence of records with a monotonic commit watermark. The
//! engine owns exactly one reader/writer pair per partition.

use crate::log::record::{Intent, LogRecord, RecordKind, Rejection, ValueKind};
use std::fmt;
use tokio::sync::broadcast;

/// A record staged for appending. The log assigns position and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub key: i64,
    pub record_kind: RecordKind,
    pub value_kind: ValueKind,
    pub intent: Intent,
    pub rejection: Option<Rejection>,
    pub value: Vec<u8>,

    /// Causal parent position, tagged by the writer.
    pub source_record_position: i64,

    /// Appending engine instance, tagged by the writer.
    pub producer_id: i64,
}

/// Notifications published by the log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogEvent {
    /// New records were appended; carries the last appended position.
    Appended(i64),

    /// The durable commit watermark advanced to the given position.
    CommitAdvanced(i64),
}

/// Errors surfaced by the log stream.
#[derive(Debug, Clone)]
pub enum LogError {
    /// The log cannot accept the batch right now; the caller should retry.
    Backpressure,

    /// The batch was rejected permanently.
    AppendFailed { reason: String },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Backpressure => write!(f, "Log is backpressured, retry the append"),
            LogError::AppendFailed { reason } => write!(f, "Failed to append batch: {}", reason),
        }
    }
}

impl std::error::Error for LogError {}

/// The appendable, replicated log for one partition.
pub trait LogStream: Send + Sync {
    /// Atomically append a batch, returning the position of the last record.
    fn append(&self, batch: Vec<LogEntry>) -> Result<i64, LogError>;

    /// The durable watermark; positions at or below it will not be lost.
    fn commit_position(&self) -> i64;

    /// Highest position assigned so far, `UNSET_POSITION` when empty.
    fn last_position(&self) -> i64;

    /// Subscribe to append/commit notifications.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Allow the log to reclaim segments strictly below the given position.
    fn reclaim_up_to(&self, position: i64);

    /// Open a new reader positioned at the start of the log.
    fn new_reader(&self) -> Box<dyn LogStreamReader>;
}

/// A sequential reader over the log. Positions strictly increase across
/// `next` calls from one reader.
pub trait LogStreamReader: Send {
    fn has_next(&mut self) -> bool;

    fn next(&mut self) -> Option<LogRecord>;

    /// Position the reader on the first record with a position strictly
    /// greater than the given one.
    fn seek_after(&mut self, position: i64);
}
