//! Stream writer.
//!
//! Batches the follow-up records produced while processing one source record
//! and appends them to the log in a single atomic write, tagging each entry
//! with the producer id and the source record's position. The staged batch
//! survives a failed flush so that a retry re-submits the identical batch;
//! rebuilding after error handling goes through `reset()` instead.

use crate::log::record::{
    Intent, LogRecord, RecordKind, Rejection, RejectionKind, ValueKind, UNSET_POSITION,
};
use crate::log::stream::{LogEntry, LogError, LogStream};
use std::sync::Arc;

pub struct StreamWriter {
    log: Arc<dyn LogStream>,
    producer_id: i64,
    source_record_position: i64,
    staged: Vec<LogEntry>,
}

impl StreamWriter {
    pub fn new(log: Arc<dyn LogStream>, producer_id: i64) -> Self {
        Self {
            log,
            producer_id,
            source_record_position: UNSET_POSITION,
            staged: Vec::new(),
        }
    }

    /// Set the source position tagged onto subsequently staged entries.
    pub fn configure_source(&mut self, position: i64) {
        self.source_record_position = position;
    }

    pub fn append_event(&mut self, key: i64, value_kind: ValueKind, intent: Intent, value: Vec<u8>) {
        self.stage(key, RecordKind::Event, value_kind, intent, None, value);
    }

    pub fn append_command(
        &mut self,
        key: i64,
        value_kind: ValueKind,
        intent: Intent,
        value: Vec<u8>,
    ) {
        self.stage(key, RecordKind::Command, value_kind, intent, None, value);
    }

    /// Stage a rejection for the given command, carrying over its identity.
    pub fn append_rejection(&mut self, command: &LogRecord, kind: RejectionKind, reason: &str) {
        self.stage(
            command.key,
            RecordKind::CommandRejection,
            command.value_kind,
            command.intent,
            Some(Rejection {
                kind,
                reason: reason.to_string(),
            }),
            command.value.clone(),
        );
    }

    fn stage(
        &mut self,
        key: i64,
        record_kind: RecordKind,
        value_kind: ValueKind,
        intent: Intent,
        rejection: Option<Rejection>,
        value: Vec<u8>,
    ) {
        self.staged.push(LogEntry {
            key,
            record_kind,
            value_kind,
            intent,
            rejection,
            value,
            source_record_position: self.source_record_position,
            producer_id: self.producer_id,
        });
    }

    /// Discard a partially-built batch.
    pub fn reset(&mut self) {
        self.staged.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Drain the staged batch without appending; used during reprocessing to
    /// divert would-be writes into the projection.
    pub fn take_staged(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.staged)
    }

    /// Append the staged batch atomically. Returns the position of the last
    /// written record, or `UNSET_POSITION` if nothing was staged. On failure
    /// the batch is kept so the caller can retry the identical append.
    pub fn flush(&mut self) -> Result<i64, LogError> {
        if self.staged.is_empty() {
            return Ok(UNSET_POSITION);
        }
        let position = self.log.append(self.staged.clone())?;
        self.staged.clear();
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::InMemoryLogStream;
    use crate::log::record::UNSET_KEY;

    fn writer(log: &InMemoryLogStream) -> StreamWriter {
        StreamWriter::new(Arc::new(log.clone()), 42)
    }

    #[test]
    fn test_batch_is_tagged_and_atomic() {
        let log = InMemoryLogStream::new();
        let mut writer = writer(&log);

        writer.configure_source(7);
        writer.append_event(UNSET_KEY, ValueKind::Job, Intent::CREATED, vec![1]);
        writer.append_command(3, ValueKind::Timer, Intent::CREATE, vec![2]);

        let position = writer.flush().unwrap();
        assert_eq!(position, 2);
        assert!(writer.is_empty());

        let first = log.record_at(1).unwrap();
        assert_eq!(first.source_record_position, 7);
        assert_eq!(first.producer_id, 42);
        assert_eq!(first.record_kind, RecordKind::Event);

        let second = log.record_at(2).unwrap();
        assert_eq!(second.source_record_position, 7);
        assert_eq!(second.record_kind, RecordKind::Command);
        assert_eq!(second.key, 3);
    }

    #[test]
    fn test_flush_empty_batch_is_a_noop() {
        let log = InMemoryLogStream::new();
        let mut writer = writer(&log);
        assert_eq!(writer.flush().unwrap(), UNSET_POSITION);
        assert_eq!(log.record_count(), 0);
    }

    #[test]
    fn test_failed_flush_keeps_batch_for_retry() {
        let log = InMemoryLogStream::new();
        let mut writer = writer(&log);
        writer.configure_source(1);
        writer.append_event(UNSET_KEY, ValueKind::Job, Intent::CREATED, vec![1]);

        log.set_backpressure(true);
        assert!(matches!(writer.flush(), Err(LogError::Backpressure)));
        assert_eq!(writer.staged_count(), 1);

        log.set_backpressure(false);
        assert_eq!(writer.flush().unwrap(), 1);
        assert_eq!(log.record_count(), 1);
    }

    #[test]
    fn test_reset_discards_partial_batch() {
        let log = InMemoryLogStream::new();
        let mut writer = writer(&log);
        writer.append_event(UNSET_KEY, ValueKind::Job, Intent::CREATED, vec![1]);
        writer.reset();
        assert!(writer.is_empty());
        assert_eq!(writer.flush().unwrap(), UNSET_POSITION);
    }

    #[test]
    fn test_rejection_carries_command_identity() {
        let log = InMemoryLogStream::new();
        let mut writer = writer(&log);

        let command = LogRecord {
            key: 11,
            position: 1,
            source_record_position: UNSET_POSITION,
            producer_id: 1,
            timestamp: 0,
            record_kind: RecordKind::Command,
            value_kind: ValueKind::Job,
            intent: Intent::CREATE,
            rejection: None,
            value: vec![9],
        };

        writer.configure_source(command.position);
        writer.append_rejection(&command, RejectionKind::InvalidState, "already created");
        writer.flush().unwrap();

        let rejection = log.record_at(1).unwrap();
        assert_eq!(rejection.record_kind, RecordKind::CommandRejection);
        assert_eq!(rejection.key, 11);
        assert_eq!(rejection.intent, Intent::CREATE);
        let details = rejection.rejection.unwrap();
        assert_eq!(details.kind, RejectionKind::InvalidState);
        assert_eq!(details.reason, "already created");
    }
}
