//! Recovery by replay.
//!
//! After restart the engine rebuilds its state from the log instead of
//! trusting anything volatile: it scans forward from the snapshot position to
//! find the replay boundary (the highest source position referenced by a
//! follow-up record), then re-processes the commands up to that boundary.
//! Would-be writes are diverted into a projection and checked against the
//! records that are already on the log; any mismatch means the state no
//! longer derives from the log and the engine must stop.

use crate::dispatch::{DispatchTable, RecordHandler};
use crate::error::EngineError;
use crate::log::record::{
    Intent, LogRecord, RecordKind, RejectionKind, ValueKind, UNSET_POSITION,
};
use crate::log::stream::LogStream;
use crate::processor::context::{EnginePositions, ProcessingContext, RecordFilter};
use crate::processor::response::ResponseWriter;
use crate::processor::writer::StreamWriter;
use crate::retry::{AbortSignal, EndlessRetryStrategy};
use crate::state::TransactionContext;
use slog::{debug, info, o, Logger};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Summary of one recovery pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReprocessingReport {
    /// The replay boundary; `UNSET_POSITION` when nothing had to be replayed.
    pub last_source_event_position: i64,

    /// Commands that were re-applied against the state.
    pub reprocessed: u64,

    /// Records below the boundary that were skipped.
    pub skipped: u64,

    /// Highest position observed on the log during the scan.
    pub highest_position: i64,
}

/// What a reprocessed command would have written, kept for comparison with
/// the records that follow on the log.
#[derive(Debug, PartialEq)]
struct ProjectedRecord {
    key: i64,
    source_record_position: i64,
    record_kind: RecordKind,
    value_kind: ValueKind,
    intent: Intent,
}

struct ScanOutcome {
    boundary: i64,
    highest_position: i64,
    last_own_written: i64,
    failed: HashSet<i64>,
}

pub struct ReprocessingStateMachine {
    log: Arc<dyn LogStream>,
    transaction_context: Arc<dyn TransactionContext>,
    dispatch: Arc<DispatchTable>,
    filter: Option<RecordFilter>,
    positions: EnginePositions,
    abort: AbortSignal,
    writer: StreamWriter,
    responses: ResponseWriter,
    replay_retry: EndlessRetryStrategy,
    producer_id: i64,
    snapshot_position: i64,
    projection: VecDeque<ProjectedRecord>,
    logger: Logger,
}

impl ReprocessingStateMachine {
    pub fn new(context: &ProcessingContext, snapshot_position: i64) -> Self {
        Self {
            log: context.log.clone(),
            transaction_context: context.transaction_context.clone(),
            dispatch: context.dispatch.clone(),
            filter: context.filter.clone(),
            positions: context.positions.clone(),
            abort: context.abort.clone(),
            writer: StreamWriter::new(context.log.clone(), context.config.producer_id),
            responses: ResponseWriter::new(context.responses.clone()),
            replay_retry: EndlessRetryStrategy::new(context.config.retry_backoff),
            producer_id: context.config.producer_id,
            snapshot_position,
            projection: VecDeque::new(),
            logger: context.logger.new(o!("component" => "reprocessing")),
        }
    }

    /// Returns `None` when the engine was aborted mid-replay: the cursors are
    /// left untouched in that case, since the state only partially derives
    /// from the log.
    pub async fn run(&mut self) -> Result<Option<ReprocessingReport>, EngineError> {
        let scan = self.scan()?;
        info!(self.logger, "Replay scan finished";
            "snapshot_position" => self.snapshot_position,
            "boundary" => scan.boundary,
            "highest_position" => scan.highest_position,
            "failed_records" => scan.failed.len());

        // The snapshot covers everything up to its position, so the written
        // cursor never restores below it even when no own records follow.
        let last_written = scan.last_own_written.max(self.snapshot_position);

        // Sources at or below the snapshot position are already reflected in
        // the snapshotted state; nothing has to be replayed for them.
        if scan.boundary <= self.snapshot_position {
            self.positions
                .restore(self.snapshot_position, last_written)
                .await;
            return Ok(Some(ReprocessingReport {
                last_source_event_position: scan.boundary,
                reprocessed: 0,
                skipped: 0,
                highest_position: scan.highest_position,
            }));
        }

        let (reprocessed, skipped) = match self.replay(&scan).await? {
            Some(counts) => counts,
            None => {
                info!(self.logger, "Replay aborted before reaching the boundary";
                    "boundary" => scan.boundary);
                return Ok(None);
            }
        };
        self.positions.restore(scan.boundary, last_written).await;
        info!(self.logger, "Replay finished";
            "boundary" => scan.boundary,
            "reprocessed" => reprocessed,
            "skipped" => skipped);

        Ok(Some(ReprocessingReport {
            last_source_event_position: scan.boundary,
            reprocessed,
            skipped,
            highest_position: scan.highest_position,
        }))
    }

    /// Forward scan collecting the replay boundary, the positions of records
    /// whose original processing failed, and the highest position written by
    /// this engine instance.
    fn scan(&mut self) -> Result<ScanOutcome, EngineError> {
        let mut reader = self.log.new_reader();
        reader.seek_after(self.snapshot_position);

        let mut boundary = UNSET_POSITION;
        let mut highest_position = UNSET_POSITION;
        let mut last_own_written = UNSET_POSITION;
        let mut failed = HashSet::new();

        while let Some(record) = reader.next() {
            highest_position = record.position;
            if record.producer_id == self.producer_id {
                last_own_written = record.position;
            }
            if record.has_source() && record.source_record_position > boundary {
                boundary = record.source_record_position;
            }
            if let Some(position) = self.failed_source_of(&record) {
                failed.insert(position);
            }
        }

        if boundary > highest_position {
            return Err(EngineError::Fatal(format!(
                "replay boundary {} lies beyond the end of the log at {}",
                boundary, highest_position
            )));
        }
        Ok(ScanOutcome {
            boundary,
            highest_position,
            last_own_written,
            failed,
        })
    }

    /// A rejection written by the error hook, or an error record, marks its
    /// source command as failed: that command must not be re-applied during
    /// replay because its state changes were rolled back.
    fn failed_source_of(&self, record: &LogRecord) -> Option<i64> {
        if record.record_kind == RecordKind::CommandRejection {
            if let Some(rejection) = &record.rejection {
                if rejection.kind == RejectionKind::ProcessingError && record.has_source() {
                    return Some(record.source_record_position);
                }
            }
        }
        if record.value_kind == ValueKind::Error {
            if let Some(handler) =
                self.dispatch
                    .lookup(record.record_kind, record.value_kind, record.intent)
            {
                return handler.failed_position(record);
            }
        }
        None
    }

    async fn replay(&mut self, scan: &ScanOutcome) -> Result<Option<(u64, u64)>, EngineError> {
        let mut reader = self.log.new_reader();
        reader.seek_after(self.snapshot_position);

        let mut reprocessed = 0u64;
        let mut skipped = 0u64;
        let mut reached_boundary = false;

        while let Some(record) = reader.next() {
            if self.abort.is_aborted() {
                return Ok(None);
            }
            if record.position > scan.boundary {
                break;
            }

            if record.is_event_or_rejection() {
                // Records sourced at or below the snapshot position were
                // produced by commands the snapshot already covers; those
                // commands are never replayed, so there is nothing in the
                // projection to match them against.
                if record.has_source() && record.source_record_position > self.snapshot_position {
                    self.match_against_projection(&record)?;
                }
                skipped += 1;
            } else if self.is_filtered_out(&record) {
                skipped += 1;
            } else {
                match self
                    .dispatch
                    .lookup(record.record_kind, record.value_kind, record.intent)
                    .cloned()
                {
                    Some(handler) => {
                        if scan.failed.contains(&record.position) {
                            debug!(self.logger, "Replaying error hook for failed command";
                                "position" => record.position);
                            self.reprocess_error_hook(&handler, &record).await;
                        } else {
                            self.reprocess_command(&handler, &record).await;
                        }
                        reprocessed += 1;
                    }
                    None => skipped += 1,
                }
            }

            if record.position == scan.boundary {
                reached_boundary = true;
                break;
            }
        }

        if !reached_boundary {
            return Err(EngineError::Fatal(format!(
                "log ended before the replay boundary {} was reached",
                scan.boundary
            )));
        }
        Ok(Some((reprocessed, skipped)))
    }

    fn is_filtered_out(&self, record: &LogRecord) -> bool {
        match &self.filter {
            Some(filter) => !filter(record),
            None => false,
        }
    }

    /// Re-apply one command in a full transaction cycle, retrying until it
    /// goes through. Output is diverted into the projection; responses are
    /// discarded because the original processing already answered the client.
    async fn reprocess_command(&mut self, handler: &Arc<dyn RecordHandler>, record: &LogRecord) {
        let transaction_context = &self.transaction_context;
        let writer = &mut self.writer;
        let responses = &mut self.responses;
        let position = record.position;

        self.replay_retry
            .run(|| {
                writer.reset();
                responses.reset();
                writer.configure_source(position);
                let mut txn = transaction_context.begin()?;
                let mut work = || -> Result<(), EngineError> {
                    handler.apply(record, responses)?;
                    handler.write_follow_ups(record, writer)
                };
                match txn.run(&mut work) {
                    Ok(()) => {
                        txn.commit()?;
                        Ok(true)
                    }
                    Err(failure) => {
                        txn.rollback()?;
                        Err(failure)
                    }
                }
            })
            .await;

        self.project_staged();
    }

    /// Commands whose original processing failed had their state changes
    /// rolled back; replaying `apply` would introduce changes the log never
    /// confirmed. The error hook runs instead, so the rejection or error
    /// record on the log still finds its counterpart in the projection.
    async fn reprocess_error_hook(&mut self, handler: &Arc<dyn RecordHandler>, record: &LogRecord) {
        let failure = EngineError::Unexpected("processing failed in a previous run".to_string());
        let transaction_context = &self.transaction_context;
        let writer = &mut self.writer;
        let responses = &mut self.responses;
        let position = record.position;

        self.replay_retry
            .run(|| {
                writer.reset();
                responses.reset();
                writer.configure_source(position);
                let mut txn = transaction_context.begin()?;
                let mut work = || -> Result<(), EngineError> {
                    handler.on_error(&failure, record, writer, responses)
                };
                match txn.run(&mut work) {
                    Ok(()) => {
                        txn.commit()?;
                        Ok(true)
                    }
                    Err(hook_failure) => {
                        txn.rollback()?;
                        Err(hook_failure)
                    }
                }
            })
            .await;

        self.project_staged();
    }

    fn project_staged(&mut self) {
        self.responses.reset();
        for entry in self.writer.take_staged() {
            self.projection.push_back(ProjectedRecord {
                key: entry.key,
                source_record_position: entry.source_record_position,
                record_kind: entry.record_kind,
                value_kind: entry.value_kind,
                intent: entry.intent,
            });
        }
    }

    /// An engine-produced record on the log must equal, field for field, the
    /// next record the replayed commands would have written.
    fn match_against_projection(&mut self, record: &LogRecord) -> Result<(), EngineError> {
        let projected = self.projection.pop_front().ok_or_else(|| {
            EngineError::Fatal(format!(
                "record {} on the log has no counterpart in the replayed output",
                record.position
            ))
        })?;

        let matches = projected.key == record.key
            && projected.source_record_position == record.source_record_position
            && projected.record_kind == record.record_kind
            && projected.value_kind == record.value_kind
            && projected.intent == record.intent;
        if !matches {
            return Err(EngineError::Fatal(format!(
                "replay diverged at position {}: log has ({:?}, {:?}, {:?}) from source {}, \
                 replay produced ({:?}, {:?}, {:?}) from source {}",
                record.position,
                record.record_kind,
                record.value_kind,
                record.intent,
                record.source_record_position,
                projected.record_kind,
                projected.value_kind,
                projected.intent,
                projected.source_record_position,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTableBuilder;
    use crate::log::memory::InMemoryLogStream;
    use crate::log::record::Rejection;
    use crate::log::stream::LogEntry;
    use crate::processor::context::ProcessorConfig;
    use crate::processor::response::NoopResponseTransport;
    use crate::state::memory::InMemoryStateStore;

    const ENGINE: i64 = 7;
    const CLIENT: i64 = 99;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn command(key: i64, intent: Intent) -> LogEntry {
        LogEntry {
            key,
            record_kind: RecordKind::Command,
            value_kind: ValueKind::Job,
            intent,
            rejection: None,
            value: vec![],
            source_record_position: UNSET_POSITION,
            producer_id: CLIENT,
        }
    }

    fn event(key: i64, intent: Intent, source: i64) -> LogEntry {
        LogEntry {
            key,
            record_kind: RecordKind::Event,
            value_kind: ValueKind::Job,
            intent,
            rejection: None,
            value: vec![],
            source_record_position: source,
            producer_id: ENGINE,
        }
    }

    fn processing_rejection(key: i64, intent: Intent, source: i64) -> LogEntry {
        LogEntry {
            key,
            record_kind: RecordKind::CommandRejection,
            value_kind: ValueKind::Job,
            intent,
            rejection: Some(Rejection {
                kind: RejectionKind::ProcessingError,
                reason: "original processing failed".to_string(),
            }),
            value: vec![],
            source_record_position: source,
            producer_id: ENGINE,
        }
    }

    /// CREATE puts the job and emits CREATED; ACTIVATE flips the state and
    /// emits ACTIVATED.
    struct JobReplayHandler {
        store: InMemoryStateStore,
    }

    impl RecordHandler for JobReplayHandler {
        fn apply(
            &self,
            record: &LogRecord,
            _responses: &mut ResponseWriter,
        ) -> Result<(), EngineError> {
            let state = if record.intent == Intent::CREATE { 1 } else { 2 };
            self.store
                .put(&format!("job/{}", record.key), vec![state])
                .map_err(EngineError::from)
        }

        fn write_follow_ups(
            &self,
            record: &LogRecord,
            writer: &mut StreamWriter,
        ) -> Result<(), EngineError> {
            let intent = if record.intent == Intent::CREATE {
                Intent::CREATED
            } else {
                Intent::ACTIVATED
            };
            writer.append_event(record.key, ValueKind::Job, intent, vec![]);
            Ok(())
        }

        fn on_error(
            &self,
            _failure: &EngineError,
            record: &LogRecord,
            writer: &mut StreamWriter,
            _responses: &mut ResponseWriter,
        ) -> Result<(), EngineError> {
            writer.append_rejection(record, RejectionKind::ProcessingError, "job state corrupt");
            Ok(())
        }
    }

    struct Fixture {
        store: InMemoryStateStore,
        positions: EnginePositions,
        abort: AbortSignal,
        machine: ReprocessingStateMachine,
    }

    fn fixture(log: &InMemoryLogStream, snapshot_position: i64) -> Fixture {
        let store = InMemoryStateStore::new();
        let handler = Arc::new(JobReplayHandler {
            store: store.clone(),
        });
        let mut builder = DispatchTableBuilder::new();
        for intent in [Intent::CREATE, Intent::ACTIVATE] {
            builder
                .register(RecordKind::Command, ValueKind::Job, intent, handler.clone())
                .unwrap();
        }

        let context = ProcessingContext {
            log: Arc::new(log.clone()),
            transaction_context: Arc::new(store.clone()),
            dispatch: Arc::new(builder.build()),
            responses: Arc::new(NoopResponseTransport),
            filter: None,
            positions: EnginePositions::new(),
            abort: AbortSignal::new(),
            config: ProcessorConfig {
                producer_id: ENGINE,
                ..ProcessorConfig::default()
            },
            logger: test_logger(),
        };
        let machine = ReprocessingStateMachine::new(&context, snapshot_position);
        Fixture {
            store,
            positions: context.positions.clone(),
            abort: context.abort.clone(),
            machine,
        }
    }

    #[tokio::test]
    async fn test_replay_rebuilds_state_up_to_boundary() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1
        log.append(vec![event(11, Intent::CREATED, 1)]).unwrap(); // 2
        log.append(vec![command(11, Intent::ACTIVATE)]).unwrap(); // 3
        log.append(vec![event(11, Intent::ACTIVATED, 3)]).unwrap(); // 4

        let mut fixture = fixture(&log, UNSET_POSITION);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, 3);
        assert_eq!(report.reprocessed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.highest_position, 4);

        assert_eq!(fixture.store.get("job/11"), Some(vec![2]));
        assert_eq!(fixture.positions.last_processed().await, 3);
        assert_eq!(fixture.positions.last_written().await, 4);
    }

    #[tokio::test]
    async fn test_divergence_is_fatal() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1
        // The log claims processing produced FAILED, but the handler
        // deterministically produces CREATED.
        log.append(vec![event(11, Intent::FAILED, 1)]).unwrap(); // 2
        log.append(vec![command(11, Intent::ACTIVATE)]).unwrap(); // 3
        log.append(vec![event(11, Intent::ACTIVATED, 3)]).unwrap(); // 4

        let mut fixture = fixture(&log, UNSET_POSITION);
        let result = fixture.machine.run().await;
        assert!(matches!(result, Err(EngineError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_failed_commands_replay_the_error_hook() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1, failed originally
        log.append(vec![processing_rejection(11, Intent::CREATE, 1)])
            .unwrap(); // 2
        log.append(vec![command(12, Intent::CREATE)]).unwrap(); // 3
        log.append(vec![event(12, Intent::CREATED, 3)]).unwrap(); // 4

        let mut fixture = fixture(&log, UNSET_POSITION);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, 3);
        assert_eq!(report.reprocessed, 2);
        assert_eq!(report.skipped, 1);

        // The hook produced the rejection the log already carries, but the
        // rolled-back apply left no state behind.
        assert_eq!(fixture.store.get("job/11"), None);
        assert_eq!(fixture.store.get("job/12"), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_boundary_beyond_log_end_is_fatal() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1
        log.append(vec![event(11, Intent::CREATED, 5)]).unwrap(); // 2, source missing

        let mut fixture = fixture(&log, UNSET_POSITION);
        let result = fixture.machine.run().await;
        assert!(matches!(result, Err(EngineError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_no_follow_ups_means_nothing_to_replay() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1

        let mut fixture = fixture(&log, UNSET_POSITION);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, UNSET_POSITION);
        assert_eq!(report.reprocessed, 0);
        assert_eq!(fixture.positions.last_processed().await, UNSET_POSITION);
    }

    #[tokio::test]
    async fn test_snapshot_at_command_position_skips_covered_output() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1, covered by snapshot
        log.append(vec![event(11, Intent::CREATED, 1)]).unwrap(); // 2, sourced below snapshot
        log.append(vec![command(12, Intent::CREATE)]).unwrap(); // 3
        log.append(vec![event(12, Intent::CREATED, 3)]).unwrap(); // 4

        // The snapshot landed on the command itself, not its follow-up: the
        // event at 2 has no replayed counterpart and must not be matched.
        let mut fixture = fixture(&log, 1);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, 3);
        assert_eq!(report.reprocessed, 1);
        assert_eq!(fixture.store.get("job/11"), None);
        assert_eq!(fixture.store.get("job/12"), Some(vec![1]));
        assert_eq!(fixture.positions.last_processed().await, 3);
        assert_eq!(fixture.positions.last_written().await, 4);
    }

    #[tokio::test]
    async fn test_aborted_replay_does_not_restore_cursors() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1
        log.append(vec![event(11, Intent::CREATED, 1)]).unwrap(); // 2

        let mut fixture = fixture(&log, UNSET_POSITION);
        fixture.abort.trigger();
        let outcome = fixture.machine.run().await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(fixture.positions.last_processed().await, UNSET_POSITION);
        assert_eq!(fixture.positions.last_written().await, UNSET_POSITION);
    }

    #[tokio::test]
    async fn test_written_cursor_never_restores_below_snapshot() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1, covered by snapshot
        log.append(vec![event(11, Intent::CREATED, 1)]).unwrap(); // 2, covered by snapshot
        log.append(vec![command(12, Intent::CREATE)]).unwrap(); // 3, nothing written for it yet

        let mut fixture = fixture(&log, 2);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, UNSET_POSITION);
        assert_eq!(fixture.positions.last_processed().await, 2);
        assert_eq!(fixture.positions.last_written().await, 2);
    }

    #[tokio::test]
    async fn test_replay_starts_after_snapshot_position() {
        let log = InMemoryLogStream::new();
        log.append(vec![command(11, Intent::CREATE)]).unwrap(); // 1, covered by snapshot
        log.append(vec![event(11, Intent::CREATED, 1)]).unwrap(); // 2, covered by snapshot
        log.append(vec![command(12, Intent::CREATE)]).unwrap(); // 3
        log.append(vec![event(12, Intent::CREATED, 3)]).unwrap(); // 4

        let mut fixture = fixture(&log, 2);
        let report = fixture.machine.run().await.unwrap().unwrap();

        assert_eq!(report.last_source_event_position, 3);
        assert_eq!(report.reprocessed, 1);
        // Only the command after the snapshot was re-applied.
        assert_eq!(fixture.store.get("job/11"), None);
        assert_eq!(fixture.store.get("job/12"), Some(vec![1]));
    }
}
