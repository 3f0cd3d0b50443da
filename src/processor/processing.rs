//! Steady-state processing.
//!
//! Reads committed records past the replay boundary one at a time and drives
//! each through apply, write, commit and side-effect phases. A failed apply
//! is routed to the handler's error hook in a fresh transaction; the hook's
//! output runs through the same write/commit pipeline and the record is
//! marked processed once that output commits.

use crate::error::EngineError;
use crate::log::record::{LogRecord, UNSET_POSITION};
use crate::log::stream::{LogError, LogEvent, LogStream, LogStreamReader};
use crate::processor::context::{EnginePositions, ProcessingContext, RecordFilter};
use crate::processor::response::ResponseWriter;
use crate::processor::writer::StreamWriter;
use crate::retry::{AbortSignal, AbortableRetryStrategy, RecoverableRetryStrategy};
use crate::state::{Transaction, TransactionContext};
use slog::{debug, error, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Phases one record moves through. Held in a loop rather than recursive
/// calls so error handling can re-enter the write path without boxing
/// futures.
enum Stage {
    Apply,
    ErrorHandling(EngineError),
    Write,
    Commit,
    SideEffects,
}

pub struct ProcessingStateMachine {
    log: Arc<dyn LogStream>,
    reader: Box<dyn LogStreamReader>,
    events: broadcast::Receiver<LogEvent>,
    transaction_context: Arc<dyn TransactionContext>,
    dispatch: Arc<crate::dispatch::DispatchTable>,
    filter: Option<RecordFilter>,
    positions: EnginePositions,
    abort: AbortSignal,
    writer: StreamWriter,
    responses: ResponseWriter,
    write_retry: AbortableRetryStrategy,
    side_effect_retry: AbortableRetryStrategy,
    update_state_retry: RecoverableRetryStrategy,
    processing_retry_delay: Duration,
    reached_end: bool,
    logger: Logger,
}

impl ProcessingStateMachine {
    pub fn new(context: &ProcessingContext) -> Self {
        let backoff = context.config.retry_backoff;
        Self {
            log: context.log.clone(),
            reader: context.log.new_reader(),
            events: context.log.subscribe(),
            transaction_context: context.transaction_context.clone(),
            dispatch: context.dispatch.clone(),
            filter: context.filter.clone(),
            positions: context.positions.clone(),
            abort: context.abort.clone(),
            writer: StreamWriter::new(context.log.clone(), context.config.producer_id),
            responses: ResponseWriter::new(context.responses.clone()),
            write_retry: AbortableRetryStrategy::new(backoff),
            side_effect_retry: AbortableRetryStrategy::new(backoff),
            update_state_retry: RecoverableRetryStrategy::new(backoff),
            processing_retry_delay: context.config.processing_retry_delay,
            reached_end: true,
            logger: context.logger.new(o!("component" => "processing")),
        }
    }

    /// True when the reader has caught up with the end of the log.
    pub fn has_reached_end(&self) -> bool {
        self.reached_end
    }

    /// Drive the processing loop until the abort signal fires or a fatal
    /// failure is hit.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let resume_after = self.positions.last_processed().await;
        self.reader.seek_after(resume_after);
        info!(self.logger, "Processing started"; "resume_after" => resume_after);

        loop {
            if self.abort.is_aborted() {
                return Ok(());
            }
            self.wait_for_error_record_commit().await;
            let record = match self.read_next().await {
                Some(record) => record,
                None => return Ok(()),
            };
            self.process_record(&record).await?;
        }
    }

    /// Reads must not move past a written error record until the log has
    /// durably committed it; otherwise a crash could lose the error record
    /// while its state changes survive in a snapshot.
    async fn wait_for_error_record_commit(&mut self) {
        let gate = self.positions.error_record_position().await;
        if gate == UNSET_POSITION {
            return;
        }
        while self.log.commit_position() < gate {
            tokio::select! {
                _ = self.abort.aborted() => return,
                event = self.events.recv() => match event {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
        self.positions.clear_error_record_position().await;
        info!(self.logger, "Error record committed, resuming"; "position" => gate);
    }

    async fn read_next(&mut self) -> Option<LogRecord> {
        loop {
            if self.abort.is_aborted() {
                return None;
            }
            if self.reader.has_next() {
                self.reached_end = false;
                return self.reader.next();
            }
            self.reached_end = true;
            tokio::select! {
                _ = self.abort.aborted() => return None,
                event = self.events.recv() => match event {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }

    async fn process_record(&mut self, record: &LogRecord) -> Result<(), EngineError> {
        let position = record.position;

        if let Some(filter) = &self.filter {
            if !filter(record) {
                debug!(self.logger, "Record filtered out"; "position" => position);
                self.positions.record_skipped(position).await;
                return Ok(());
            }
        }
        let handler = match self
            .dispatch
            .lookup(record.record_kind, record.value_kind, record.intent)
        {
            Some(handler) => handler.clone(),
            None => {
                debug!(self.logger, "No handler registered, skipping";
                    "position" => position,
                    "value_kind" => ?record.value_kind,
                    "intent" => ?record.intent);
                self.positions.record_skipped(position).await;
                return Ok(());
            }
        };

        let mut stage = Stage::Apply;
        let mut transaction: Option<Box<dyn Transaction>> = None;
        let mut written_position = UNSET_POSITION;
        let mut error_mode = false;

        loop {
            if self.abort.is_aborted() {
                if let Some(txn) = transaction.as_mut() {
                    Self::roll_back(self.processing_retry_delay, &self.abort, txn).await?;
                }
                return Ok(());
            }
            match stage {
                Stage::Apply => {
                    self.writer.reset();
                    self.responses.reset();
                    self.writer.configure_source(position);

                    let mut txn = self.transaction_context.begin().map_err(EngineError::from)?;
                    let responses = &mut self.responses;
                    let writer = &mut self.writer;
                    let mut work = || -> Result<(), EngineError> {
                        handler.apply(record, responses)?;
                        handler.write_follow_ups(record, writer)
                    };
                    match txn.run(&mut work) {
                        Ok(()) => {
                            transaction = Some(txn);
                            stage = Stage::Write;
                        }
                        Err(failure) if failure.is_recoverable() => {
                            warn!(self.logger, "Recoverable processing failure, retrying";
                                "position" => position, "error" => %failure);
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            tokio::time::sleep(self.processing_retry_delay).await;
                            stage = Stage::Apply;
                        }
                        Err(failure) if failure.is_fatal() => {
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            return Err(failure);
                        }
                        Err(failure) => {
                            error!(self.logger, "Processing failed, running error hook";
                                "position" => position, "error" => %failure);
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            stage = Stage::ErrorHandling(failure);
                        }
                    }
                }
                Stage::ErrorHandling(failure) => {
                    error_mode = true;
                    self.positions.begin_error_handling().await;
                    self.writer.reset();
                    self.responses.reset();
                    self.writer.configure_source(position);

                    let mut txn = self.transaction_context.begin().map_err(EngineError::from)?;
                    let responses = &mut self.responses;
                    let writer = &mut self.writer;
                    let mut work = || -> Result<(), EngineError> {
                        handler.on_error(&failure, record, writer, responses)
                    };
                    match txn.run(&mut work) {
                        Ok(()) => {
                            transaction = Some(txn);
                            stage = Stage::Write;
                        }
                        Err(hook_failure) if hook_failure.is_recoverable() => {
                            warn!(self.logger, "Recoverable failure in error hook, retrying";
                                "position" => position, "error" => %hook_failure);
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            tokio::time::sleep(self.processing_retry_delay).await;
                            stage = Stage::ErrorHandling(failure);
                        }
                        Err(hook_failure) if hook_failure.is_fatal() => {
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            return Err(hook_failure);
                        }
                        Err(hook_failure) => {
                            // The hook itself failed; re-enter error handling
                            // with the new failure.
                            error!(self.logger, "Error hook failed";
                                "position" => position, "error" => %hook_failure);
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            stage = Stage::ErrorHandling(hook_failure);
                        }
                    }
                }
                Stage::Write => {
                    let writer = &mut self.writer;
                    let retry = &self.write_retry;
                    let mut last_written = UNSET_POSITION;
                    let result = retry
                        .run(
                            || match writer.flush() {
                                Ok(appended) => {
                                    last_written = appended;
                                    Ok(true)
                                }
                                Err(LogError::Backpressure) => Ok(false),
                                Err(LogError::AppendFailed { reason }) => {
                                    Err(EngineError::Unexpected(reason))
                                }
                            },
                            &self.abort,
                        )
                        .await;
                    match result {
                        Ok(true) => {
                            written_position = last_written;
                            stage = Stage::Commit;
                        }
                        Ok(false) => {
                            // Aborted mid-record; the record stays unprocessed
                            // and will be picked up again after restart.
                            if let Some(txn) = transaction.as_mut() {
                                Self::roll_back(self.processing_retry_delay, &self.abort, txn).await?;
                            }
                            return Ok(());
                        }
                        Err(failure) => {
                            error!(self.logger, "Failed to write follow-up records";
                                "position" => position, "error" => %failure);
                            if let Some(txn) = transaction.as_mut() {
                                Self::roll_back(self.processing_retry_delay, &self.abort, txn).await?;
                            }
                            transaction = None;
                            stage = Stage::ErrorHandling(failure);
                        }
                    }
                }
                Stage::Commit => {
                    let mut txn = match transaction.take() {
                        Some(txn) => txn,
                        None => {
                            return Err(EngineError::Fatal(
                                "commit reached without an open transaction".to_string(),
                            ))
                        }
                    };
                    let retry = &self.update_state_retry;
                    let result = retry
                        .run(
                            || {
                                txn.commit()?;
                                Ok(true)
                            },
                            &self.abort,
                        )
                        .await;
                    match result {
                        Ok(true) => {
                            self.positions
                                .record_committed(position, written_position)
                                .await;
                            if error_mode {
                                if written_position != UNSET_POSITION {
                                    self.positions
                                        .set_error_record_position(written_position)
                                        .await;
                                }
                                self.positions.finish_error_handling().await;
                            }
                            stage = Stage::SideEffects;
                        }
                        Ok(false) => {
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            return Ok(());
                        }
                        Err(failure) if failure.is_fatal() => {
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            return Err(failure);
                        }
                        Err(failure) => {
                            error!(self.logger, "Failed to commit state";
                                "position" => position, "error" => %failure);
                            Self::roll_back(self.processing_retry_delay, &self.abort, &mut txn).await?;
                            stage = Stage::ErrorHandling(failure);
                        }
                    }
                }
                Stage::SideEffects => {
                    let responses = &mut self.responses;
                    let retry = &self.side_effect_retry;
                    let result = retry
                        .run(
                            || Ok(responses.flush() && handler.execute_side_effects(record)),
                            &self.abort,
                        )
                        .await;
                    match result {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(self.logger, "Side effects aborted"; "position" => position);
                        }
                        Err(failure) => {
                            // Side effects are best-effort; the record is
                            // already processed and must not be replayed.
                            warn!(self.logger, "Side effects failed";
                                "position" => position, "error" => %failure);
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    // Associated fn on purpose: holding `&self` across the await would pull
    // the non-Sync reader into the spawned future.
    async fn roll_back(
        delay: Duration,
        abort: &AbortSignal,
        transaction: &mut Box<dyn Transaction>,
    ) -> Result<(), EngineError> {
        let retry = RecoverableRetryStrategy::new(delay.min(Duration::from_millis(10)));
        let result = retry
            .run(
                || {
                    transaction.rollback()?;
                    Ok(true)
                },
                abort,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(failure) => Err(EngineError::Fatal(format!(
                "failed to roll back transaction: {}",
                failure
            ))),
        }
    }
}
