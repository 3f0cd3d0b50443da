//! Engine assembly.
//!
//! Wires the collaborators together and runs the partition lifecycle on two
//! tokio tasks: one drives recovery-by-replay followed by steady-state
//! processing, the other directs snapshots. The handle is the only way to
//! observe or stop a running engine.

use crate::dispatch::DispatchTable;
use crate::log::stream::LogStream;
use crate::processor::context::{
    EnginePositions, ProcessingContext, ProcessorConfig, RecordFilter,
};
use crate::processor::processing::ProcessingStateMachine;
use crate::processor::reprocessing::ReprocessingStateMachine;
use crate::processor::response::{NoopResponseTransport, ResponseTransport};
use crate::retry::AbortSignal;
use crate::snapshot::director::{SnapshotDirector, SnapshotRequest};
use crate::snapshot::{SnapshotController, SnapshotError};
use crate::state::TransactionContext;
use slog::{error, info, o, Logger};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Externally observable lifecycle of one engine instance.
#[derive(Clone, Debug, PartialEq)]
pub enum EnginePhase {
    /// Rebuilding state from the log.
    Replay,

    /// Steady-state command processing.
    Processing,

    /// Stopped after a fatal failure; the partition must not process further
    /// records until recovered elsewhere.
    Failed(String),

    /// Stopped cleanly.
    Closed,
}

/// Builds and spawns a `StreamProcessor`.
pub struct StreamProcessorBuilder {
    log: Arc<dyn LogStream>,
    transaction_context: Arc<dyn TransactionContext>,
    dispatch: Arc<DispatchTable>,
    snapshot_controller: Arc<dyn SnapshotController>,
    logger: Logger,
    responses: Arc<dyn ResponseTransport>,
    filter: Option<RecordFilter>,
    config: ProcessorConfig,
}

impl StreamProcessorBuilder {
    pub fn with_responses(mut self, responses: Arc<dyn ResponseTransport>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the engine tasks and hand back the control handle.
    pub fn spawn(self) -> StreamProcessorHandle {
        let abort = AbortSignal::new();
        let positions = EnginePositions::new();
        let logger = self.logger.new(o!("producer_id" => self.config.producer_id));
        let context = ProcessingContext {
            log: self.log,
            transaction_context: self.transaction_context,
            dispatch: self.dispatch,
            responses: self.responses,
            filter: self.filter,
            positions: positions.clone(),
            abort: abort.clone(),
            config: self.config,
            logger: logger.clone(),
        };

        let (phase_tx, phase_rx) = watch::channel(EnginePhase::Replay);
        let (snapshot_requests, request_rx) = mpsc::channel(8);

        let director =
            SnapshotDirector::new(&context, self.snapshot_controller.clone(), request_rx);
        let director_task = tokio::spawn(director.run());

        let snapshot_controller = self.snapshot_controller;
        let engine_task = tokio::spawn(async move {
            run_engine(context, snapshot_controller, phase_tx).await;
        });

        StreamProcessorHandle {
            positions,
            abort,
            phase: phase_rx,
            snapshot_requests,
            engine_task,
            director_task,
        }
    }
}

async fn run_engine(
    context: ProcessingContext,
    snapshot_controller: Arc<dyn SnapshotController>,
    phase: watch::Sender<EnginePhase>,
) {
    let logger = context.logger.clone();
    let snapshot_position = snapshot_controller.last_valid_snapshot_position();
    let mut reprocessing = ReprocessingStateMachine::new(&context, snapshot_position);
    match reprocessing.run().await {
        Ok(Some(report)) => {
            info!(logger, "Recovery finished";
                "snapshot_position" => snapshot_position,
                "replay_boundary" => report.last_source_event_position,
                "reprocessed" => report.reprocessed,
                "skipped" => report.skipped);
        }
        Ok(None) => {
            // Closed mid-replay; the cursors were never restored, so the
            // engine stops without entering steady-state processing.
            info!(logger, "Recovery aborted");
            let _ = phase.send(EnginePhase::Closed);
            return;
        }
        Err(failure) => {
            error!(logger, "Recovery failed"; "error" => %failure);
            let _ = phase.send(EnginePhase::Failed(failure.to_string()));
            return;
        }
    }

    for handler in context.dispatch.handlers() {
        handler.on_open();
    }
    let _ = phase.send(EnginePhase::Processing);

    let mut processing = ProcessingStateMachine::new(&context);
    let result = processing.run().await;

    for handler in context.dispatch.handlers() {
        handler.on_close();
    }
    match result {
        Ok(()) => {
            info!(logger, "Engine closed");
            let _ = phase.send(EnginePhase::Closed);
        }
        Err(failure) => {
            error!(logger, "Engine failed"; "error" => %failure);
            let _ = phase.send(EnginePhase::Failed(failure.to_string()));
        }
    }
}

/// Per-partition deterministic processing engine.
pub struct StreamProcessor;

impl StreamProcessor {
    pub fn builder(
        log: Arc<dyn LogStream>,
        transaction_context: Arc<dyn TransactionContext>,
        dispatch: DispatchTable,
        snapshot_controller: Arc<dyn SnapshotController>,
        logger: Logger,
    ) -> StreamProcessorBuilder {
        StreamProcessorBuilder {
            log,
            transaction_context,
            dispatch: Arc::new(dispatch),
            snapshot_controller,
            logger,
            responses: Arc::new(NoopResponseTransport),
            filter: None,
            config: ProcessorConfig::default(),
        }
    }
}

/// Control handle for a spawned engine.
pub struct StreamProcessorHandle {
    positions: EnginePositions,
    abort: AbortSignal,
    phase: watch::Receiver<EnginePhase>,
    snapshot_requests: mpsc::Sender<SnapshotRequest>,
    engine_task: JoinHandle<()>,
    director_task: JoinHandle<()>,
}

impl StreamProcessorHandle {
    pub fn phase(&self) -> EnginePhase {
        self.phase.borrow().clone()
    }

    /// Watch receiver for phase transitions.
    pub fn phase_watch(&self) -> watch::Receiver<EnginePhase> {
        self.phase.clone()
    }

    /// Wait until the engine reaches the given phase. Returns `false` if the
    /// engine stopped in a different terminal phase instead.
    pub async fn wait_for_phase(&self, target: EnginePhase) -> bool {
        let mut watch = self.phase.clone();
        loop {
            let current = watch.borrow_and_update().clone();
            if current == target {
                return true;
            }
            if matches!(current, EnginePhase::Failed(_) | EnginePhase::Closed) {
                return false;
            }
            if watch.changed().await.is_err() {
                return false;
            }
        }
    }

    pub async fn last_processed_position(&self) -> i64 {
        self.positions.last_processed().await
    }

    pub async fn last_written_position(&self) -> i64 {
        self.positions.last_written().await
    }

    /// Force a snapshot at the given positions, outside the periodic
    /// schedule, waiting until it is valid (or rejected).
    pub async fn enforce_snapshot_creation(
        &self,
        written_position: i64,
        processed_position: i64,
    ) -> Result<i64, SnapshotError> {
        let (ack, response) = oneshot::channel();
        self.snapshot_requests
            .send(SnapshotRequest {
                processed_position,
                written_position,
                ack,
            })
            .await
            .map_err(|_| SnapshotError::NotTaken {
                reason: "snapshot director stopped".to_string(),
            })?;
        response.await.map_err(|_| SnapshotError::NotTaken {
            reason: "snapshot director stopped".to_string(),
        })?
    }

    /// Stop the engine: take a final snapshot, stop both tasks and wait for
    /// them to finish.
    pub async fn close(self) {
        let state = self.positions.state().await;
        let _ = self
            .enforce_snapshot_creation(state.last_written, state.last_processed)
            .await;
        self.abort.trigger();
        let _ = self.engine_task.await;
        let _ = self.director_task.await;
    }
}
