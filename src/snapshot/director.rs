//! Snapshot director.
//!
//! Decides when snapshots are taken: periodically, on request, and only one
//! at a time. A temporary snapshot may cover records the log has not durably
//! committed yet, so it is promoted to valid only once the commit watermark
//! passes everything the snapshot could reference.

use crate::log::record::UNSET_POSITION;
use crate::log::stream::{LogEvent, LogStream};
use crate::processor::context::{EnginePositions, ProcessingContext};
use crate::retry::AbortSignal;
use crate::snapshot::{SnapshotController, SnapshotError};
use slog::{debug, error, info, o, Logger};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Answer channel for a forced snapshot request; carries the position of the
/// newly valid snapshot.
pub type SnapshotAck = oneshot::Sender<Result<i64, SnapshotError>>;

/// A forced snapshot outside the periodic schedule. Carries the positions the
/// caller observed instead of reading the live cursors, so the snapshot
/// covers exactly what the caller saw as processed.
pub struct SnapshotRequest {
    pub processed_position: i64,
    pub written_position: i64,
    pub ack: SnapshotAck,
}

/// Sending half used by the engine handle to force a snapshot.
pub type SnapshotRequestSender = mpsc::Sender<SnapshotRequest>;

struct PendingSnapshot {
    processed_position: i64,
    /// The snapshot becomes valid once the commit watermark reaches this.
    written_position: i64,
    acks: Vec<SnapshotAck>,
}

pub struct SnapshotDirector {
    log: Arc<dyn LogStream>,
    controller: Arc<dyn SnapshotController>,
    positions: EnginePositions,
    abort: AbortSignal,
    events: broadcast::Receiver<LogEvent>,
    requests: mpsc::Receiver<SnapshotRequest>,
    period: Duration,
    max_snapshots: usize,
    pending: Option<PendingSnapshot>,
    queued: VecDeque<SnapshotRequest>,
    logger: Logger,
}

impl SnapshotDirector {
    pub fn new(
        context: &ProcessingContext,
        controller: Arc<dyn SnapshotController>,
        requests: mpsc::Receiver<SnapshotRequest>,
    ) -> Self {
        Self {
            log: context.log.clone(),
            controller,
            positions: context.positions.clone(),
            abort: context.abort.clone(),
            events: context.log.subscribe(),
            requests,
            period: context.config.snapshot_period,
            max_snapshots: context.config.max_snapshots,
            pending: None,
            queued: VecDeque::new(),
            logger: context.logger.new(o!("component" => "snapshot-director")),
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the first real
        // trigger comes one full period in.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.abort.aborted() => {
                    self.try_finalize();
                    break;
                }
                _ = interval.tick() => {
                    self.on_tick().await;
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                event = self.events.recv() => match event {
                    Ok(LogEvent::CommitAdvanced(_)) => self.try_finalize(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => self.try_finalize(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!(self.logger, "Snapshot director stopped");
    }

    async fn on_tick(&mut self) {
        if self.pending.is_some() {
            self.try_finalize();
            return;
        }
        let state = self.positions.state().await;
        if state.on_error_handling {
            // The error record is not durable yet; a snapshot now could
            // capture state whose error record is lost on crash.
            debug!(self.logger, "Deferring snapshot during error handling");
            return;
        }
        self.take_snapshot(state.last_processed, state.last_written, None);
    }

    fn on_request(&mut self, request: SnapshotRequest) {
        if self.pending.is_some() {
            // At most one snapshot in flight. The in-flight one may cover
            // less than the caller observed, so the request is held for its
            // own snapshot instead of joining.
            self.queued.push_back(request);
            self.try_finalize();
            return;
        }
        self.take_snapshot(
            request.processed_position,
            request.written_position,
            Some(request.ack),
        );
    }

    fn take_snapshot(&mut self, processed_position: i64, written_position: i64, ack: Option<SnapshotAck>) {
        let last_valid = self.controller.last_valid_snapshot_position();
        if processed_position == UNSET_POSITION || processed_position <= last_valid {
            debug!(self.logger, "Nothing new to snapshot";
                "processed_position" => processed_position, "last_valid" => last_valid);
            if let Some(ack) = ack {
                let _ = ack.send(Ok(last_valid));
            }
            return;
        }

        match self.controller.take_temporary_snapshot(processed_position) {
            Ok(()) => {
                let written_position = written_position.max(processed_position);
                info!(self.logger, "Took temporary snapshot";
                    "processed_position" => processed_position,
                    "written_position" => written_position);
                self.pending = Some(PendingSnapshot {
                    processed_position,
                    written_position,
                    acks: ack.into_iter().collect(),
                });
                self.try_finalize();
            }
            Err(failure) => {
                error!(self.logger, "Failed to take temporary snapshot"; "error" => %failure);
                if let Some(ack) = ack {
                    let _ = ack.send(Err(failure));
                }
            }
        }
    }

    fn try_finalize(&mut self) {
        let commit_position = self.log.commit_position();
        let ready = matches!(
            &self.pending,
            Some(pending) if commit_position >= pending.written_position
        );
        if !ready {
            return;
        }
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return,
        };

        let result = self.finalize(&pending);
        if let Err(failure) = &result {
            error!(self.logger, "Failed to finalize snapshot";
                "processed_position" => pending.processed_position, "error" => %failure);
        }
        for ack in pending.acks {
            let _ = ack.send(result.clone());
        }

        // Requests held back while the snapshot was in flight get their own.
        while self.pending.is_none() {
            match self.queued.pop_front() {
                Some(request) => self.take_snapshot(
                    request.processed_position,
                    request.written_position,
                    Some(request.ack),
                ),
                None => break,
            }
        }
    }

    fn finalize(&mut self, pending: &PendingSnapshot) -> Result<i64, SnapshotError> {
        self.controller
            .move_valid_snapshot(pending.processed_position)?;
        self.controller
            .ensure_max_snapshot_count(self.max_snapshots)?;
        if let Some(position) = self.controller.position_to_delete() {
            self.log.reclaim_up_to(position);
        }
        self.controller.replicate_latest_snapshot()?;
        info!(self.logger, "Snapshot is valid";
            "processed_position" => pending.processed_position,
            "valid_snapshots" => self.controller.valid_snapshots_count());
        Ok(pending.processed_position)
    }
}
