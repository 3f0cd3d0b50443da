//! Response writer.
//!
//! Stages at most one client-facing response per processed record and
//! flushes it to the transport layer. A flush failure (e.g. backpressure) is
//! reported as `false` so the caller can retry without re-running business
//! logic.

use crate::log::record::{Intent, RecordKind, Rejection, ValueKind};
use std::sync::Arc;

/// The one client-facing response a record's processing may produce.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponse {
    pub key: i64,
    pub record_kind: RecordKind,
    pub value_kind: ValueKind,
    pub intent: Intent,
    pub rejection: Option<Rejection>,
    pub value: Vec<u8>,
}

/// Transport seam for client responses.
pub trait ResponseTransport: Send + Sync {
    /// Attempt to hand the response to the transport; `false` means "retry".
    fn try_send(&self, response: &CommandResponse) -> bool;
}

/// Transport that discards responses; used where no client is listening.
pub struct NoopResponseTransport;

impl ResponseTransport for NoopResponseTransport {
    fn try_send(&self, _response: &CommandResponse) -> bool {
        true
    }
}

pub struct ResponseWriter {
    transport: Arc<dyn ResponseTransport>,
    staged: Option<CommandResponse>,
}

impl ResponseWriter {
    pub fn new(transport: Arc<dyn ResponseTransport>) -> Self {
        Self {
            transport,
            staged: None,
        }
    }

    /// Stage a response, replacing any previously staged one; at most one
    /// response leaves the engine per processed record.
    pub fn stage(&mut self, response: CommandResponse) {
        self.staged = Some(response);
    }

    pub fn reset(&mut self) {
        self.staged = None;
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Flush the staged response if any. Returns `false` when the transport
    /// could not take it; the response stays staged for a retry.
    pub fn flush(&mut self) -> bool {
        match self.staged.take() {
            None => true,
            Some(response) => {
                if self.transport.try_send(&response) {
                    true
                } else {
                    self.staged = Some(response);
                    false
                }
            }
        }
    }
}
