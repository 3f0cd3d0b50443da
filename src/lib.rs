//! Per-partition deterministic processing core for a distributed workflow
//! engine.
//!
//! The engine consumes a replicated log of records, applies each one to a
//! transactional state store through registered handlers, and appends the
//! resulting follow-up records back onto the same log. Determinism is the
//! contract: after a crash the state is rebuilt by replaying the log from
//! the last valid snapshot, and the replayed output must match what is
//! already written.
//!
//! The collaborators (log stream, state store, snapshot storage, response
//! transport) are traits; in-memory implementations back the tests and
//! single-process deployments.

pub mod dispatch;
pub mod error;
pub mod log;
pub mod processor;
pub mod retry;
pub mod snapshot;
pub mod state;

pub use dispatch::{DispatchError, DispatchTable, DispatchTableBuilder, RecordHandler};
pub use error::EngineError;
pub use log::{
    InMemoryLogStream, Intent, LogEntry, LogError, LogEvent, LogRecord, LogStream,
    LogStreamReader, RecordKind, Rejection, RejectionKind, ValueKind, UNSET_KEY, UNSET_POSITION,
};
pub use processor::{
    CommandResponse, EnginePhase, EnginePositions, NoopResponseTransport, ProcessorConfig,
    RecordFilter, ReprocessingReport, ResponseTransport, ResponseWriter, StreamProcessor,
    StreamProcessorBuilder, StreamProcessorHandle, StreamWriter,
};
pub use snapshot::{InMemorySnapshotController, SnapshotController, SnapshotError};
pub use state::{InMemoryStateStore, StateStoreError, Transaction, TransactionContext};

use slog::Drain;

/// Terminal logger with the formatting the engine expects; callers with
/// their own slog setup pass a `Logger` directly instead.
pub fn default_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
