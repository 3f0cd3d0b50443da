//! Record dispatch table.
//!
//! Maps a (record-kind, value-kind, intent) triple to exactly one registered
//! business-logic handler via a flattened dense index. Registering two
//! handlers for the same key is a configuration error raised at build time,
//! never at dispatch time.

use crate::error::EngineError;
use crate::log::record::{Intent, LogRecord, RecordKind, ValueKind};
use crate::processor::response::ResponseWriter;
use crate::processor::writer::StreamWriter;
use std::fmt;
use std::sync::Arc;

/// Business logic for one dispatch key, injected per value-kind/intent.
///
/// `apply` and `on_error` run inside the record's transaction; staged
/// follow-up records and responses are only made durable by the engine's
/// write/commit pipeline.
pub trait RecordHandler: Send + Sync {
    /// Lifecycle hook, invoked once when steady-state processing begins.
    fn on_open(&self) {}

    /// Lifecycle hook, invoked once when the engine closes.
    fn on_close(&self) {}

    /// Apply the record to transactional state.
    fn apply(&self, record: &LogRecord, responses: &mut ResponseWriter)
        -> Result<(), EngineError>;

    /// Error hook: runs in a fresh transaction after `apply` failed and the
    /// original transaction was rolled back. May stage an error record and a
    /// client rejection.
    fn on_error(
        &self,
        failure: &EngineError,
        record: &LogRecord,
        writer: &mut StreamWriter,
        responses: &mut ResponseWriter,
    ) -> Result<(), EngineError> {
        let _ = (failure, record, writer, responses);
        Ok(())
    }

    /// Stage the follow-up records produced by a successful `apply`.
    fn write_follow_ups(
        &self,
        record: &LogRecord,
        writer: &mut StreamWriter,
    ) -> Result<(), EngineError> {
        let _ = (record, writer);
        Ok(())
    }

    /// Externally observable actions after commit; `false` means "retry".
    fn execute_side_effects(&self, record: &LogRecord) -> bool {
        let _ = record;
        true
    }

    /// For error-kind records only: the position of the record whose
    /// processing originally failed. Consulted during the reprocessing scan.
    fn failed_position(&self, record: &LogRecord) -> Option<i64> {
        let _ = record;
        None
    }
}

/// Dispatch configuration errors, raised while building the table.
#[derive(Debug, Clone)]
pub enum DispatchError {
    DuplicateHandler {
        record_kind: RecordKind,
        value_kind: ValueKind,
        intent: Intent,
    },
    IntentOutOfRange {
        value_kind: ValueKind,
        intent: Intent,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::DuplicateHandler {
                record_kind,
                value_kind,
                intent,
            } => write!(
                f,
                "Handler already registered for ({:?}, {:?}, {:?})",
                record_kind, value_kind, intent
            ),
            DispatchError::IntentOutOfRange { value_kind, intent } => write!(
                f,
                "Intent {:?} is out of range for value kind {:?}",
                intent, value_kind
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

const SLOT_COUNT: usize =
    RecordKind::COUNT * ValueKind::COUNT * Intent::MAX_CARDINALITY as usize;

fn slot_index(record_kind: RecordKind, value_kind: ValueKind, intent: Intent) -> usize {
    record_kind.ordinal() * ValueKind::COUNT * Intent::MAX_CARDINALITY as usize
        + value_kind.ordinal() * Intent::MAX_CARDINALITY as usize
        + intent.ordinal()
}

/// Builds a `DispatchTable`, failing fast on duplicate registrations.
pub struct DispatchTableBuilder {
    slots: Vec<Option<Arc<dyn RecordHandler>>>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT],
        }
    }

    pub fn register(
        &mut self,
        record_kind: RecordKind,
        value_kind: ValueKind,
        intent: Intent,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<&mut Self, DispatchError> {
        if intent.ordinal() >= value_kind.intent_cardinality() as usize {
            return Err(DispatchError::IntentOutOfRange { value_kind, intent });
        }
        let index = slot_index(record_kind, value_kind, intent);
        if self.slots[index].is_some() {
            return Err(DispatchError::DuplicateHandler {
                record_kind,
                value_kind,
                intent,
            });
        }
        self.slots[index] = Some(handler);
        Ok(self)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable { slots: self.slots }
    }
}

impl Default for DispatchTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable handler lookup, built once at startup.
pub struct DispatchTable {
    slots: Vec<Option<Arc<dyn RecordHandler>>>,
}

impl DispatchTable {
    /// O(1) lookup. Intents at or beyond the value-kind's cardinality yield
    /// `None` rather than an error.
    pub fn lookup(
        &self,
        record_kind: RecordKind,
        value_kind: ValueKind,
        intent: Intent,
    ) -> Option<&Arc<dyn RecordHandler>> {
        if intent.ordinal() >= value_kind.intent_cardinality() as usize {
            return None;
        }
        self.slots[slot_index(record_kind, value_kind, intent)].as_ref()
    }

    /// Iterate over all registered handlers, skipping empty slots. Used for
    /// the lifecycle broadcast only; the table is immutable after build.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn RecordHandler>> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        opened: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: AtomicUsize::new(0),
            })
        }
    }

    impl RecordHandler for CountingHandler {
        fn on_open(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn apply(
            &self,
            _record: &LogRecord,
            _responses: &mut ResponseWriter,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_fails_at_build_time() {
        let mut builder = DispatchTableBuilder::new();
        builder
            .register(
                RecordKind::Command,
                ValueKind::Job,
                Intent::CREATE,
                CountingHandler::new(),
            )
            .unwrap();

        let result = builder.register(
            RecordKind::Command,
            ValueKind::Job,
            Intent::CREATE,
            CountingHandler::new(),
        );
        assert!(matches!(
            result,
            Err(DispatchError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn test_lookup_returns_registered_handler() {
        let handler = CountingHandler::new();
        let mut builder = DispatchTableBuilder::new();
        builder
            .register(
                RecordKind::Command,
                ValueKind::Job,
                Intent::CREATE,
                handler.clone(),
            )
            .unwrap();
        let table = builder.build();

        let registered: Arc<dyn RecordHandler> = handler;
        let found = table
            .lookup(RecordKind::Command, ValueKind::Job, Intent::CREATE)
            .expect("handler should be registered");
        assert!(Arc::ptr_eq(found, &registered));

        assert!(table
            .lookup(RecordKind::Event, ValueKind::Job, Intent::CREATE)
            .is_none());
        assert!(table
            .lookup(RecordKind::Command, ValueKind::Timer, Intent::CREATE)
            .is_none());
    }

    #[test]
    fn test_out_of_range_intent_yields_none() {
        let mut builder = DispatchTableBuilder::new();
        builder
            .register(
                RecordKind::Event,
                ValueKind::Error,
                Intent::CREATED,
                CountingHandler::new(),
            )
            .unwrap();
        let table = builder.build();

        // Error value kind only knows two intents; anything beyond is "none".
        assert!(table
            .lookup(RecordKind::Event, ValueKind::Error, Intent::ACTIVATE)
            .is_none());
    }

    #[test]
    fn test_out_of_range_registration_fails() {
        let mut builder = DispatchTableBuilder::new();
        let result = builder.register(
            RecordKind::Event,
            ValueKind::Error,
            Intent::FAILED,
            CountingHandler::new(),
        );
        assert!(matches!(result, Err(DispatchError::IntentOutOfRange { .. })));
    }

    #[test]
    fn test_iteration_skips_empty_slots() {
        let mut builder = DispatchTableBuilder::new();
        builder
            .register(
                RecordKind::Command,
                ValueKind::Job,
                Intent::CREATE,
                CountingHandler::new(),
            )
            .unwrap();
        builder
            .register(
                RecordKind::Event,
                ValueKind::Job,
                Intent::CREATED,
                CountingHandler::new(),
            )
            .unwrap();
        let table = builder.build();

        assert_eq!(table.handlers().count(), 2);
        for handler in table.handlers() {
            handler.on_open();
        }
    }
}
