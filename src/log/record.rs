//! Record model for the partition log.
//!
//! A record is identified for dispatch by its (record-kind, value-kind,
//! intent) triple. Positions are assigned by the log and strictly increase;
//! `-1` marks positions and keys that have not been assigned yet.

use serde::{Deserialize, Serialize};

/// Sentinel for positions that have not been assigned yet.
pub const UNSET_POSITION: i64 = -1;

/// Sentinel for entity keys that should be generated when the record is accepted.
pub const UNSET_KEY: i64 = -1;

/// Classifies a record on the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A request to change state; produces follow-up events or a rejection.
    Command,
    /// A state change that has already happened.
    Event,
    /// A command that was refused.
    CommandRejection,
}

impl RecordKind {
    pub const COUNT: usize = 3;

    pub fn ordinal(self) -> usize {
        match self {
            RecordKind::Command => 0,
            RecordKind::Event => 1,
            RecordKind::CommandRejection => 2,
        }
    }
}

/// Domain type tag of a record's value payload.
///
/// The processing core only needs the tag for dispatch; the payload itself
/// stays opaque. `Error` marks records written by the error hook for a
/// previously-failed record and gets special handling during replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Job,
    WorkflowInstance,
    Message,
    Timer,
    Error,
}

impl ValueKind {
    pub const COUNT: usize = 5;

    pub fn ordinal(self) -> usize {
        match self {
            ValueKind::Job => 0,
            ValueKind::WorkflowInstance => 1,
            ValueKind::Message => 2,
            ValueKind::Timer => 3,
            ValueKind::Error => 4,
        }
    }

    /// Number of intents known for this value kind. Lookups with an intent
    /// ordinal at or beyond this yield no handler instead of an error.
    pub fn intent_cardinality(self) -> u8 {
        match self {
            ValueKind::Error => 2,
            _ => Intent::MAX_CARDINALITY,
        }
    }
}

/// Per-value-kind sub-state of a record, as a dense ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent(pub u8);

impl Intent {
    pub const CREATE: Intent = Intent(0);
    pub const CREATED: Intent = Intent(1);
    pub const ACTIVATE: Intent = Intent(2);
    pub const ACTIVATED: Intent = Intent(3);
    pub const COMPLETE: Intent = Intent(4);
    pub const COMPLETED: Intent = Intent(5);
    pub const FAIL: Intent = Intent(6);
    pub const FAILED: Intent = Intent(7);

    /// Upper bound used for the dispatch table's dense index.
    pub const MAX_CARDINALITY: u8 = 8;

    pub fn ordinal(self) -> usize {
        self.0 as usize
    }
}

/// Why a command was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

/// Rejection details, set only on `CommandRejection` records and on error
/// responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

/// An immutable record read from the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Entity key; `UNSET_KEY` means "generate on accept".
    pub key: i64,

    /// Log-assigned position, strictly increasing across reads.
    pub position: i64,

    /// Position of the record that caused this one, `UNSET_POSITION` if none.
    pub source_record_position: i64,

    /// Id of the engine instance that appended this record.
    pub producer_id: i64,

    /// Log-assigned append timestamp (millis).
    pub timestamp: i64,

    pub record_kind: RecordKind,
    pub value_kind: ValueKind,
    pub intent: Intent,

    /// Set only on rejections.
    pub rejection: Option<Rejection>,

    /// Opaque value payload, interpreted by the business layer only.
    pub value: Vec<u8>,
}

impl LogRecord {
    /// True for records that are the result of processing, as opposed to
    /// commands still waiting to be processed.
    pub fn is_event_or_rejection(&self) -> bool {
        matches!(
            self.record_kind,
            RecordKind::Event | RecordKind::CommandRejection
        )
    }

    pub fn has_source(&self) -> bool {
        self.source_record_position != UNSET_POSITION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_dense() {
        assert_eq!(RecordKind::Command.ordinal(), 0);
        assert_eq!(RecordKind::CommandRejection.ordinal(), RecordKind::COUNT - 1);
        assert_eq!(ValueKind::Job.ordinal(), 0);
        assert_eq!(ValueKind::Error.ordinal(), ValueKind::COUNT - 1);
    }

    #[test]
    fn test_error_kind_has_reduced_intent_cardinality() {
        assert_eq!(ValueKind::Error.intent_cardinality(), 2);
        assert_eq!(ValueKind::Job.intent_cardinality(), Intent::MAX_CARDINALITY);
        // The error record intent written by the error hook stays in range.
        assert!(Intent::CREATED.ordinal() < ValueKind::Error.intent_cardinality() as usize);
    }

    #[test]
    fn test_record_encoding_keeps_rejection_details() {
        // Records cross process boundaries (replication, snapshots of the
        // log), so the encoded form must carry everything.
        let record = LogRecord {
            key: 4,
            position: 9,
            source_record_position: 7,
            producer_id: 2,
            timestamp: 1_700_000_000_000,
            record_kind: RecordKind::CommandRejection,
            value_kind: ValueKind::Job,
            intent: Intent::CREATE,
            rejection: Some(Rejection {
                kind: RejectionKind::InvalidState,
                reason: "job already exists".to_string(),
            }),
            value: serde_json::to_vec(&serde_json::json!({"retries": 3})).unwrap(),
        };

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: LogRecord = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.rejection.unwrap().kind, RejectionKind::InvalidState);
    }

    #[test]
    fn test_event_or_rejection() {
        let mut record = LogRecord {
            key: UNSET_KEY,
            position: 1,
            source_record_position: UNSET_POSITION,
            producer_id: 1,
            timestamp: 0,
            record_kind: RecordKind::Command,
            value_kind: ValueKind::Job,
            intent: Intent::CREATE,
            rejection: None,
            value: vec![],
        };
        assert!(!record.is_event_or_rejection());
        assert!(!record.has_source());

        record.record_kind = RecordKind::Event;
        record.source_record_position = 1;
        assert!(record.is_event_or_rejection());
        assert!(record.has_source());
    }
}
