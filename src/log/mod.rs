pub mod memory;
pub mod record;
pub mod stream;

pub use memory::InMemoryLogStream;
pub use record::{
    Intent, LogRecord, RecordKind, Rejection, RejectionKind, ValueKind, UNSET_KEY, UNSET_POSITION,
};
pub use stream::{LogEntry, LogError, LogEvent, LogStream, LogStreamReader};
