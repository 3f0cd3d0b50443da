//! Failure classification for the processing core.
//!
//! Every failure surfaced by a collaborator is sorted into one of three
//! classes, which drives how the retry strategies and the processing state
//! machine react to it.

use crate::state::StateStoreError;
use std::fmt;

/// A classified failure observed while processing a record.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Transient failure expected to clear on retry (e.g. storage contention).
    Recoverable(String),

    /// Any other failure during processing; routed to the handler's error hook.
    Unexpected(String),

    /// Consistency violation. The engine must fail loudly and stop; continuing
    /// would silently diverge from the log.
    Fatal(String),
}

impl EngineError {
    /// True for failures the `Recoverable` retry policy is allowed to retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Recoverable(_))
    }

    /// True for failures that must terminate the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Recoverable(reason) => write!(f, "Recoverable failure: {}", reason),
            EngineError::Unexpected(reason) => write!(f, "Unexpected failure: {}", reason),
            EngineError::Fatal(reason) => write!(f, "Fatal consistency failure: {}", reason),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StateStoreError> for EngineError {
    fn from(error: StateStoreError) -> Self {
        match error {
            StateStoreError::Recoverable { reason } => EngineError::Recoverable(reason),
            StateStoreError::Internal { reason } => EngineError::Unexpected(reason),
            // A second open transaction means the single-writer contract is
            // broken; retrying cannot repair that.
            StateStoreError::TransactionInProgress | StateStoreError::NoOpenTransaction => {
                EngineError::Fatal(format!("transaction contract violated: {}", error))
            }
        }
    }
}
