//! Transactional state store boundary.
//!
//! The store allows exactly one open transaction per engine instance at a
//! time. A transaction is scoped around one record's processing and must be
//! committed or rolled back before the cursor advances.

pub mod memory;

pub use memory::InMemoryStateStore;

use crate::error::EngineError;
use std::fmt;

/// Errors surfaced by the state store.
#[derive(Debug, Clone)]
pub enum StateStoreError {
    /// Transient contention; the operation may succeed on retry.
    Recoverable { reason: String },

    /// Non-transient store failure.
    Internal { reason: String },

    /// A transaction is already open for this engine instance.
    TransactionInProgress,

    /// Commit or rollback without an open transaction.
    NoOpenTransaction,
}

impl fmt::Display for StateStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStoreError::Recoverable { reason } => {
                write!(f, "Recoverable store failure: {}", reason)
            }
            StateStoreError::Internal { reason } => write!(f, "Store failure: {}", reason),
            StateStoreError::TransactionInProgress => {
                write!(f, "A transaction is already open")
            }
            StateStoreError::NoOpenTransaction => {
                write!(f, "No transaction is open")
            }
        }
    }
}

impl std::error::Error for StateStoreError {}

/// Opens transactions against the state store.
pub trait TransactionContext: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>, StateStoreError>;
}

/// One open transaction. Never held across a suspension point that could
/// outlive the current record.
pub trait Transaction: Send {
    /// Run business logic bracketed by this transaction. A failing closure
    /// leaves the transaction open; the caller decides whether to retry the
    /// work or roll back.
    fn run(
        &mut self,
        work: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;

    /// Make buffered writes durable. May be called again after a recoverable
    /// failure.
    fn commit(&mut self) -> Result<(), StateStoreError>;

    /// Discard buffered writes.
    fn rollback(&mut self) -> Result<(), StateStoreError>;
}
