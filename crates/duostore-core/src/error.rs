//! Core error types.

use thiserror::Error;

use crate::driver::DriverError;
use crate::migration::MigrationError;
use crate::router::Operation;

/// A failed table-level operation.
///
/// Returned to collaborators as a per-request failure; the process keeps
/// serving.
#[derive(Debug, Error)]
#[error("storage error on {table} ({operation}): {cause}")]
pub struct StorageError {
    /// Table the operation targeted.
    pub table: String,
    /// The operation that failed.
    pub operation: Operation,
    /// Underlying driver failure.
    #[source]
    pub cause: DriverError,
}

impl StorageError {
    pub fn new(table: impl Into<String>, operation: Operation, cause: DriverError) -> Self {
        Self {
            table: table.into(),
            operation,
            cause,
        }
    }
}

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A boot-time migration failed. Fatal.
    #[error("migration failure: {0}")]
    MigrationFailure(MigrationError),

    /// The version ledger was modified concurrently.
    #[error("concurrent modification of version ledger: expected {expected}, found {found}")]
    ConcurrentModification {
        /// Version the caller expected to replace.
        expected: u32,
        /// Version actually stored.
        found: u32,
    },

    /// A single table operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The external engine could not be reached.
    #[error("external engine unreachable: {0}")]
    EngineUnreachable(String),

    /// The caller deadline elapsed.
    #[error("operation {operation} on {table} timed out")]
    Timeout {
        /// Table the operation targeted.
        table: String,
        /// The operation that timed out.
        operation: Operation,
    },

    /// The table name is not in the registry.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A table is both protected and classified as migratable.
    #[error("table {0} is protected but classified as migratable")]
    ClassificationConflict(String),

    /// Engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// The operation requires the external engine to be active.
    #[error("external engine is not active")]
    ExternalInactive,

    /// Embedded engine error outside a request.
    #[error("embedded engine error: {0}")]
    Embedded(#[from] rusqlite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MigrationError> for Error {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::ConcurrentModification { expected, found } => {
                Error::ConcurrentModification { expected, found }
            }
            other => Error::MigrationFailure(other),
        }
    }
}

impl Error {
    /// Message safe to show to end users of CRUD routes.
    ///
    /// Engine internals are never included.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::UnknownTable(_) => "resource not found",
            Error::Timeout { .. } => "request timed out",
            Error::Storage(e) if e.cause.is_invalid_input() => "invalid request",
            _ => "request failed",
        }
    }

    /// Whether this error must stop the boot sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MigrationFailure(_)
                | Error::ConcurrentModification { .. }
                | Error::Embedded(_)
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_internals() {
        let err = Error::Storage(StorageError::new(
            "sales",
            Operation::Create,
            DriverError::Other("connection refused by 10.0.0.5:5432".to_string()),
        ));
        assert!(err.to_string().contains("10.0.0.5"));
        assert_eq!(err.public_message(), "request failed");
    }

    #[test]
    fn test_invalid_input_message() {
        let err = Error::Storage(StorageError::new(
            "sales",
            Operation::Update,
            DriverError::UnknownColumn("nope".to_string()),
        ));
        assert_eq!(err.public_message(), "invalid request");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::MigrationFailure(MigrationError::LedgerAhead {
            stored: 9,
            highest: 3
        })
        .is_fatal());
        assert!(!Error::EngineUnreachable("down".into()).is_fatal());
    }

    #[test]
    fn test_ledger_race_maps_to_concurrent_modification() {
        let err = Error::from(MigrationError::ConcurrentModification {
            expected: 2,
            found: 3,
        });
        assert!(matches!(
            err,
            Error::ConcurrentModification {
                expected: 2,
                found: 3
            }
        ));
        assert!(err.is_fatal());
    }
}
