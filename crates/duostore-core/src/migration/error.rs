//! Migration-specific error types.

use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The stored version is beyond every registered step.
    ///
    /// The database was written by a newer release.
    #[error("ledger version {stored} is ahead of the highest registered step {highest}")]
    LedgerAhead {
        /// Version found in the ledger.
        stored: u32,
        /// Highest registered ordinal.
        highest: u32,
    },

    /// The stored version is not a valid ordinal.
    #[error("ledger holds invalid version {stored}")]
    CorruptLedger {
        /// Raw value found in the ledger.
        stored: i64,
    },

    /// A step failed and was rolled back.
    #[error("step {ordinal} ({description}) failed: {message}")]
    StepFailed {
        /// Ordinal of the failed step.
        ordinal: u32,
        /// Step description.
        description: &'static str,
        /// Error message.
        message: String,
    },

    /// The step registry is malformed.
    #[error("invalid migration registry: {message}")]
    InvalidRegistry {
        /// Description of the problem.
        message: String,
    },

    /// A non-idempotent step cannot run without transactional DDL.
    #[error("step {ordinal} is not idempotent and the engine lacks transactional DDL")]
    NotIdempotent {
        /// Ordinal of the refused step.
        ordinal: u32,
    },

    /// The ledger compare-and-set lost a race.
    #[error("ledger modified concurrently: expected {expected}, found {found}")]
    ConcurrentModification {
        /// Version the caller expected.
        expected: u32,
        /// Version actually stored.
        found: u32,
    },

    /// The ledger only moves forward.
    #[error("ledger cannot move from {from} to {to}")]
    NonMonotonic {
        /// Current version.
        from: u32,
        /// Requested version.
        to: u32,
    },

    /// SQLite error outside a step.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::StepFailed {
            ordinal: 4,
            description: "tenant columns",
            message: "disk I/O error".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("step 4"));
        assert!(text.contains("tenant columns"));
    }
}
