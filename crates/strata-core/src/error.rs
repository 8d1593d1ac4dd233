use thiserror::Error;

/// Core error type for STRATA operations.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    #[error("Duplicate migration identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Migration {0} is already applied")]
    AlreadyApplied(String),

    #[error("Migration {0} is not applied")]
    NotApplied(String),

    #[error("Migration {identifier} failed at statement {statement_index}: {cause}")]
    StatementExecutionFailed {
        identifier: String,
        statement_index: usize,
        cause: String,
    },

    #[error("Another migration run is in progress: {0}")]
    RunInProgress(String),

    #[error("Migration {0} has no down statements and cannot be reverted")]
    Irreversible(String),

    #[error("Applied migration {0} is not present in the migrations source")]
    UnknownMigration(String),

    #[error("Checksum mismatch for applied migration {identifier}: ledger has {recorded}, source has {current}")]
    ChecksumMismatch {
        identifier: String,
        recorded: String,
        current: String,
    },

    #[error("Run cancelled with {0} migration(s) not executed")]
    Cancelled(usize),
}

impl StrataError {
    /// Process exit code for this error.
    ///
    /// Every taxonomy entry gets its own code so scripts can tell them apart;
    /// ambient failures (config, IO, database) share code 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            StrataError::Config(_)
            | StrataError::Database(_)
            | StrataError::Io(_)
            | StrataError::Sql(_) => 1,
            StrataError::DuplicateIdentifier(_) => 10,
            StrataError::AlreadyApplied(_) => 11,
            StrataError::NotApplied(_) => 12,
            StrataError::StatementExecutionFailed { .. } => 13,
            StrataError::RunInProgress(_) => 14,
            StrataError::Irreversible(_) => 15,
            StrataError::UnknownMigration(_) => 16,
            StrataError::ChecksumMismatch { .. } => 17,
            StrataError::InvalidMigration(_) => 18,
            StrataError::Cancelled(_) => 130,
        }
    }
}

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_taxonomy_entry() {
        let errors = [
            StrataError::DuplicateIdentifier("a".into()),
            StrataError::AlreadyApplied("a".into()),
            StrataError::NotApplied("a".into()),
            StrataError::StatementExecutionFailed {
                identifier: "a".into(),
                statement_index: 0,
                cause: "boom".into(),
            },
            StrataError::RunInProgress("host:1".into()),
            StrataError::Irreversible("a".into()),
            StrataError::UnknownMigration("a".into()),
            StrataError::ChecksumMismatch {
                identifier: "a".into(),
                recorded: "x".into(),
                current: "y".into(),
            },
            StrataError::InvalidMigration("a".into()),
            StrataError::Cancelled(2),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0 && *c != 1));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_statement_failure_message_carries_cause_verbatim() {
        let err = StrataError::StatementExecutionFailed {
            identifier: "20260202193346".into(),
            statement_index: 2,
            cause: "relation \"users\" already exists".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("20260202193346"));
        assert!(msg.contains("statement 2"));
        assert!(msg.contains("relation \"users\" already exists"));
    }

    #[test]
    fn test_ambient_errors_share_general_code() {
        assert_eq!(StrataError::Config("x".into()).exit_code(), 1);
        assert_eq!(StrataError::Database("x".into()).exit_code(), 1);
    }
}
