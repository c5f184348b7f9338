use std::fmt;

/// Machine-readable error codes for operators and client tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    DocumentNotFound,
    InvalidPath,
    InvalidDocument,
    Unauthorized,
    AllocationConflict,
    AllocationExhausted,
    BackfillWriteFailed,
    AuditWriteFailed,
    RetentionBatchFailed,
    ConflictNotFound,
    ConflictAlreadyResolved,
    StorageFailure,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::DocumentNotFound => "E2001",
            Self::InvalidPath => "E2002",
            Self::InvalidDocument => "E2003",
            Self::Unauthorized => "E2004",
            Self::AllocationConflict => "E3001",
            Self::AllocationExhausted => "E3002",
            Self::BackfillWriteFailed => "E3003",
            Self::AuditWriteFailed => "E4001",
            Self::RetentionBatchFailed => "E4002",
            Self::ConflictNotFound => "E6001",
            Self::ConflictAlreadyResolved => "E6002",
            Self::StorageFailure => "E5001",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Ledger store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::DocumentNotFound => "Document not found",
            Self::InvalidPath => "Unknown collection path",
            Self::InvalidDocument => "Document rejected by validation",
            Self::Unauthorized => "Caller is not a member of the tenant",
            Self::AllocationConflict => "Sequence allocation lost a write race",
            Self::AllocationExhausted => "Sequence allocation retries exhausted",
            Self::BackfillWriteFailed => "Sequence backfill write-back failed",
            Self::AuditWriteFailed => "Audit snapshot write failed",
            Self::RetentionBatchFailed => "Retention batch delete failed",
            Self::ConflictNotFound => "Sync conflict not found",
            Self::ConflictAlreadyResolved => "Sync conflict already resolved",
            Self::StorageFailure => "Storage failure",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `tally init` to create the ledger store."),
            Self::ConfigParseError => Some("Fix syntax in .tally/config.toml and retry."),
            Self::DocumentNotFound | Self::ConflictNotFound => None,
            Self::InvalidPath => Some(
                "Use jobs, team_members, vehicles, machines, or jobs/<id>/costs|advances|events.",
            ),
            Self::InvalidDocument => Some("Fields must be a JSON object with a valid status."),
            Self::Unauthorized => Some("Ask a tenant owner to grant membership."),
            Self::AllocationConflict => Some("Transient; the transaction is retried automatically."),
            Self::AllocationExhausted => {
                Some("Retry later; another writer is holding the counter row.")
            }
            Self::BackfillWriteFailed => {
                Some("The number is consumed; the document keeps its placeholder.")
            }
            Self::AuditWriteFailed => Some("The originating write is unaffected; check storage."),
            Self::RetentionBatchFailed => Some("Expired snapshots are picked up by the next run."),
            Self::ConflictAlreadyResolved => Some("List pending conflicts with `tally conflicts`."),
            Self::StorageFailure => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other `tally` process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by the ledger core.
///
/// Only allocation and entry-point failures ever reach a user-facing write.
/// Backfill, audit and retention failures are logged by their components and
/// surface here only for callers that invoke those components directly.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The allocation transaction lost a race with another writer.
    #[error("allocation conflict on {tenant_id}/{scope_id}/{sequence_name}")]
    AllocationConflict {
        tenant_id: String,
        scope_id: String,
        sequence_name: String,
    },

    /// Allocation kept conflicting after the bounded number of attempts.
    #[error("allocation for {sequence_name} gave up after {attempts} attempts")]
    AllocationExhausted {
        sequence_name: String,
        attempts: u32,
    },

    /// A sequence number was allocated but could not be written back.
    #[error("backfill write-back failed for {doc_id}: {reason}")]
    BackfillWriteFailure { doc_id: String, reason: String },

    /// An audit snapshot could not be persisted.
    #[error("audit snapshot write failed for {doc_id}: {reason}")]
    AuditWriteFailure { doc_id: String, reason: String },

    /// A retention batch failed after all retry attempts.
    #[error("retention batch of {size} snapshots failed after {attempts} attempts: {reason}")]
    RetentionBatchFailure {
        size: usize,
        attempts: u32,
        reason: String,
    },

    #[error("document not found: {path}/{doc_id}")]
    DocumentNotFound { path: String, doc_id: String },

    #[error("invalid collection path '{0}'")]
    InvalidPath(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("caller '{caller_id}' is not a member of tenant '{tenant_id}'")]
    Unauthorized {
        caller_id: String,
        tenant_id: String,
    },

    #[error("sync conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("sync conflict {0} is already resolved")]
    ConflictAlreadyResolved(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AllocationConflict { .. } => ErrorCode::AllocationConflict,
            Self::AllocationExhausted { .. } => ErrorCode::AllocationExhausted,
            Self::BackfillWriteFailure { .. } => ErrorCode::BackfillWriteFailed,
            Self::AuditWriteFailure { .. } => ErrorCode::AuditWriteFailed,
            Self::RetentionBatchFailure { .. } => ErrorCode::RetentionBatchFailed,
            Self::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            Self::InvalidPath(_) => ErrorCode::InvalidPath,
            Self::InvalidDocument(_) => ErrorCode::InvalidDocument,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::ConflictNotFound(_) => ErrorCode::ConflictNotFound,
            Self::ConflictAlreadyResolved(_) => ErrorCode::ConflictAlreadyResolved,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Json(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether the failure is a transient write race worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AllocationConflict { .. } => true,
            Self::Storage(err) => is_busy_error(err),
            _ => false,
        }
    }
}

/// Check if a rusqlite error is a lock/busy error.
pub(crate) fn is_busy_error(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, LedgerError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::DocumentNotFound,
            ErrorCode::InvalidPath,
            ErrorCode::InvalidDocument,
            ErrorCode::Unauthorized,
            ErrorCode::AllocationConflict,
            ErrorCode::AllocationExhausted,
            ErrorCode::BackfillWriteFailed,
            ErrorCode::AuditWriteFailed,
            ErrorCode::RetentionBatchFailed,
            ErrorCode::ConflictNotFound,
            ErrorCode::ConflictAlreadyResolved,
            ErrorCode::StorageFailure,
            ErrorCode::LockContention,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::AllocationExhausted.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn busy_storage_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(LedgerError::Storage(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!LedgerError::Storage(constraint).is_transient());
        assert!(!LedgerError::InvalidPath("x".into()).is_transient());
    }

    #[test]
    fn errors_map_to_codes() {
        let err = LedgerError::Unauthorized {
            caller_id: "u1".into(),
            tenant_id: "t1".into(),
        };
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(err.hint().is_some());
        assert!(err.to_string().contains("t1"));
    }
}
