// ⚠️ Merge Errors - what can go wrong in a run, and whether a retry helps
//
// DuplicateIdentifier / TypeMismatch are caught before any write.
// WriteConflict / StoreUnavailable are safe to retry (runs are idempotent).
// PartialRunFailure means some identifiers were committed and some were not.

use crate::attributes::EntityId;
use rusqlite::ErrorCode;

/// Errors produced by the merge engine and its store backends.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("duplicate identifier {id} in extract ({count} records)")]
    DuplicateIdentifier { id: EntityId, count: usize },

    #[error("type mismatch on attribute '{attribute}': {reason}")]
    TypeMismatch { attribute: String, reason: String },

    #[error("write conflict for {id}: {reason}")]
    WriteConflict { id: String, reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(
        "run failed after {} identifiers were written ({} pending): {source}",
        .written.len(),
        .pending.len()
    )]
    PartialRunFailure {
        written: Vec<EntityId>,
        pending: Vec<EntityId>,
        #[source]
        source: Box<MergeError>,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("malformed extract: {0}")]
    Extract(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MergeError {
    pub fn type_mismatch(attribute: &str, reason: impl Into<String>) -> Self {
        MergeError::TypeMismatch {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }

    pub fn conflict(id: impl ToString, reason: impl Into<String>) -> Self {
        MergeError::WriteConflict {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Re-invoking the run with the same extract may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MergeError::WriteConflict { .. }
            | MergeError::StoreUnavailable(_)
            | MergeError::Cancelled => true,
            MergeError::PartialRunFailure { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Input errors never reach the Temporal Writer.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            MergeError::DuplicateIdentifier { .. }
                | MergeError::TypeMismatch { .. }
                | MergeError::Extract(_)
        )
    }
}

impl From<rusqlite::Error> for MergeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                MergeError::WriteConflict {
                    id: String::from("?"),
                    reason: err.to_string(),
                }
            }
            _ => MergeError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<csv::Error> for MergeError {
    fn from(err: csv::Error) -> Self {
        MergeError::Extract(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(MergeError::StoreUnavailable("busy".into()).is_retryable());
        assert!(MergeError::conflict("1001", "two current rows").is_retryable());
        assert!(!MergeError::type_mismatch("dob", "not a date").is_retryable());

        let dup = MergeError::DuplicateIdentifier {
            id: EntityId::from(2002),
            count: 2,
        };
        assert!(!dup.is_retryable());
        assert!(dup.is_input_error());
    }

    #[test]
    fn test_partial_failure_inherits_retryability() {
        let partial = MergeError::PartialRunFailure {
            written: vec![EntityId::from(1)],
            pending: vec![EntityId::from(2), EntityId::from(3)],
            source: Box::new(MergeError::StoreUnavailable("disk I/O error".into())),
        };

        assert!(partial.is_retryable());
        assert!(partial.to_string().contains("1 identifiers were written (2 pending)"));
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (k INTEGER PRIMARY KEY)", []).unwrap();
        conn.execute("INSERT INTO t (k) VALUES (1)", []).unwrap();

        let err: MergeError = conn
            .execute("INSERT INTO t (k) VALUES (1)", [])
            .unwrap_err()
            .into();

        assert!(matches!(err, MergeError::WriteConflict { .. }));
    }
}
