//! Error types for the message log library.

use thiserror::Error;

/// Result type alias for message log operations.
pub type LogQueueResult<T> = Result<T, LogQueueError>;

/// SQLSTATE codes that mean "another consumer got there first".
const CONFLICT_CODES: &[&str] = &[
    "40P01", // deadlock_detected
    "40001", // serialization_failure
    "23505", // unique_violation
    "55P03", // lock_not_available
];

/// Errors that can occur during message log operations.
#[derive(Error, Debug)]
pub enum LogQueueError {
    /// Topic or consumer group name rejected before any statement was issued
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Message rejected before insert (e.g. id longer than the column)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A schema initialization statement failed; re-running initialization is safe
    #[error("Could not initialize schema ({context}): {source}")]
    Schema {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// The claimed offset collided with a concurrent claimant
    #[error("Offset {offset} already claimed elsewhere: {source}")]
    Conflict {
        offset: i64,
        #[source]
        source: sqlx::Error,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl LogQueueError {
    /// Underlying driver error, if any. Looks through `anyhow` context too.
    pub fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            LogQueueError::Schema { source, .. } | LogQueueError::Conflict { source, .. } => {
                Some(source)
            }
            LogQueueError::Database(err) => Some(err),
            LogQueueError::Other(err) => err.downcast_ref::<sqlx::Error>(),
            _ => None,
        }
    }

    /// Check if error means the offset was taken by a racing consumer.
    ///
    /// Callers treat this as "move on to the next offset", not as a failure.
    pub fn is_conflict(&self) -> bool {
        if matches!(self, LogQueueError::Conflict { .. }) {
            return true;
        }
        self.sqlx_error().map(is_conflict_error).unwrap_or(false)
    }

    /// Check if error is transient (retry on the next poll cycle)
    pub fn is_transient(&self) -> bool {
        if self.is_conflict() {
            return true;
        }
        matches!(
            self.sqlx_error(),
            Some(sqlx::Error::PoolTimedOut) | Some(sqlx::Error::PoolClosed) | Some(sqlx::Error::Io(_))
        )
    }
}

/// Whether a driver error carries one of the race-condition SQLSTATEs.
pub(crate) fn is_conflict_error(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| CONFLICT_CODES.contains(&code.as_ref()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_invalid_name_is_not_conflict() {
        let err = LogQueueError::InvalidName("bad topic".to_string());
        assert!(!err.is_conflict());
        assert!(!err.is_transient());
        assert!(err.sqlx_error().is_none());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = LogQueueError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_conflict_variant_is_conflict() {
        let err = LogQueueError::Conflict {
            offset: 7,
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.is_conflict());
        assert!(err.is_transient());
        assert!(err.to_string().contains("Offset 7"));
    }

    #[test]
    fn test_sqlx_error_found_through_context() {
        let wrapped: anyhow::Result<()> =
            Err(sqlx::Error::PoolClosed).context("Failed to acknowledge offset");
        let err = LogQueueError::from(wrapped.unwrap_err());
        assert!(matches!(err.sqlx_error(), Some(sqlx::Error::PoolClosed)));
        assert!(err.is_transient());
        assert!(err.to_string().contains("Failed to acknowledge offset"));
    }

    #[test]
    fn test_schema_error_message() {
        let err = LogQueueError::Schema {
            context: "create ledger table".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.to_string().starts_with("Could not initialize schema (create ledger table)"));
    }
}
