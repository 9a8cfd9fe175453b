//! Error types and result handling for core operations.
//!
//! Storage failures are mapped from `sqlx` into a small taxonomy so callers
//! can tell missing records and lost leases apart from infrastructure errors.

use thiserror::Error;

use crate::models::NotificationId;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller no longer holds the lease on this notification.
    ///
    /// Returned when the lease expired and was reclaimed by another claimant,
    /// or the record already reached a terminal state.
    #[error("lease lost for notification {0}")]
    LeaseLost(NotificationId),
}

impl CoreError {
    /// Returns true for failures worth retrying locally.
    ///
    /// Lost leases, missing rows and invalid input will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let error = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(error, CoreError::NotFound(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn pool_errors_are_transient() {
        let error = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, CoreError::Database(_)));
        assert!(error.is_transient());
    }

    #[test]
    fn lease_lost_names_notification() {
        let id = NotificationId::new();
        let error = CoreError::LeaseLost(id);
        assert_eq!(error.to_string(), format!("lease lost for notification {id}"));
        assert!(!error.is_transient());
    }
}
