//! Error types for the billing core.

use uuid::Uuid;

/// Configuration resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse {path}: {message}")]
    ParseError { path: String, message: String },
}

/// Store-level failures, classified so callers can tell transient errors
/// from conflicts and from defects.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("migration failed: {0}")]
    Migration(String),

    /// Misconfiguration that retrying cannot fix.
    #[error("invalid database configuration: {0}")]
    Config(String),
}

impl DatabaseError {
    /// Busy, locked, timed-out, and dropped-connection failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Unavailable(_))
    }
}

fn classify_message(message: String) -> DatabaseError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("unique constraint")
        || lower.contains("constraint failed: unique")
        || lower.contains("duplicate key")
    {
        DatabaseError::Conflict(message)
    } else if lower.contains("database is locked")
        || lower.contains("database is busy")
        || lower.contains("sqlite_busy")
        || lower.contains("timed out")
        || lower.contains("timeout")
    {
        DatabaseError::Unavailable(message)
    } else {
        DatabaseError::Query(message)
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        classify_message(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        if let Some(code) = e.code()
            && (*code == SqlState::UNIQUE_VIOLATION
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED)
        {
            return Self::Conflict(e.to_string());
        }
        if e.is_closed() {
            return Self::Unavailable(e.to_string());
        }
        classify_message(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

/// Outcome taxonomy of every billing operation.
///
/// Validation errors are terminal. `StoreUnavailable` and `Conflict` may be
/// retried by the caller; the engine never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("case '{case_id}' has no unbilled time entries")]
    NothingToBill { case_id: String },

    #[error("time entry {time_entry_id} is billed on invoice {invoice_id}")]
    AlreadyBilled {
        time_entry_id: Uuid,
        invoice_id: Uuid,
    },

    #[error("invoice {invoice_id} has {payment_count} recorded payment(s)")]
    HasPayments {
        invoice_id: Uuid,
        payment_count: usize,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("concurrent write detected: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(DatabaseError),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Conflict(_))
    }
}

impl From<DatabaseError> for BillingError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Pool(msg) | DatabaseError::Unavailable(msg) => {
                Self::StoreUnavailable(msg)
            }
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BillingError, DatabaseError, classify_message};

    #[test]
    fn unique_violations_classify_as_conflicts() {
        let err = classify_message("UNIQUE constraint failed: invoices.invoice_number".into());
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }

    #[test]
    fn locked_database_classifies_as_unavailable() {
        let err = classify_message("database is locked".into());
        assert!(err.is_transient());
    }

    #[test]
    fn configuration_failures_are_not_retryable() {
        let err = DatabaseError::Config("DATABASE_URL is not set".into());
        assert!(!err.is_transient());
        let billing = BillingError::from(err);
        assert!(matches!(billing, BillingError::Store(DatabaseError::Config(_))));
        assert!(!billing.is_retryable());
    }

    #[test]
    fn only_transient_and_conflict_errors_are_retryable() {
        assert!(BillingError::from(DatabaseError::Unavailable("busy".into())).is_retryable());
        assert!(BillingError::from(DatabaseError::Conflict("dup".into())).is_retryable());
        assert!(!BillingError::from(DatabaseError::Query("syntax".into())).is_retryable());
        assert!(BillingError::from(DatabaseError::Pool("pool timed out".into())).is_retryable());
        assert!(!BillingError::InvalidAmount("0".into()).is_retryable());
        assert!(
            !BillingError::NothingToBill {
                case_id: "c-1".into()
            }
            .is_retryable()
        );
    }
}
