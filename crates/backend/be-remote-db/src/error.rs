//! Error types for the payment and enrollment store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("{entity} not found{}", .id.as_ref().map(|id| format!(": {}", id)).unwrap_or_default())]
    NotFound {
        entity: &'static str,
        id: Option<String>,
    },

    #[error("Duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Data encoding error: {0}")]
    Encoding(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity, id: None }
    }

    pub fn not_found_with_id(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: Some(id.into()),
        }
    }

    pub fn duplicate(field: &'static str, value: impl Into<String>) -> Self {
        Self::Duplicate {
            field,
            value: value.into(),
        }
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// Errors worth retrying later: the same statement may succeed once the
    /// connection, pool, or competing transaction goes away.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Pool(_) | Self::Conflict(_) | Self::Database(_)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "record",
                id: None,
            },
            sqlx::Error::Database(db_err) => {
                // PostgreSQL error codes
                // 23505 = unique_violation
                // 23503 = foreign_key_violation
                // 23514 = check_violation
                // 40001 = serialization_failure
                // 40P01 = deadlock_detected
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => {
                            let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                            Self::Duplicate {
                                field: "constraint",
                                value: constraint,
                            }
                        }
                        "23503" | "23514" => {
                            let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                            Self::Constraint(constraint)
                        }
                        "40001" | "40P01" => Self::Conflict(db_err.message().to_string()),
                        _ => Self::Database(sqlx::Error::Database(db_err)),
                    }
                } else {
                    Self::Database(sqlx::Error::Database(db_err))
                }
            }
            sqlx::Error::PoolTimedOut => Self::Pool("Connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Pool("Connection pool is closed".to_string()),
            sqlx::Error::Io(io_err) => Self::Connection(io_err.to_string()),
            sqlx::Error::Tls(tls_err) => Self::Connection(format!("TLS error: {}", tls_err)),
            other => Self::Database(other),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = DbError::not_found("payment");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "payment not found");

        let err_with_id = DbError::not_found_with_id("payment", "order_abc");
        assert!(err_with_id.is_not_found());
        assert_eq!(err_with_id.to_string(), "payment not found: order_abc");
    }

    #[test]
    fn test_duplicate_error() {
        let err = DbError::duplicate("gateway_order_id", "order_abc");
        assert!(err.is_duplicate());
        assert_eq!(err.to_string(), "Duplicate gateway_order_id: order_abc");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Pool("timed out".into()).is_transient());
        assert!(DbError::Conflict("serialization".into()).is_transient());
        assert!(!DbError::invalid_input("missing user").is_transient());
        assert!(!DbError::not_found("payment").is_transient());
    }

    #[test]
    fn test_from_sqlx_pool_timeout() {
        let db_err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(db_err.is_transient());
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let sqlx_err = sqlx::Error::RowNotFound;
        let db_err: DbError = sqlx_err.into();
        assert!(db_err.is_not_found());
    }
}
