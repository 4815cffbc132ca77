use thiserror::Error;
use tokio_rusqlite::rusqlite::{self, ErrorCode};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A write broke a uniqueness, check or foreign-key rule.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The id or name no longer exists; the caller should refresh its view.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Lock contention outlasted the busy timeout. Safe to retry.
    #[error("database is busy: {0}")]
    Busy(String),

    #[error("migration failed while {step}: {source}")]
    Migration {
        step: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("database connection is closed")]
    ConnectionClosed,

    #[error(transparent)]
    Database(rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn migration(step: impl Into<String>, source: impl Into<StoreError>) -> Self {
        StoreError::Migration {
            step: step.into(),
            source: Box::new(source.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Busy(_) => true,
            StoreError::Migration { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(err.to_string()),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

impl<E: Into<StoreError>> From<tokio_rusqlite::Error<E>> for StoreError {
    fn from(err: tokio_rusqlite::Error<E>) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => StoreError::ConnectionClosed,
            tokio_rusqlite::Error::Close((_, e)) => e.into(),
            tokio_rusqlite::Error::Error(e) => e.into(),
            _ => StoreError::Other("unexpected connection error".to_string()),
        }
    }
}
