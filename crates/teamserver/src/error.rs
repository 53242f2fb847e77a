//! Storage errors shared by every repository.

use thiserror::Error;

/// A failure talking to, or decoding data from, the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A statement failed (I/O, constraint violation, lock timeout ...).
    #[error("{context}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A stored value could not be decoded.
    #[error("corrupt {column} value: {detail}")]
    Corrupt {
        column: &'static str,
        detail: String,
    },
}

impl StorageError {
    /// Whether the underlying database error is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Query {
                source: sqlx::Error::Database(db),
                ..
            } => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Whether the underlying database error is a foreign key violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        match self {
            Self::Query {
                source: sqlx::Error::Database(db),
                ..
            } => db.is_foreign_key_violation(),
            _ => false,
        }
    }
}

/// Attach a static context string to a sqlx result.
pub(crate) trait StorageContext<T> {
    fn context(self, context: &'static str) -> Result<T, StorageError>;
}

impl<T> StorageContext<T> for Result<T, sqlx::Error> {
    fn context(self, context: &'static str) -> Result<T, StorageError> {
        self.map_err(|source| StorageError::Query { context, source })
    }
}
