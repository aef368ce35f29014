//! Error types for coffer storage.

use coffer_core::EconomyError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Missing or invalid connection settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// An insert collided with an existing row on a unique key.
    ///
    /// Backends translate their provider-specific signal into this variant so
    /// callers can run optimistic insert-then-reselect without knowing the
    /// database in use.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Name of the violated constraint.
        constraint: String,
    },
}

impl StoreError {
    /// Whether this error is a uniqueness conflict.
    #[must_use]
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

impl From<StoreError> for EconomyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other.to_string()),
        }
    }
}
