//! Error types for coffer.

use crate::ids::IdError;

/// Result type for coffer operations.
pub type Result<T> = std::result::Result<T, EconomyError>;

/// Errors surfaced by ledger and marketplace operations.
///
/// Business-rule failures are detected before any write; `Storage` and
/// `AtomicityFailure` mean the unit of work was rolled back.
#[derive(Debug, thiserror::Error)]
pub enum EconomyError {
    /// Bad amount, quantity, or argument combination.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist (or is not visible to the caller).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The request conflicts with the current state.
    #[error("conflict: {0}")]
    Conflict(#[from] Conflict),

    /// The paying account cannot cover the debit.
    #[error("insufficient {currency} funds: balance {balance}{symbol}, required {required}{symbol}")]
    InsufficientFunds {
        /// Currency code.
        currency: String,
        /// Currency symbol, prefixed with a space when present.
        symbol: String,
        /// Current balance in minor units.
        balance: i64,
        /// Required amount in minor units.
        required: i64,
    },

    /// The operation does not apply to this kind of entity.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A collaborator failed inside a unit of work, which was rolled back.
    #[error("{collaborator} failed, operation rolled back: {message}")]
    AtomicityFailure {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// What it reported.
        message: String,
    },

    /// The caller lacks the privileged role.
    #[error("forbidden")]
    Forbidden,

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EconomyError {
    /// Shorthand for [`EconomyError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build an insufficient-funds error that names the currency symbol.
    #[must_use]
    pub fn insufficient_funds(currency: &str, symbol: &str, balance: i64, required: i64) -> Self {
        Self::InsufficientFunds {
            currency: currency.to_string(),
            symbol: if symbol.is_empty() {
                String::new()
            } else {
                format!(" {symbol}")
            },
            balance,
            required,
        }
    }
}

/// State conflicts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    /// The user already holds this non-consumable item or badge.
    #[error("item already owned")]
    AlreadyOwned,

    /// Buying would exceed the per-user cap.
    #[error("ownership cap exceeded: max {max_own}, owned {owned}, can add {remaining}")]
    OwnershipCapExceeded {
        /// The item's cap.
        max_own: i64,
        /// Units currently held.
        owned: i64,
        /// Units that could still be added.
        remaining: i64,
    },

    /// Not enough units left for sale.
    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock {
        /// Units left.
        available: i64,
        /// Units requested.
        requested: i64,
    },

    /// The item is not on sale.
    #[error("item is not active")]
    ItemInactive,

    /// The paying account is frozen.
    #[error("account is frozen")]
    AccountFrozen,
}
