//! Identifier types for coffer.
//!
//! Row identifiers issued by the persistence layer are plain integers wrapped in
//! newtypes so a user id can never be passed where an item id is expected.
//! Transaction ids are ULIDs generated by the engine, which keeps the audit log
//! naturally time-ordered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw row identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Return the raw row identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<i64>()
                    .map(Self)
                    .map_err(|_| IdError::InvalidInteger(s.to_string()))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(
    /// A platform user, as supplied by the identity collaborator.
    UserId
);
int_id!(
    /// A `(user, currency)` balance row.
    AccountId
);
int_id!(
    /// A marketplace catalog entry.
    ItemId
);
int_id!(
    /// A row of a user's inventory.
    OwnershipId
);
int_id!(
    /// A badge definition owned by the badge collaborator.
    BadgeId
);

/// A ledger transaction identifier using ULID for time-ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(Ulid);

impl TransactionId {
    /// Generate a new `TransactionId` with the current timestamp.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Return the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> &Ulid {
        &self.0
    }
}

impl FromStr for TransactionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = Ulid::from_string(s).map_err(|_| IdError::InvalidUlid)?;
        Ok(Self(ulid))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TransactionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransactionId> for String {
    fn from(id: TransactionId) -> Self {
        id.0.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid integer id.
    #[error("invalid integer id: {0}")]
    InvalidInteger(String),

    /// The input is not a valid ULID.
    #[error("invalid ULID format")]
    InvalidUlid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids_parse_and_display() {
        let id: UserId = " 42 ".parse().unwrap();
        assert_eq!(id, UserId::new(42));
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{id:?}"), "UserId(42)");
        assert!("forty-two".parse::<ItemId>().is_err());
    }

    #[test]
    fn integer_ids_serialize_transparently() {
        let json = serde_json::to_string(&ItemId::new(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn transaction_ids_sort_by_creation() {
        let first = TransactionId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = TransactionId::generate();
        assert!(first < second);
        assert_eq!(second.to_string().parse::<TransactionId>().unwrap(), second);
    }
}
