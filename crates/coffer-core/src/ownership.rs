//! Inventory rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::UnknownVariant;
use crate::{ItemId, ItemType, OwnershipId, UserId};

/// One item held by one user.
///
/// Non-consumable items have at most one row per `(user, item)`; consumable and
/// subscription items accumulate `quantity` on the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    /// Row id.
    pub id: OwnershipId,
    /// Holder.
    pub user_id: UserId,
    /// Item held.
    pub item_id: ItemId,
    /// Type of the held item, denormalized for slot handling.
    pub item_type: ItemType,
    /// Units held.
    pub quantity: i64,
    /// Whether the item is currently worn.
    pub is_equipped: bool,
    /// Lifecycle status.
    pub status: OwnershipStatus,
    /// End of validity for subscriptions.
    pub expires_at: Option<DateTime<Utc>>,
    /// First acquisition.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a first acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOwnership {
    /// Holder.
    pub user_id: UserId,
    /// Item held.
    pub item_id: ItemId,
    /// Type of the item.
    pub item_type: ItemType,
    /// Units acquired.
    pub quantity: i64,
    /// End of validity for subscriptions.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewOwnership {
    /// Materialize the row once the store has assigned an id.
    #[must_use]
    pub fn into_ownership(self, id: OwnershipId) -> Ownership {
        let now = Utc::now();
        Ownership {
            id,
            user_id: self.user_id,
            item_id: self.item_id,
            item_type: self.item_type,
            quantity: self.quantity,
            is_equipped: false,
            status: OwnershipStatus::Active,
            expires_at: self.expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle of an inventory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipStatus {
    /// Usable.
    Active,
    /// All units consumed.
    Exhausted,
}

impl OwnershipStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for OwnershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnershipStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(UnknownVariant::new("ownership status", other)),
        }
    }
}
