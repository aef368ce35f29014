//! Read-side filters shared by the engine and the storage backends.

use serde::{Deserialize, Serialize};

use crate::{ConsumeType, Item, ItemType, Ownership, OwnershipStatus, Transaction, TransactionType, UserId};

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Maximum rows returned.
    pub limit: usize,
    /// Rows skipped.
    pub offset: usize,
}

impl Page {
    /// A page of `limit` rows starting at `offset`.
    #[must_use]
    pub const fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    /// Clamp the limit to `max`.
    #[must_use]
    pub fn clamped(self, max: usize) -> Self {
        Self {
            limit: self.limit.min(max),
            offset: self.offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Catalog query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFilter {
    /// Only items of this type.
    #[serde(default)]
    pub item_type: Option<ItemType>,
    /// Only items priced in this currency.
    #[serde(default)]
    pub currency_code: Option<String>,
    /// Only items with this consumption policy.
    #[serde(default)]
    pub consume_type: Option<ConsumeType>,
    /// Hide inactive items.
    #[serde(default = "default_true")]
    pub active_only: bool,
    /// Pagination.
    #[serde(default)]
    pub page: Page,
}

fn default_true() -> bool {
    true
}

impl Default for ItemFilter {
    fn default() -> Self {
        Self {
            item_type: None,
            currency_code: None,
            consume_type: None,
            active_only: true,
            page: Page::default(),
        }
    }
}

impl ItemFilter {
    /// Whether `item` passes the filter (pagination aside).
    #[must_use]
    pub fn matches(&self, item: &Item) -> bool {
        self.item_type.map_or(true, |t| item.item_type() == t)
            && self
                .currency_code
                .as_deref()
                .map_or(true, |c| item.currency_code == c)
            && self.consume_type.map_or(true, |c| item.consume_type == c)
            && (!self.active_only || item.is_active)
    }
}

/// Inventory query for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipFilter {
    /// Only items of this type.
    #[serde(default)]
    pub item_type: Option<ItemType>,
    /// Only rows in this status.
    #[serde(default)]
    pub status: Option<OwnershipStatus>,
    /// Only equipped rows.
    #[serde(default)]
    pub equipped_only: bool,
}

impl OwnershipFilter {
    /// Whether `row` passes the filter.
    #[must_use]
    pub fn matches(&self, row: &Ownership) -> bool {
        self.item_type.map_or(true, |t| row.item_type == t)
            && self.status.map_or(true, |s| row.status == s)
            && (!self.equipped_only || row.is_equipped)
    }
}

/// Ledger history query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Whose history.
    pub user_id: UserId,
    /// Only this currency.
    #[serde(default)]
    pub currency_code: Option<String>,
    /// Only this type.
    #[serde(default)]
    pub transaction_type: Option<TransactionType>,
    /// Pagination (newest first).
    #[serde(default)]
    pub page: Page,
}

impl TransactionFilter {
    /// All history of a user, first page.
    #[must_use]
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            currency_code: None,
            transaction_type: None,
            page: Page::default(),
        }
    }

    /// Whether `tx` passes the filter (pagination aside).
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.user_id == self.user_id
            && self
                .currency_code
                .as_deref()
                .map_or(true, |c| tx.currency_code == c)
            && self.transaction_type.map_or(true, |t| tx.transaction_type == t)
    }
}
