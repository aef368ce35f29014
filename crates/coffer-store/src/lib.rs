//! Storage layer for coffer.
//!
//! This crate provides persistence for currencies, accounts, the transaction
//! log, the item catalog, and user inventories.
//!
//! # Units of work
//!
//! Every mutation happens inside a [`UnitOfWork`] obtained from
//! [`Store::begin`]. A unit commits all of its writes together or none of them:
//! call [`UnitOfWork::commit`] to persist, and drop it (or call
//! [`UnitOfWork::rollback`]) to discard.
//!
//! Units expose the three capabilities the engine relies on:
//!
//! - multi-statement atomicity,
//! - a detectable uniqueness conflict ([`StoreError::UniqueViolation`]) from
//!   [`UnitOfWork::insert_account`] and [`UnitOfWork::insert_ownership`], so
//!   first-time creation can be optimistic,
//! - server-evaluated arithmetic for counters ([`UnitOfWork::decrement_stock`],
//!   [`UnitOfWork::apply_balance_delta`], [`UnitOfWork::add_ownership_quantity`])
//!   so concurrent writers never lose an update.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process, units serialized behind an async mutex.
//! - `PgStore` (feature `postgres`): PostgreSQL through `sqlx`.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> coffer_store::Result<()> {
//! use coffer_core::UserId;
//! use coffer_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let mut unit = store.begin().await?;
//! let account = unit.insert_account(UserId::new(7), "credits").await?;
//! unit.commit().await?;
//!
//! assert!(store.get_account(UserId::new(7), "credits").await?.is_some());
//! # let _ = account;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, StoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use coffer_core::{
    Account, AccountId, BalanceDelta, Currency, Item, ItemFilter, ItemId, ItemType, NewItem,
    NewOwnership, Ownership, OwnershipFilter, OwnershipId, Transaction, TransactionFilter, UserId,
};

/// The storage trait: read-side queries plus the entry point for units of work.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open a transaction.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    // =========================================================================
    // Currencies
    // =========================================================================

    /// Get a currency by code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_currency(&self, code: &str) -> Result<Option<Currency>>;

    /// List currencies ordered by code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_currencies(&self, active_only: bool) -> Result<Vec<Currency>>;

    // =========================================================================
    // Accounts & Transactions
    // =========================================================================

    /// Get the account of `user_id` in `currency_code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, user_id: UserId, currency_code: &str) -> Result<Option<Account>>;

    /// List every account of a user ordered by currency code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_accounts(&self, user_id: UserId) -> Result<Vec<Account>>;

    /// List transactions matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>>;

    /// All transactions of one account in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn account_transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>>;

    // =========================================================================
    // Catalog & Inventory
    // =========================================================================

    /// Get an item by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored metadata
    /// does not decode.
    async fn get_item(&self, item_id: ItemId) -> Result<Option<Item>>;

    /// List items matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>>;

    /// List a user's inventory rows matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_ownerships(
        &self,
        user_id: UserId,
        filter: &OwnershipFilter,
    ) -> Result<Vec<Ownership>>;
}

/// A group of reads and writes that commit or abort together.
///
/// Dropping a unit without calling [`commit`](Self::commit) discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    // =========================================================================
    // Currencies
    // =========================================================================

    /// Read a currency inside the unit.
    async fn find_currency(&mut self, code: &str) -> Result<Option<Currency>>;

    /// Insert the currency or replace the row with the same code.
    async fn upsert_currency(&mut self, currency: &Currency) -> Result<Currency>;

    // =========================================================================
    // Accounts & Transactions
    // =========================================================================

    /// Read an account inside the unit.
    async fn find_account(&mut self, user_id: UserId, currency_code: &str)
        -> Result<Option<Account>>;

    /// Insert a zero-balance account.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the pair already exists. The
    /// unit stays usable after that failure.
    async fn insert_account(&mut self, user_id: UserId, currency_code: &str) -> Result<Account>;

    /// Apply a counter delta with server-side arithmetic.
    ///
    /// Returns the updated account, or `None` if the delta's floor would be
    /// crossed (nothing is written in that case).
    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: BalanceDelta,
    ) -> Result<Option<Account>>;

    /// Set the frozen flag of an account.
    async fn set_account_frozen(&mut self, account_id: AccountId, frozen: bool) -> Result<Account>;

    /// Append a transaction row.
    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Read an item inside the unit.
    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>>;

    /// Insert a catalog entry.
    async fn insert_item(&mut self, item: NewItem) -> Result<Item>;

    /// Overwrite the mutable fields of a catalog entry.
    async fn update_item(&mut self, item: &Item) -> Result<()>;

    /// `stock = stock - quantity`, evaluated by the store, only when
    /// `stock >= quantity`. Returns the new stock, or `None` if the guard failed.
    async fn decrement_stock(&mut self, item_id: ItemId, quantity: i64) -> Result<Option<i64>>;

    // =========================================================================
    // Inventory
    // =========================================================================

    /// The user's row for an item, if any.
    async fn find_ownership(&mut self, user_id: UserId, item_id: ItemId)
        -> Result<Option<Ownership>>;

    /// A row by id, only if it belongs to `user_id`.
    async fn find_owned(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
    ) -> Result<Option<Ownership>>;

    /// Insert a first-acquisition row (`is_equipped = false`, `status = active`).
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the user already has a row
    /// for the item. The unit stays usable after that failure.
    async fn insert_ownership(&mut self, ownership: NewOwnership) -> Result<Ownership>;

    /// `quantity = quantity + added`, forcing `status = active`, only when the
    /// result stays within `max_own` (if given). Replaces `expires_at` when one
    /// is given.
    ///
    /// Returns `None` if the row does not exist or the cap would be exceeded
    /// (nothing is written in that case).
    async fn add_ownership_quantity(
        &mut self,
        ownership_id: OwnershipId,
        added: i64,
        max_own: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Ownership>>;

    /// `quantity = quantity - used` on an active row of `user_id` holding at least
    /// `used` units. A row reaching zero becomes exhausted and unequipped.
    /// Returns `None` if no row matched.
    async fn consume_ownership(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        used: i64,
    ) -> Result<Option<Ownership>>;

    /// Unequip every equipped row of `item_type` held by `user_id`, except
    /// `keep`. Returns the number of rows changed.
    async fn unequip_slot(
        &mut self,
        user_id: UserId,
        item_type: ItemType,
        keep: OwnershipId,
    ) -> Result<u64>;

    /// Set the equipped flag of a row scoped by `(ownership_id, user_id)`.
    /// Returns `false` if no row matched.
    async fn set_equipped(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        equipped: bool,
    ) -> Result<bool>;

    // =========================================================================
    // Completion
    // =========================================================================

    /// Persist every write of the unit.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write of the unit.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
