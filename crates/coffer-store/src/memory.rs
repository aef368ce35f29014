//! In-memory storage implementation.
//!
//! Units of work take an exclusive async lock on the whole state and operate on
//! a staged copy, which replaces the shared state on commit. Units therefore run
//! one at a time (serializable), which makes this backend a faithful model of
//! the transactional contract for tests and embedded use, not a scalable store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use coffer_core::{
    Account, AccountId, BalanceDelta, Currency, Item, ItemFilter, ItemId, ItemType, NewItem,
    NewOwnership, Ownership, OwnershipFilter, OwnershipId, OwnershipStatus, Transaction,
    TransactionFilter, UserId,
};

use crate::error::{Result, StoreError};
use crate::{Store, UnitOfWork};

#[derive(Debug, Clone, Default)]
struct State {
    currencies: BTreeMap<String, Currency>,
    accounts: BTreeMap<AccountId, Account>,
    account_keys: HashMap<(UserId, String), AccountId>,
    transactions: Vec<Transaction>,
    items: BTreeMap<ItemId, Item>,
    ownerships: BTreeMap<OwnershipId, Ownership>,
    ownership_keys: HashMap<(UserId, ItemId), OwnershipId>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn account_mut(&mut self, account_id: AccountId) -> Result<&mut Account> {
        self.accounts
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: account_id.to_string(),
            })
    }
}

/// Memory-backed storage implementation.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T>(rows: impl Iterator<Item = T>, limit: usize, offset: usize) -> Vec<T> {
    rows.skip(offset).take(limit).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUnit { guard, staged }))
    }

    async fn get_currency(&self, code: &str) -> Result<Option<Currency>> {
        Ok(self.state.lock().await.currencies.get(code).cloned())
    }

    async fn list_currencies(&self, active_only: bool) -> Result<Vec<Currency>> {
        let state = self.state.lock().await;
        Ok(state
            .currencies
            .values()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect())
    }

    async fn get_account(&self, user_id: UserId, currency_code: &str) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .account_keys
            .get(&(user_id, currency_code.to_string()))
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn list_accounts(&self, user_id: UserId) -> Result<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<_> = state
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.currency_code.cmp(&b.currency_code));
        Ok(accounts)
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(paginate(
            state
                .transactions
                .iter()
                .rev()
                .filter(|tx| filter.matches(tx))
                .cloned(),
            filter.page.limit,
            filter.page.offset,
        ))
    }

    async fn account_transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_item(&self, item_id: ItemId) -> Result<Option<Item>> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        let state = self.state.lock().await;
        Ok(paginate(
            state.items.values().filter(|i| filter.matches(i)).cloned(),
            filter.page.limit,
            filter.page.offset,
        ))
    }

    async fn list_ownerships(
        &self,
        user_id: UserId,
        filter: &OwnershipFilter,
    ) -> Result<Vec<Ownership>> {
        let state = self.state.lock().await;
        Ok(state
            .ownerships
            .values()
            .filter(|o| o.user_id == user_id && filter.matches(o))
            .cloned()
            .collect())
    }
}

/// A unit of work over [`MemoryStore`].
struct MemoryUnit {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn find_currency(&mut self, code: &str) -> Result<Option<Currency>> {
        Ok(self.staged.currencies.get(code).cloned())
    }

    async fn upsert_currency(&mut self, currency: &Currency) -> Result<Currency> {
        let now = Utc::now();
        let mut stored = currency.clone();
        if let Some(existing) = self.staged.currencies.get(&currency.code) {
            stored.created_at = existing.created_at;
        }
        stored.updated_at = now;
        self.staged
            .currencies
            .insert(stored.code.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_account(
        &mut self,
        user_id: UserId,
        currency_code: &str,
    ) -> Result<Option<Account>> {
        Ok(self
            .staged
            .account_keys
            .get(&(user_id, currency_code.to_string()))
            .and_then(|id| self.staged.accounts.get(id))
            .cloned())
    }

    async fn insert_account(&mut self, user_id: UserId, currency_code: &str) -> Result<Account> {
        let key = (user_id, currency_code.to_string());
        if self.staged.account_keys.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                constraint: "accounts_user_currency_key".into(),
            });
        }

        let now = Utc::now();
        let account = Account {
            id: AccountId::new(self.staged.next_id()),
            user_id,
            currency_code: currency_code.to_string(),
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            is_frozen: false,
            created_at: now,
            updated_at: now,
        };
        self.staged.account_keys.insert(key, account.id);
        self.staged.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: BalanceDelta,
    ) -> Result<Option<Account>> {
        let account = self.staged.account_mut(account_id)?;
        if delta.apply_to(account) {
            Ok(Some(account.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_account_frozen(&mut self, account_id: AccountId, frozen: bool) -> Result<Account> {
        let account = self.staged.account_mut(account_id)?;
        account.is_frozen = frozen;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        if self
            .staged
            .transactions
            .iter()
            .any(|tx| tx.id == transaction.id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "transactions_pkey".into(),
            });
        }
        self.staged.transactions.push(transaction.clone());
        Ok(())
    }

    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>> {
        Ok(self.staged.items.get(&item_id).cloned())
    }

    async fn insert_item(&mut self, item: NewItem) -> Result<Item> {
        let item = item.into_item(ItemId::new(self.staged.next_id()));
        self.staged.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn update_item(&mut self, item: &Item) -> Result<()> {
        let stored = self
            .staged
            .items
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "item",
                id: item.id.to_string(),
            })?;
        let created_at = stored.created_at;
        *stored = item.clone();
        stored.created_at = created_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn decrement_stock(&mut self, item_id: ItemId, quantity: i64) -> Result<Option<i64>> {
        let Some(item) = self.staged.items.get_mut(&item_id) else {
            return Ok(None);
        };
        match item.stock {
            Some(stock) if stock >= quantity => {
                item.stock = Some(stock - quantity);
                item.updated_at = Utc::now();
                Ok(item.stock)
            }
            _ => Ok(None),
        }
    }

    async fn find_ownership(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<Ownership>> {
        Ok(self
            .staged
            .ownership_keys
            .get(&(user_id, item_id))
            .and_then(|id| self.staged.ownerships.get(id))
            .cloned())
    }

    async fn find_owned(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
    ) -> Result<Option<Ownership>> {
        Ok(self
            .staged
            .ownerships
            .get(&ownership_id)
            .filter(|o| o.user_id == user_id)
            .cloned())
    }

    async fn insert_ownership(&mut self, ownership: NewOwnership) -> Result<Ownership> {
        let key = (ownership.user_id, ownership.item_id);
        if self.staged.ownership_keys.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                constraint: "ownerships_user_item_key".into(),
            });
        }
        let row = ownership.into_ownership(OwnershipId::new(self.staged.next_id()));
        self.staged.ownership_keys.insert(key, row.id);
        self.staged.ownerships.insert(row.id, row.clone());
        Ok(row)
    }

    async fn add_ownership_quantity(
        &mut self,
        ownership_id: OwnershipId,
        added: i64,
        max_own: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Ownership>> {
        let Some(row) = self.staged.ownerships.get_mut(&ownership_id) else {
            return Ok(None);
        };
        if max_own.is_some_and(|cap| row.quantity.saturating_add(added) > cap) {
            return Ok(None);
        }
        row.quantity += added;
        row.status = OwnershipStatus::Active;
        if expires_at.is_some() {
            row.expires_at = expires_at;
        }
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn consume_ownership(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        used: i64,
    ) -> Result<Option<Ownership>> {
        let Some(row) = self
            .staged
            .ownerships
            .get_mut(&ownership_id)
            .filter(|o| {
                o.user_id == user_id && o.status == OwnershipStatus::Active && o.quantity >= used
            })
        else {
            return Ok(None);
        };

        row.quantity -= used;
        if row.quantity == 0 {
            row.status = OwnershipStatus::Exhausted;
            row.is_equipped = false;
        }
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn unequip_slot(
        &mut self,
        user_id: UserId,
        item_type: ItemType,
        keep: OwnershipId,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut changed = 0;
        for row in self.staged.ownerships.values_mut().filter(|o| {
            o.user_id == user_id && o.item_type == item_type && o.is_equipped && o.id != keep
        }) {
            row.is_equipped = false;
            row.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn set_equipped(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        equipped: bool,
    ) -> Result<bool> {
        match self
            .staged
            .ownerships
            .get_mut(&ownership_id)
            .filter(|o| o.user_id == user_id)
        {
            Some(row) => {
                row.is_equipped = equipped;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnit { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
