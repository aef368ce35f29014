//! Common test utilities for coffer engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use coffer_core::{
    Account, AccountId, BadgeId, BalanceDelta, Caller, ConsumeType, Currency, Item, ItemFilter,
    ItemId, ItemKind, ItemType, NewItem, NewOwnership, Ownership, OwnershipFilter, OwnershipId,
    Role, Transaction, TransactionFilter, UserId,
};
use coffer_engine::{
    BadgeGrant, BadgeService, BadgeSource, CollaboratorError, Economy, EngineConfig, GrantRequest,
    Notification, Notifier,
};
use coffer_store::{MemoryStore, Store, UnitOfWork};

/// Currency every harness registers.
pub const CREDITS: &str = "credits";

/// Badge service that records grants in memory and can be told to fail.
#[derive(Default)]
pub struct FakeBadges {
    held: Mutex<HashSet<(UserId, BadgeId)>>,
    fail_grants: AtomicBool,
}

impl FakeBadges {
    pub fn give(&self, user_id: UserId, badge_id: BadgeId) {
        self.held.lock().unwrap().insert((user_id, badge_id));
    }

    pub fn holds(&self, user_id: UserId, badge_id: BadgeId) -> bool {
        self.held.lock().unwrap().contains(&(user_id, badge_id))
    }

    pub fn fail_grants(&self, fail: bool) {
        self.fail_grants.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BadgeService for FakeBadges {
    async fn has_badge(
        &self,
        user_id: UserId,
        badge_id: BadgeId,
    ) -> Result<bool, CollaboratorError> {
        Ok(self.holds(user_id, badge_id))
    }

    async fn grant_badge(
        &self,
        user_id: UserId,
        badge_id: BadgeId,
        source: BadgeSource,
    ) -> Result<BadgeGrant, CollaboratorError> {
        if self.fail_grants.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("badge backend down".into()));
        }
        self.give(user_id, badge_id);
        Ok(BadgeGrant {
            user_id,
            badge_id,
            source,
            granted_at: Utc::now(),
        })
    }
}

/// Notifier that records what it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(notification);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("mailer offline".into()));
        }
        Ok(())
    }
}

/// Test harness: an economy over a fresh in-memory store.
pub struct TestHarness {
    pub store: Arc<dyn Store>,
    pub economy: Economy,
    pub badges: Arc<FakeBadges>,
    pub notifier: Arc<RecordingNotifier>,
    pub admin: Caller,
}

impl TestHarness {
    /// Fresh in-memory harness with the `credits` currency registered.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    /// Harness over a caller-supplied store.
    pub async fn with_store(store: Arc<dyn Store>) -> Self {
        let badges = Arc::new(FakeBadges::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let economy = Economy::new(
            Arc::clone(&store),
            badges.clone(),
            notifier.clone(),
            EngineConfig::default(),
        );
        let admin = Caller::new(UserId::new(1), Role::Admin);

        let mut credits = Currency::new(CREDITS, "Credits", "◆");
        credits
            .config
            .set("min_transfer", json!(1), Some("smallest transfer".into()));
        economy
            .admin
            .upsert_currency(&admin, credits)
            .await
            .expect("Failed to register currency");

        Self {
            store,
            economy,
            badges,
            notifier,
            admin,
        }
    }

    /// Grant `amount` credits to `user_id`.
    pub async fn fund(&self, user_id: UserId, amount: i64) {
        self.economy
            .ledger
            .grant(GrantRequest::new(user_id, CREDITS, amount))
            .await
            .expect("Failed to fund account");
    }

    /// Current balance, zero if the account does not exist.
    pub async fn balance(&self, user_id: UserId) -> i64 {
        self.economy
            .ledger
            .account(user_id, CREDITS)
            .await
            .expect("Failed to read account")
            .map_or(0, |a| a.balance)
    }

    /// Number of ledger entries of a user.
    pub async fn entries(&self, user_id: UserId) -> usize {
        self.economy
            .ledger
            .history(TransactionFilter::for_user(user_id))
            .await
            .expect("Failed to read history")
            .len()
    }

    /// Assert the ledger reproduces the user's balance.
    pub async fn assert_conserved(&self, user_id: UserId) {
        let audit = self
            .economy
            .ledger
            .verify_account(user_id, CREDITS)
            .await
            .expect("Failed to audit account");
        assert!(audit.is_consistent(), "ledger drift: {audit:?}");
    }

    /// Create a catalog item as the admin.
    pub async fn create_item(&self, item: NewItem) -> Item {
        self.economy
            .admin
            .create_item(&self.admin, item)
            .await
            .expect("Failed to create item")
    }

    /// Create an avatar frame with the given price and stock.
    pub async fn frame(&self, price: i64, stock: Option<i64>) -> Item {
        let mut item = NewItem::new(
            "Gold Frame",
            price,
            CREDITS,
            ItemKind::AvatarFrame {
                image_url: Some("https://cdn.example/frames/gold.png".into()),
            },
            ConsumeType::NonConsumable,
        );
        item.stock = stock;
        self.create_item(item).await
    }

    /// Create a consumable generic item.
    pub async fn potion(&self, price: i64, max_own: Option<i64>) -> Item {
        let mut item = NewItem::new(
            "Potion",
            price,
            CREDITS,
            ItemKind::Generic {
                attributes: json!({"heal": 10}),
            },
            ConsumeType::Consumable,
        );
        item.max_own = max_own;
        self.create_item(item).await
    }

    /// Create a badge item.
    pub async fn badge(&self, price: i64, badge_id: BadgeId) -> Item {
        self.create_item(NewItem::new(
            "Supporter Badge",
            price,
            CREDITS,
            ItemKind::Badge { badge_id },
            ConsumeType::NonConsumable,
        ))
        .await
    }
}

// ============================================================================
// Race simulation
// ============================================================================

/// What a [`RacingStore`] unit should pretend happened between a read and the
/// write that follows it. Every flag applies once and then resets.
#[derive(Default)]
pub struct RaceScript {
    /// Miss the next account lookup, as if the account was created concurrently.
    pub hide_next_account: AtomicBool,
    /// Miss the next inventory lookup, as if the row was created concurrently.
    pub hide_next_ownership: AtomicBool,
    /// Report the next inventory row with this quantity, as if a concurrent
    /// purchase grew it after the read.
    pub stale_next_quantity: Mutex<Option<i64>>,
    /// Fail the next stock decrement, as if the last units sold concurrently.
    pub fail_next_stock_guard: AtomicBool,
}

/// In-memory store whose units replay a [`RaceScript`].
///
/// `MemoryStore` serializes units, so real interleavings never happen there;
/// this reproduces what the losing side of one observes.
pub struct RacingStore {
    inner: MemoryStore,
    pub script: Arc<RaceScript>,
}

impl RacingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            script: Arc::new(RaceScript::default()),
        }
    }
}

struct RacingUnit {
    inner: Box<dyn UnitOfWork>,
    script: Arc<RaceScript>,
}

#[async_trait]
impl Store for RacingStore {
    async fn begin(&self) -> coffer_store::Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(RacingUnit {
            inner: self.inner.begin().await?,
            script: Arc::clone(&self.script),
        }))
    }

    async fn get_currency(&self, code: &str) -> coffer_store::Result<Option<Currency>> {
        self.inner.get_currency(code).await
    }

    async fn list_currencies(&self, active_only: bool) -> coffer_store::Result<Vec<Currency>> {
        self.inner.list_currencies(active_only).await
    }

    async fn get_account(
        &self,
        user_id: UserId,
        currency_code: &str,
    ) -> coffer_store::Result<Option<Account>> {
        self.inner.get_account(user_id, currency_code).await
    }

    async fn list_accounts(&self, user_id: UserId) -> coffer_store::Result<Vec<Account>> {
        self.inner.list_accounts(user_id).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> coffer_store::Result<Vec<Transaction>> {
        self.inner.list_transactions(filter).await
    }

    async fn account_transactions(
        &self,
        account_id: AccountId,
    ) -> coffer_store::Result<Vec<Transaction>> {
        self.inner.account_transactions(account_id).await
    }

    async fn get_item(&self, item_id: ItemId) -> coffer_store::Result<Option<Item>> {
        self.inner.get_item(item_id).await
    }

    async fn list_items(&self, filter: &ItemFilter) -> coffer_store::Result<Vec<Item>> {
        self.inner.list_items(filter).await
    }

    async fn list_ownerships(
        &self,
        user_id: UserId,
        filter: &OwnershipFilter,
    ) -> coffer_store::Result<Vec<Ownership>> {
        self.inner.list_ownerships(user_id, filter).await
    }
}

#[async_trait]
impl UnitOfWork for RacingUnit {
    async fn find_currency(&mut self, code: &str) -> coffer_store::Result<Option<Currency>> {
        self.inner.find_currency(code).await
    }

    async fn upsert_currency(&mut self, currency: &Currency) -> coffer_store::Result<Currency> {
        self.inner.upsert_currency(currency).await
    }

    async fn find_account(
        &mut self,
        user_id: UserId,
        currency_code: &str,
    ) -> coffer_store::Result<Option<Account>> {
        if self.script.hide_next_account.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_account(user_id, currency_code).await
    }

    async fn insert_account(
        &mut self,
        user_id: UserId,
        currency_code: &str,
    ) -> coffer_store::Result<Account> {
        self.inner.insert_account(user_id, currency_code).await
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: BalanceDelta,
    ) -> coffer_store::Result<Option<Account>> {
        self.inner.apply_balance_delta(account_id, delta).await
    }

    async fn set_account_frozen(
        &mut self,
        account_id: AccountId,
        frozen: bool,
    ) -> coffer_store::Result<Account> {
        self.inner.set_account_frozen(account_id, frozen).await
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> coffer_store::Result<()> {
        self.inner.insert_transaction(transaction).await
    }

    async fn find_item(&mut self, item_id: ItemId) -> coffer_store::Result<Option<Item>> {
        self.inner.find_item(item_id).await
    }

    async fn insert_item(&mut self, item: NewItem) -> coffer_store::Result<Item> {
        self.inner.insert_item(item).await
    }

    async fn update_item(&mut self, item: &Item) -> coffer_store::Result<()> {
        self.inner.update_item(item).await
    }

    async fn decrement_stock(
        &mut self,
        item_id: ItemId,
        quantity: i64,
    ) -> coffer_store::Result<Option<i64>> {
        if self.script.fail_next_stock_guard.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.decrement_stock(item_id, quantity).await
    }

    async fn find_ownership(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> coffer_store::Result<Option<Ownership>> {
        if self.script.hide_next_ownership.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let row = self.inner.find_ownership(user_id, item_id).await?;
        let stale = self.script.stale_next_quantity.lock().unwrap().take();
        Ok(match stale {
            Some(quantity) => row.map(|row| Ownership { quantity, ..row }),
            None => row,
        })
    }

    async fn find_owned(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
    ) -> coffer_store::Result<Option<Ownership>> {
        self.inner.find_owned(ownership_id, user_id).await
    }

    async fn insert_ownership(
        &mut self,
        ownership: NewOwnership,
    ) -> coffer_store::Result<Ownership> {
        self.inner.insert_ownership(ownership).await
    }

    async fn add_ownership_quantity(
        &mut self,
        ownership_id: OwnershipId,
        added: i64,
        max_own: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> coffer_store::Result<Option<Ownership>> {
        self.inner
            .add_ownership_quantity(ownership_id, added, max_own, expires_at)
            .await
    }

    async fn consume_ownership(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        used: i64,
    ) -> coffer_store::Result<Option<Ownership>> {
        self.inner
            .consume_ownership(ownership_id, user_id, used)
            .await
    }

    async fn unequip_slot(
        &mut self,
        user_id: UserId,
        item_type: ItemType,
        keep: OwnershipId,
    ) -> coffer_store::Result<u64> {
        self.inner.unequip_slot(user_id, item_type, keep).await
    }

    async fn set_equipped(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        equipped: bool,
    ) -> coffer_store::Result<bool> {
        self.inner
            .set_equipped(ownership_id, user_id, equipped)
            .await
    }

    async fn commit(self: Box<Self>) -> coffer_store::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> coffer_store::Result<()> {
        self.inner.rollback().await
    }
}
