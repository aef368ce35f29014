//! Marketplace workflows.
//!
//! A checkout runs every step inside one unit of work:
//!
//! 1. load the item, reject missing or inactive items
//! 2. check stock
//! 3. load the receiver's inventory row
//! 4. enforce the consumption policy and ownership cap
//! 5. reject badges the receiver already holds
//! 6. resolve the payer's account
//! 7. check funds
//! 8. debit and record the transaction
//! 9. create or grow the inventory row; the store re-checks the cap and a
//!    concurrent first insert is re-read and grown
//! 10. grant the badge, if any
//! 11. decrement stock with a guarded store-side update
//! 12. commit
//!
//! Any failure before the commit rolls back every write, including a badge
//! collaborator failure after the debit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use coffer_core::{
    Account, BalanceDelta, Conflict, ConsumeType, EconomyError, Item, ItemFilter, ItemId,
    NewOwnership, Ownership, OwnershipFilter, OwnershipId, OwnershipStatus, Reference, Result,
    Transaction, TransactionType, UserId,
};
use coffer_store::{Store, UnitOfWork};

use crate::collaborators::{
    notify_in_background, BadgeGrant, BadgeService, BadgeSource, CollaboratorError, Notification,
    Notifier,
};
use crate::config::EngineConfig;
use crate::currency::load_snapshot;
use crate::ledger::resolve_account;

/// Outcome of a purchase or gift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// The receiver's inventory row after the purchase.
    pub ownership: Ownership,
    /// The payer's ledger entry; `None` for free items.
    pub transaction: Option<Transaction>,
    /// The payer's balance after the purchase.
    pub balance: i64,
    /// Stock left, for limited items.
    pub remaining_stock: Option<i64>,
    /// Badge delivered, for badge items.
    pub badge: Option<BadgeGrant>,
}

/// Who pays and who receives.
#[derive(Debug, Clone, Copy)]
struct Checkout<'a> {
    payer: UserId,
    receiver: UserId,
    item_id: ItemId,
    quantity: i64,
    message: Option<&'a str>,
}

impl Checkout<'_> {
    const fn is_gift(&self) -> bool {
        self.payer.get() != self.receiver.get()
    }
}

/// The marketplace.
#[derive(Clone)]
pub struct Marketplace {
    store: Arc<dyn Store>,
    badges: Arc<dyn BadgeService>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl Marketplace {
    /// Create a marketplace over `store` with its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        badges: Arc<dyn BadgeService>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            badges,
            notifier,
            config,
        }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// List catalog items.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_items(&self, mut filter: ItemFilter) -> Result<Vec<Item>> {
        filter.page = self.config.page(filter.page);
        Ok(self.store.list_items(&filter).await?)
    }

    /// Get a catalog item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub async fn get_item(&self, item_id: ItemId) -> Result<Item> {
        self.store
            .get_item(item_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("item", item_id))
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Buy `quantity` units of an item for oneself.
    ///
    /// # Errors
    ///
    /// - `Validation` for a quantity below one, or above one for non-consumables
    /// - `NotFound` if the item does not exist
    /// - `Conflict` for inactive items, stock, ownership and frozen-account rules
    /// - `InsufficientFunds` if the buyer cannot pay
    /// - `AtomicityFailure` if the badge service fails
    pub async fn purchase(
        &self,
        user_id: UserId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<PurchaseReceipt> {
        self.checkout(Checkout {
            payer: user_id,
            receiver: user_id,
            item_id,
            quantity,
            message: None,
        })
        .await
    }

    /// Buy one unit of an item for another user and notify them.
    ///
    /// The notification is sent after commit; its failure does not affect the
    /// result.
    ///
    /// # Errors
    ///
    /// Same as [`purchase`](Self::purchase), plus `Validation` for a gift to
    /// oneself.
    pub async fn gift(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        item_id: ItemId,
        message: Option<String>,
    ) -> Result<PurchaseReceipt> {
        if from_user_id == to_user_id {
            return Err(EconomyError::Validation("cannot gift to oneself".into()));
        }

        let receipt = self
            .checkout(Checkout {
                payer: from_user_id,
                receiver: to_user_id,
                item_id,
                quantity: 1,
                message: message.as_deref(),
            })
            .await?;

        notify_in_background(
            Arc::clone(&self.notifier),
            Notification {
                user_id: to_user_id,
                kind: "gift_received".into(),
                message: message.unwrap_or_else(|| "You received a gift".into()),
                metadata: json!({
                    "from_user_id": from_user_id,
                    "item_id": item_id,
                    "ownership_id": receipt.ownership.id,
                }),
            },
        );

        Ok(receipt)
    }

    async fn checkout(&self, order: Checkout<'_>) -> Result<PurchaseReceipt> {
        if order.quantity < 1 {
            return Err(EconomyError::Validation("quantity must be at least 1".into()));
        }

        let mut unit = self.store.begin().await?;

        let item = unit
            .find_item(order.item_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("item", order.item_id))?;
        if !item.is_active {
            return Err(Conflict::ItemInactive.into());
        }

        if let Some(available) = item.stock {
            if available < order.quantity {
                return Err(Conflict::InsufficientStock {
                    available,
                    requested: order.quantity,
                }
                .into());
            }
        }

        let existing = unit.find_ownership(order.receiver, item.id).await?;
        check_ownership_rules(&item, existing.as_ref(), order.quantity)?;

        if let Some(badge_id) = item.badge_id() {
            let held = self
                .badges
                .has_badge(order.receiver, badge_id)
                .await
                .map_err(badge_failure)?;
            if held {
                return Err(Conflict::AlreadyOwned.into());
            }
        }

        let snapshot = load_snapshot(unit.as_mut(), &item.currency_code).await?;
        let account = resolve_account(unit.as_mut(), order.payer, &item.currency_code).await?;
        if account.is_frozen {
            return Err(Conflict::AccountFrozen.into());
        }

        let total = item
            .price
            .checked_mul(order.quantity)
            .ok_or_else(|| EconomyError::Validation("total price is too large".into()))?;
        let insufficient = || {
            EconomyError::insufficient_funds(&snapshot.code, &snapshot.symbol, account.balance, total)
        };
        if !account.has_sufficient_funds(total) {
            return Err(insufficient());
        }

        let (balance, transaction) = if total > 0 {
            let paid = unit
                .apply_balance_delta(account.id, BalanceDelta::debit(total))
                .await?
                .ok_or_else(insufficient)?;
            let tx = purchase_transaction(&paid, &item, &order, total);
            unit.insert_transaction(&tx).await?;
            (paid.balance, Some(tx))
        } else {
            (account.balance, None)
        };

        let ownership = credit_inventory(unit.as_mut(), &item, &order, existing).await?;

        let badge = match item.badge_id() {
            Some(badge_id) => {
                let source = if order.is_gift() {
                    BadgeSource::Gift {
                        item_id: item.id,
                        from_user_id: order.payer,
                    }
                } else {
                    BadgeSource::Purchase { item_id: item.id }
                };
                let grant = self
                    .badges
                    .grant_badge(order.receiver, badge_id, source)
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            user_id = %order.receiver,
                            badge_id = %badge_id,
                            item_id = %item.id,
                            error = %e,
                            "Badge grant failed, rolling back purchase"
                        );
                        badge_failure(e)
                    })?;
                Some(grant)
            }
            None => None,
        };

        let remaining_stock = if item.stock.is_some() {
            match unit.decrement_stock(item.id, order.quantity).await? {
                Some(left) => Some(left),
                None => {
                    let available = unit
                        .find_item(item.id)
                        .await?
                        .and_then(|i| i.stock)
                        .unwrap_or(0);
                    return Err(Conflict::InsufficientStock {
                        available,
                        requested: order.quantity,
                    }
                    .into());
                }
            }
        } else {
            None
        };

        unit.commit().await?;

        tracing::info!(
            payer = %order.payer,
            receiver = %order.receiver,
            item_id = %item.id,
            quantity = order.quantity,
            total,
            balance_after = balance,
            "Checkout completed"
        );

        Ok(PurchaseReceipt {
            ownership,
            transaction,
            balance,
            remaining_stock,
            badge,
        })
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// List a user's inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_owned(
        &self,
        user_id: UserId,
        filter: OwnershipFilter,
    ) -> Result<Vec<Ownership>> {
        Ok(self.store.list_ownerships(user_id, &filter).await?)
    }

    /// Equip an owned item, unequipping any other item in the same slot.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the row does not exist or belongs to someone else
    /// - `UnsupportedOperation` if the item type is not an equip slot
    /// - `Validation` if the row is exhausted
    pub async fn equip(&self, user_id: UserId, ownership_id: OwnershipId) -> Result<Ownership> {
        let mut unit = self.store.begin().await?;
        let row = unit
            .find_owned(ownership_id, user_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("ownership", ownership_id))?;

        if !row.item_type.is_equip_slot() {
            return Err(EconomyError::UnsupportedOperation(format!(
                "{} items cannot be equipped",
                row.item_type
            )));
        }
        if row.status != OwnershipStatus::Active {
            return Err(EconomyError::Validation(
                "exhausted items cannot be equipped".into(),
            ));
        }

        let unequipped = unit.unequip_slot(user_id, row.item_type, row.id).await?;
        if !unit.set_equipped(row.id, user_id, true).await? {
            return Err(EconomyError::not_found("ownership", ownership_id));
        }
        let equipped = unit
            .find_owned(row.id, user_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("ownership", ownership_id))?;
        unit.commit().await?;

        tracing::info!(
            user_id = %user_id,
            ownership_id = %ownership_id,
            slot = %row.item_type,
            unequipped,
            "Item equipped"
        );
        Ok(equipped)
    }

    /// Unequip an owned item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no row `ownership_id` belongs to `user_id`.
    pub async fn unequip(&self, user_id: UserId, ownership_id: OwnershipId) -> Result<()> {
        let mut unit = self.store.begin().await?;
        if !unit.set_equipped(ownership_id, user_id, false).await? {
            return Err(EconomyError::not_found("ownership", ownership_id));
        }
        unit.commit().await?;

        tracing::info!(user_id = %user_id, ownership_id = %ownership_id, "Item unequipped");
        Ok(())
    }

    /// Use up `quantity` units of a consumable item.
    ///
    /// # Errors
    ///
    /// - `Validation` if the quantity is below one or exceeds what is held
    /// - `NotFound` if the row does not exist or belongs to someone else
    /// - `UnsupportedOperation` if the item is not consumable
    pub async fn consume(
        &self,
        user_id: UserId,
        ownership_id: OwnershipId,
        quantity: i64,
    ) -> Result<Ownership> {
        if quantity < 1 {
            return Err(EconomyError::Validation("quantity must be at least 1".into()));
        }

        let mut unit = self.store.begin().await?;
        let row = unit
            .find_owned(ownership_id, user_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("ownership", ownership_id))?;
        let item = unit
            .find_item(row.item_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("item", row.item_id))?;
        if item.consume_type != ConsumeType::Consumable {
            return Err(EconomyError::UnsupportedOperation(format!(
                "{} items cannot be consumed",
                item.consume_type
            )));
        }

        let Some(updated) = unit.consume_ownership(row.id, user_id, quantity).await? else {
            let held = if row.status == OwnershipStatus::Active {
                row.quantity
            } else {
                0
            };
            return Err(EconomyError::Validation(format!(
                "cannot consume {quantity}, only {held} held"
            )));
        };
        unit.commit().await?;

        tracing::info!(
            user_id = %user_id,
            ownership_id = %ownership_id,
            quantity,
            remaining = updated.quantity,
            "Item consumed"
        );
        Ok(updated)
    }
}

fn check_ownership_rules(item: &Item, existing: Option<&Ownership>, quantity: i64) -> Result<()> {
    if !item.consume_type.accumulates() {
        if quantity != 1 {
            return Err(EconomyError::Validation(
                "non-consumable items are bought one at a time".into(),
            ));
        }
        if existing.is_some() {
            return Err(Conflict::AlreadyOwned.into());
        }
        return Ok(());
    }

    if let Some(max_own) = item.max_own {
        let owned = active_quantity(existing);
        if owned.saturating_add(quantity) > max_own {
            return Err(cap_exceeded(max_own, owned));
        }
    }
    Ok(())
}

fn active_quantity(row: Option<&Ownership>) -> i64 {
    row.filter(|row| row.status == OwnershipStatus::Active)
        .map_or(0, |row| row.quantity)
}

fn cap_exceeded(max_own: i64, owned: i64) -> EconomyError {
    Conflict::OwnershipCapExceeded {
        max_own,
        owned,
        remaining: (max_own - owned).max(0),
    }
    .into()
}

/// Create or grow the receiver's inventory row.
///
/// The rules checked against `existing` are re-applied by the store: growth is
/// capped at `max_own` server-side, and a first insert that collides with a
/// row created by a concurrent checkout re-reads that row and grows it instead.
async fn credit_inventory(
    unit: &mut dyn UnitOfWork,
    item: &Item,
    order: &Checkout<'_>,
    existing: Option<Ownership>,
) -> Result<Ownership> {
    let row = match existing {
        Some(row) => row,
        None => {
            let inserted = unit
                .insert_ownership(NewOwnership {
                    user_id: order.receiver,
                    item_id: item.id,
                    item_type: item.item_type(),
                    quantity: order.quantity,
                    expires_at: subscription_expiry(item, None, order.quantity),
                })
                .await;
            match inserted {
                Ok(row) => return Ok(row),
                Err(err) if err.is_unique_violation() => {
                    tracing::debug!(
                        receiver = %order.receiver,
                        item_id = %item.id,
                        "Inventory row created concurrently, re-reading"
                    );
                    let row = unit
                        .find_ownership(order.receiver, item.id)
                        .await?
                        .ok_or_else(|| EconomyError::Storage(err.to_string()))?;
                    check_ownership_rules(item, Some(&row), order.quantity)?;
                    row
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    let expires_at = subscription_expiry(item, Some(&row), order.quantity);
    if let Some(grown) = unit
        .add_ownership_quantity(row.id, order.quantity, item.max_own, expires_at)
        .await?
    {
        return Ok(grown);
    }

    let current = unit.find_ownership(order.receiver, item.id).await?;
    match (item.max_own, current) {
        (Some(max_own), Some(current)) => {
            Err(cap_exceeded(max_own, active_quantity(Some(&current))))
        }
        _ => Err(EconomyError::not_found("ownership", row.id)),
    }
}

/// New `expires_at` for a subscription purchase: each unit adds `duration_days`
/// counted from the later of now and the current expiry.
fn subscription_expiry(
    item: &Item,
    existing: Option<&Ownership>,
    quantity: i64,
) -> Option<DateTime<Utc>> {
    if item.consume_type != ConsumeType::Subscription {
        return None;
    }
    let days = i64::from(item.duration_days?);
    let now = Utc::now();
    let start = existing
        .and_then(|row| row.expires_at)
        .filter(|at| *at > now)
        .unwrap_or(now);
    start.checked_add_signed(Duration::try_days(days.checked_mul(quantity)?)?)
}

fn purchase_transaction(
    paid: &Account,
    item: &Item,
    order: &Checkout<'_>,
    total: i64,
) -> Transaction {
    let (transaction_type, description) = if order.is_gift() {
        (
            TransactionType::ShopGift,
            format!("Gift: {} x{}", item.name, order.quantity),
        )
    } else {
        (
            TransactionType::ShopPurchase,
            format!("Purchase: {} x{}", item.name, order.quantity),
        )
    };

    let mut metadata = json!({
        "item_id": item.id,
        "item_name": item.name,
        "item_type": item.item_type(),
        "quantity": order.quantity,
        "unit_price": item.price,
    });
    if let Some(message) = order.message {
        metadata["message"] = json!(message);
    }

    let tx = Transaction::record(paid, -total, transaction_type)
        .with_reference(Some(Reference::new("item", item.id)))
        .with_description(Some(description))
        .with_metadata(metadata);
    if order.is_gift() {
        tx.with_related_user(order.receiver)
    } else {
        tx
    }
}

fn badge_failure(err: CollaboratorError) -> EconomyError {
    EconomyError::AtomicityFailure {
        collaborator: "badge service",
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::{ItemKind, ItemType, NewItem};

    fn item(consume_type: ConsumeType, max_own: Option<i64>, duration_days: Option<i32>) -> Item {
        let mut new = NewItem::new(
            "Thing",
            10,
            "credits",
            ItemKind::Generic {
                attributes: serde_json::Value::Null,
            },
            consume_type,
        );
        new.max_own = max_own;
        new.duration_days = duration_days;
        new.into_item(ItemId::new(1))
    }

    fn owned(quantity: i64, expires_at: Option<DateTime<Utc>>) -> Ownership {
        NewOwnership {
            user_id: UserId::new(1),
            item_id: ItemId::new(1),
            item_type: ItemType::Generic,
            quantity,
            expires_at,
        }
        .into_ownership(OwnershipId::new(1))
    }

    #[test]
    fn cap_reports_remaining_capacity() {
        let potion = item(ConsumeType::Consumable, Some(3), None);
        let err = check_ownership_rules(&potion, Some(&owned(2, None)), 2).unwrap_err();
        assert!(matches!(
            err,
            EconomyError::Conflict(Conflict::OwnershipCapExceeded {
                max_own: 3,
                owned: 2,
                remaining: 1
            })
        ));
        assert!(check_ownership_rules(&potion, Some(&owned(2, None)), 1).is_ok());
    }

    #[test]
    fn non_consumables_are_single_units() {
        let frame = item(ConsumeType::NonConsumable, None, None);
        assert!(matches!(
            check_ownership_rules(&frame, None, 2),
            Err(EconomyError::Validation(_))
        ));
        assert!(matches!(
            check_ownership_rules(&frame, Some(&owned(1, None)), 1),
            Err(EconomyError::Conflict(Conflict::AlreadyOwned))
        ));
    }

    #[test]
    fn subscription_extends_from_current_expiry() {
        let pass = item(ConsumeType::Subscription, None, Some(30));
        let later = Utc::now() + Duration::days(10);

        let extended = subscription_expiry(&pass, Some(&owned(1, Some(later))), 2).unwrap();
        assert_eq!(extended, later + Duration::days(60));

        let lapsed = Utc::now() - Duration::days(5);
        let renewed = subscription_expiry(&pass, Some(&owned(1, Some(lapsed))), 1).unwrap();
        assert!(renewed > Utc::now() + Duration::days(29));

        let potion = item(ConsumeType::Consumable, None, None);
        assert!(subscription_expiry(&potion, None, 1).is_none());
    }
}
