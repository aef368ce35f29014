//! Administrative operations.
//!
//! Every method takes the calling identity and refuses anyone without the
//! admin role before touching the store.

use std::sync::Arc;

use coffer_core::{
    Account, Caller, Currency, EconomyError, Item, ItemId, ItemUpdate, NewItem, Result,
    Transaction, UserId,
};
use coffer_store::Store;

use crate::currency::CurrencyRegistry;
use crate::ledger::{DeductRequest, GrantRequest, Ledger};

/// Privileged facade over the ledger, registry and catalog.
#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn Store>,
    ledger: Ledger,
    currencies: CurrencyRegistry,
}

impl Admin {
    /// Create the facade.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ledger: Ledger, currencies: CurrencyRegistry) -> Self {
        Self {
            store,
            ledger,
            currencies,
        }
    }

    /// Create a currency or update the one with the same code.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `Validation` for a malformed currency.
    pub async fn upsert_currency(&self, caller: &Caller, currency: Currency) -> Result<Currency> {
        caller.require_privileged()?;
        self.currencies.upsert(&currency).await
    }

    /// Credit an account in an active currency.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `Validation` for inactive currencies, plus
    /// the errors of [`Ledger::grant`].
    pub async fn grant(&self, caller: &Caller, req: GrantRequest) -> Result<Transaction> {
        caller.require_privileged()?;
        self.require_active(&req.currency_code).await?;

        let tx = self.ledger.grant(req).await?;
        tracing::info!(admin_id = %caller.user_id, transaction_id = %tx.id, "Admin grant");
        Ok(tx)
    }

    /// Debit an account; with `allow_negative` the funds and frozen checks are
    /// skipped so the balance may go below zero.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `Validation` for inactive currencies, plus
    /// the errors of [`Ledger::deduct`].
    pub async fn deduct(
        &self,
        caller: &Caller,
        mut req: DeductRequest,
        allow_negative: bool,
    ) -> Result<Transaction> {
        caller.require_privileged()?;
        self.require_active(&req.currency_code).await?;

        req.allow_negative = allow_negative;
        let tx = self.ledger.deduct(req).await?;
        tracing::info!(
            admin_id = %caller.user_id,
            transaction_id = %tx.id,
            allow_negative,
            "Admin deduct"
        );
        Ok(tx)
    }

    /// Freeze or unfreeze an existing account.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `NotFound` if the account does not exist.
    pub async fn set_account_frozen(
        &self,
        caller: &Caller,
        user_id: UserId,
        currency_code: &str,
        frozen: bool,
    ) -> Result<Account> {
        caller.require_privileged()?;

        let mut unit = self.store.begin().await?;
        let account = unit
            .find_account(user_id, currency_code)
            .await?
            .ok_or_else(|| EconomyError::not_found("account", format!("{user_id}/{currency_code}")))?;
        let account = unit.set_account_frozen(account.id, frozen).await?;
        unit.commit().await?;

        tracing::info!(
            admin_id = %caller.user_id,
            user_id = %user_id,
            currency = %currency_code,
            frozen,
            "Account freeze updated"
        );
        Ok(account)
    }

    /// Add an item to the catalog.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `Validation` for invalid fields, `NotFound`
    /// if the price currency is not registered.
    pub async fn create_item(&self, caller: &Caller, item: NewItem) -> Result<Item> {
        caller.require_privileged()?;
        item.validate()?;
        self.currencies.get(&item.currency_code).await?;

        let mut unit = self.store.begin().await?;
        let item = unit.insert_item(item).await?;
        unit.commit().await?;

        tracing::info!(
            admin_id = %caller.user_id,
            item_id = %item.id,
            item_type = %item.item_type(),
            price = item.price,
            "Item created"
        );
        Ok(item)
    }

    /// Change an existing catalog item.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `NotFound` for unknown items, `Validation`
    /// if the result is invalid.
    pub async fn update_item(
        &self,
        caller: &Caller,
        item_id: ItemId,
        update: ItemUpdate,
    ) -> Result<Item> {
        caller.require_privileged()?;

        let mut unit = self.store.begin().await?;
        let current = unit
            .find_item(item_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("item", item_id))?;
        let next = update.apply(&current)?;
        unit.update_item(&next).await?;
        let stored = unit
            .find_item(item_id)
            .await?
            .ok_or_else(|| EconomyError::not_found("item", item_id))?;
        unit.commit().await?;

        tracing::info!(admin_id = %caller.user_id, item_id = %item_id, "Item updated");
        Ok(stored)
    }

    async fn require_active(&self, currency_code: &str) -> Result<()> {
        if self.currencies.is_currency_active(currency_code).await? {
            Ok(())
        } else {
            Err(EconomyError::Validation(format!(
                "currency {currency_code} is not active"
            )))
        }
    }
}
