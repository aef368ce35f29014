//! Ledger engine.
//!
//! Every operation here runs inside exactly one unit of work: the account
//! counters and the transaction row describing the change commit together or
//! not at all. Balance changes are applied as store-evaluated deltas guarded by
//! a floor, so the pre-checks below only decide which error to report; they
//! are not what keeps a balance from going negative under concurrency.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use coffer_core::{
    Account, AccountId, BalanceDelta, Conflict, EconomyError, Reference, Result, Transaction,
    TransactionFilter, TransactionType, UserId,
};
use coffer_store::{Store, UnitOfWork};

use crate::config::EngineConfig;
use crate::currency::load_snapshot;

/// Config key holding the smallest amount a transfer may move.
pub const MIN_TRANSFER_KEY: &str = "min_transfer";

/// Request to credit an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Receiving user.
    pub user_id: UserId,
    /// Currency to credit.
    pub currency_code: String,
    /// Amount in minor units; must be positive.
    pub amount: i64,
    /// Must be a credit type (default: `grant`).
    pub transaction_type: TransactionType,
    /// Originating event.
    #[serde(default)]
    pub reference: Option<Reference>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Structured context.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl GrantRequest {
    /// A plain `grant` of `amount`.
    #[must_use]
    pub fn new(user_id: UserId, currency_code: impl Into<String>, amount: i64) -> Self {
        Self {
            user_id,
            currency_code: currency_code.into(),
            amount,
            transaction_type: TransactionType::Grant,
            reference: None,
            description: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Record the credit under another type, e.g. `reward`.
    #[must_use]
    pub fn with_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = transaction_type;
        self
    }

    /// Attach the originating event.
    #[must_use]
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Request to debit an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductRequest {
    /// Paying user.
    pub user_id: UserId,
    /// Currency to debit.
    pub currency_code: String,
    /// Amount in minor units; must be positive.
    pub amount: i64,
    /// Must be a debit type (default: `deduct`).
    pub transaction_type: TransactionType,
    /// Originating event.
    #[serde(default)]
    pub reference: Option<Reference>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Structured context.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Skip the funds and frozen checks. Only set by the admin facade.
    #[serde(skip)]
    pub(crate) allow_negative: bool,
}

impl DeductRequest {
    /// A plain `deduct` of `amount`.
    #[must_use]
    pub fn new(user_id: UserId, currency_code: impl Into<String>, amount: i64) -> Self {
        Self {
            user_id,
            currency_code: currency_code.into(),
            amount,
            transaction_type: TransactionType::Deduct,
            reference: None,
            description: None,
            metadata: serde_json::Value::Null,
            allow_negative: false,
        }
    }

    /// Record the debit under another debit type.
    #[must_use]
    pub fn with_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = transaction_type;
        self
    }

    /// Attach the originating event.
    #[must_use]
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether this debit may take the balance below zero.
    #[must_use]
    pub const fn allows_negative(&self) -> bool {
        self.allow_negative
    }
}

/// Request to move funds between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Paying user.
    pub from_user_id: UserId,
    /// Receiving user.
    pub to_user_id: UserId,
    /// Currency moved.
    pub currency_code: String,
    /// Amount in minor units.
    pub amount: i64,
    /// Originating event, recorded on both sides.
    #[serde(default)]
    pub reference: Option<Reference>,
    /// Description, recorded on both sides.
    #[serde(default)]
    pub description: Option<String>,
}

impl TransferRequest {
    /// Transfer `amount` from one user to another.
    #[must_use]
    pub fn new(
        from_user_id: UserId,
        to_user_id: UserId,
        currency_code: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self {
            from_user_id,
            to_user_id,
            currency_code: currency_code.into(),
            amount,
            reference: None,
            description: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Both sides of a settled transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// `transfer_out` row of the payer.
    pub debit: Transaction,
    /// `transfer_in` row of the receiver.
    pub credit: Transaction,
}

/// Result of replaying an account's transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAudit {
    /// Audited account.
    pub account_id: AccountId,
    /// Stored balance.
    pub balance: i64,
    /// Sum of all transaction amounts.
    pub ledger_sum: i64,
    /// `balance_after` of the newest transaction.
    pub last_balance_after: Option<i64>,
    /// Number of transactions replayed.
    pub entries: usize,
}

impl AccountAudit {
    /// Whether the log reproduces the stored balance.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.ledger_sum == self.balance && self.last_balance_after.unwrap_or(0) == self.balance
    }
}

/// The ledger engine.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Get the account of `user_id` in `currency_code`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_or_create_account(
        &self,
        user_id: UserId,
        currency_code: &str,
    ) -> Result<Account> {
        validate_currency_code(currency_code)?;
        let mut unit = self.store.begin().await?;
        let account = resolve_account(unit.as_mut(), user_id, currency_code).await?;
        unit.commit().await?;
        Ok(account)
    }

    /// Credit an account.
    ///
    /// # Errors
    ///
    /// - `Validation` if the amount is not positive or the type is not a
    ///   standalone credit (grant, reward, refund)
    /// - `Storage` if the store fails
    pub async fn grant(&self, req: GrantRequest) -> Result<Transaction> {
        validate_amount(req.amount)?;
        validate_currency_code(&req.currency_code)?;
        if !req.transaction_type.is_direct_credit() {
            return Err(EconomyError::Validation(format!(
                "{} cannot be granted directly",
                req.transaction_type
            )));
        }

        let mut unit = self.store.begin().await?;
        let account = resolve_account(unit.as_mut(), req.user_id, &req.currency_code).await?;
        let updated = unit
            .apply_balance_delta(account.id, BalanceDelta::credit(req.amount))
            .await?
            .ok_or_else(|| EconomyError::Validation("credit would overflow the balance".into()))?;

        let tx = Transaction::record(&updated, req.amount, req.transaction_type)
            .with_reference(req.reference)
            .with_description(req.description)
            .with_metadata(req.metadata);
        unit.insert_transaction(&tx).await?;
        unit.commit().await?;

        tracing::info!(
            user_id = %req.user_id,
            currency = %req.currency_code,
            amount = req.amount,
            balance_after = tx.balance_after,
            transaction_type = %tx.transaction_type,
            "Credited account"
        );

        Ok(tx)
    }

    /// Debit an account.
    ///
    /// # Errors
    ///
    /// - `Validation` if the amount is not positive or the type is not `deduct`
    /// - `Conflict(AccountFrozen)` if the account is frozen
    /// - `InsufficientFunds` if the balance does not cover the amount
    pub async fn deduct(&self, req: DeductRequest) -> Result<Transaction> {
        validate_amount(req.amount)?;
        validate_currency_code(&req.currency_code)?;
        if !req.transaction_type.is_direct_debit() {
            return Err(EconomyError::Validation(format!(
                "{} cannot be deducted directly",
                req.transaction_type
            )));
        }

        let mut unit = self.store.begin().await?;
        let snapshot = load_snapshot(unit.as_mut(), &req.currency_code).await?;
        let account = resolve_account(unit.as_mut(), req.user_id, &req.currency_code).await?;

        let delta = if req.allow_negative {
            BalanceDelta::debit(req.amount).allow_negative()
        } else {
            if account.is_frozen {
                return Err(Conflict::AccountFrozen.into());
            }
            if !account.has_sufficient_funds(req.amount) {
                return Err(EconomyError::insufficient_funds(
                    &snapshot.code,
                    &snapshot.symbol,
                    account.balance,
                    req.amount,
                ));
            }
            BalanceDelta::debit(req.amount)
        };

        let updated = unit
            .apply_balance_delta(account.id, delta)
            .await?
            .ok_or_else(|| {
                EconomyError::insufficient_funds(
                    &snapshot.code,
                    &snapshot.symbol,
                    account.balance,
                    req.amount,
                )
            })?;

        let tx = Transaction::record(&updated, -req.amount, req.transaction_type)
            .with_reference(req.reference)
            .with_description(req.description)
            .with_metadata(req.metadata);
        unit.insert_transaction(&tx).await?;
        unit.commit().await?;

        if updated.balance < 0 {
            tracing::warn!(
                user_id = %req.user_id,
                currency = %req.currency_code,
                balance = updated.balance,
                "Account balance is negative after administrative deduct"
            );
        }
        tracing::info!(
            user_id = %req.user_id,
            currency = %req.currency_code,
            amount = req.amount,
            balance_after = tx.balance_after,
            transaction_type = %tx.transaction_type,
            "Debited account"
        );

        Ok(tx)
    }

    /// Move funds from one user to another.
    ///
    /// # Errors
    ///
    /// - `Validation` for a non-positive amount, a self-transfer, or an amount
    ///   below the currency's `min_transfer`
    /// - `Conflict(AccountFrozen)` if the payer's account is frozen
    /// - `InsufficientFunds` if the payer cannot cover the amount
    pub async fn transfer(&self, req: TransferRequest) -> Result<TransferReceipt> {
        validate_amount(req.amount)?;
        validate_currency_code(&req.currency_code)?;
        if req.from_user_id == req.to_user_id {
            return Err(EconomyError::Validation(
                "cannot transfer to the same user".into(),
            ));
        }

        let mut unit = self.store.begin().await?;
        let snapshot = load_snapshot(unit.as_mut(), &req.currency_code).await?;
        let min_transfer = snapshot.config.get_i64_or(MIN_TRANSFER_KEY, 1);
        if req.amount < min_transfer {
            return Err(EconomyError::Validation(format!(
                "transfer amount must be at least {}",
                snapshot.format_amount(min_transfer)
            )));
        }

        let source = resolve_account(unit.as_mut(), req.from_user_id, &req.currency_code).await?;
        let destination =
            resolve_account(unit.as_mut(), req.to_user_id, &req.currency_code).await?;

        if source.is_frozen {
            return Err(Conflict::AccountFrozen.into());
        }
        let insufficient = || {
            EconomyError::insufficient_funds(
                &snapshot.code,
                &snapshot.symbol,
                source.balance,
                req.amount,
            )
        };
        if !source.has_sufficient_funds(req.amount) {
            return Err(insufficient());
        }

        // Lock rows in id order so opposite transfers cannot deadlock.
        let (source_after, destination_after) = if source.id < destination.id {
            let s = unit
                .apply_balance_delta(source.id, BalanceDelta::debit(req.amount))
                .await?
                .ok_or_else(insufficient)?;
            let d = apply_credit(unit.as_mut(), destination.id, req.amount).await?;
            (s, d)
        } else {
            let d = apply_credit(unit.as_mut(), destination.id, req.amount).await?;
            let s = unit
                .apply_balance_delta(source.id, BalanceDelta::debit(req.amount))
                .await?
                .ok_or_else(insufficient)?;
            (s, d)
        };

        let debit = Transaction::record(&source_after, -req.amount, TransactionType::TransferOut)
            .with_related_user(req.to_user_id)
            .with_reference(req.reference.clone())
            .with_description(req.description.clone());
        let credit = Transaction::record(
            &destination_after,
            req.amount,
            TransactionType::TransferIn,
        )
        .with_related_user(req.from_user_id)
        .with_reference(req.reference)
        .with_description(req.description);

        unit.insert_transaction(&debit).await?;
        unit.insert_transaction(&credit).await?;
        unit.commit().await?;

        tracing::info!(
            from_user_id = %req.from_user_id,
            to_user_id = %req.to_user_id,
            currency = %req.currency_code,
            amount = req.amount,
            "Transfer settled"
        );

        Ok(TransferReceipt { debit, credit })
    }

    /// The account of `user_id` in `currency_code`, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn account(&self, user_id: UserId, currency_code: &str) -> Result<Option<Account>> {
        Ok(self.store.get_account(user_id, currency_code).await?)
    }

    /// All accounts of a user, ordered by currency code.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn balances(&self, user_id: UserId) -> Result<Vec<Account>> {
        Ok(self.store.list_accounts(user_id).await?)
    }

    /// Transaction history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn history(&self, mut filter: TransactionFilter) -> Result<Vec<Transaction>> {
        filter.page = self.config.page(filter.page);
        Ok(self.store.list_transactions(&filter).await?)
    }

    /// Replay an account's transactions and compare against its balance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account does not exist.
    pub async fn verify_account(&self, user_id: UserId, currency_code: &str) -> Result<AccountAudit> {
        let account = self
            .store
            .get_account(user_id, currency_code)
            .await?
            .ok_or_else(|| EconomyError::not_found("account", format!("{user_id}/{currency_code}")))?;
        let entries = self.store.account_transactions(account.id).await?;

        let audit = AccountAudit {
            account_id: account.id,
            balance: account.balance,
            ledger_sum: entries.iter().map(|tx| tx.amount).sum(),
            last_balance_after: entries.last().map(|tx| tx.balance_after),
            entries: entries.len(),
        };

        if !audit.is_consistent() {
            tracing::error!(
                user_id = %user_id,
                currency = %currency_code,
                balance = audit.balance,
                ledger_sum = audit.ledger_sum,
                "Ledger does not reproduce account balance"
            );
        }
        Ok(audit)
    }
}

/// Find the account for `(user_id, currency_code)` inside `unit`, creating it
/// if missing.
///
/// Creation is optimistic: a concurrent creator winning the insert surfaces as
/// a uniqueness conflict, after which the winner's row is selected.
pub(crate) async fn resolve_account(
    unit: &mut dyn UnitOfWork,
    user_id: UserId,
    currency_code: &str,
) -> Result<Account> {
    if let Some(account) = unit.find_account(user_id, currency_code).await? {
        return Ok(account);
    }

    match unit.insert_account(user_id, currency_code).await {
        Ok(account) => {
            tracing::debug!(user_id = %user_id, currency = %currency_code, "Created account");
            Ok(account)
        }
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(
                user_id = %user_id,
                currency = %currency_code,
                "Account created concurrently, re-selecting"
            );
            unit.find_account(user_id, currency_code)
                .await?
                .ok_or_else(|| {
                    EconomyError::Storage(format!(
                        "account {user_id}/{currency_code} conflicted but is not visible"
                    ))
                })
        }
        Err(e) => Err(e.into()),
    }
}

async fn apply_credit(
    unit: &mut dyn UnitOfWork,
    account_id: AccountId,
    amount: i64,
) -> Result<Account> {
    unit.apply_balance_delta(account_id, BalanceDelta::credit(amount))
        .await?
        .ok_or_else(|| EconomyError::Validation("credit would overflow the balance".into()))
}

pub(crate) fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(EconomyError::Validation("amount must be positive".into()));
    }
    Ok(())
}

fn validate_currency_code(code: &str) -> Result<()> {
    if code.trim().is_empty() {
        return Err(EconomyError::Validation("currency code must not be empty".into()));
    }
    Ok(())
}
