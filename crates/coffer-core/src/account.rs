//! Account types for coffer.
//!
//! An account is the balance of one user in one currency. Accounts are created
//! lazily the first time a ledger operation touches a `(user, currency)` pair and
//! are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, UserId};

/// A per-user, per-currency balance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Row id.
    pub id: AccountId,

    /// Owner of the balance.
    pub user_id: UserId,

    /// Currency the balance is held in.
    pub currency_code: String,

    /// Current balance in minor units. May be negative after an
    /// administrative correction.
    pub balance: i64,

    /// Lifetime amount credited.
    pub total_earned: i64,

    /// Lifetime amount debited.
    pub total_spent: i64,

    /// Frozen accounts accept credits but refuse ordinary debits.
    pub is_frozen: bool,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Check if the account can cover a debit of `amount` without going negative.
    #[must_use]
    pub fn has_sufficient_funds(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Balance as shown to the account holder.
    ///
    /// Negative balances from administrative corrections are clamped to zero here;
    /// the stored balance and the ledger keep the real value.
    #[must_use]
    pub fn display_balance(&self) -> i64 {
        self.balance.max(0)
    }
}

/// A change to an account's counters, applied by the store as one
/// server-evaluated update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceDelta {
    /// Signed change to `balance`.
    pub amount: i64,
    /// Increase of `total_earned`.
    pub earned: i64,
    /// Increase of `total_spent`.
    pub spent: i64,
    /// When set, the update only applies if the resulting balance is at least this value.
    pub floor: Option<i64>,
}

impl BalanceDelta {
    /// A credit of `amount` (must be positive).
    #[must_use]
    pub const fn credit(amount: i64) -> Self {
        Self {
            amount,
            earned: amount,
            spent: 0,
            floor: None,
        }
    }

    /// A debit of `amount` (must be positive) that may not take the balance below zero.
    #[must_use]
    pub const fn debit(amount: i64) -> Self {
        Self {
            amount: -amount,
            earned: 0,
            spent: amount,
            floor: Some(0),
        }
    }

    /// Drop the floor so the debit may produce a negative balance.
    #[must_use]
    pub const fn allow_negative(mut self) -> Self {
        self.floor = None;
        self
    }

    /// Apply the delta to an in-memory account, returning `false` (and leaving the
    /// account untouched) if the floor would be crossed or a counter would overflow.
    pub fn apply_to(&self, account: &mut Account) -> bool {
        let (Some(balance), Some(earned), Some(spent)) = (
            account.balance.checked_add(self.amount),
            account.total_earned.checked_add(self.earned),
            account.total_spent.checked_add(self.spent),
        ) else {
            return false;
        };

        if self.floor.is_some_and(|floor| balance < floor) {
            return false;
        }

        account.balance = balance;
        account.total_earned = earned;
        account.total_spent = spent;
        account.updated_at = Utc::now();
        true
    }
}
