//! Ledger transaction types for coffer.
//!
//! Every change to an account balance writes exactly one transaction row
//! carrying the signed amount and the resulting balance. Rows are immutable
//! once written, so replaying an account's rows in creation order and summing
//! `amount` reproduces its current balance.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Account, AccountId, TransactionId, UserId};

/// A write-once ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// The account that was affected.
    pub account_id: AccountId,

    /// Currency of the account.
    pub currency_code: String,

    /// Signed amount in minor units. Positive = credit, negative = debit.
    pub amount: i64,

    /// Balance of the account after this entry.
    pub balance_after: i64,

    /// What kind of event produced the entry.
    pub transaction_type: TransactionType,

    /// Pointer to the originating event, if any.
    pub reference: Option<Reference>,

    /// Counterparty for transfers and gifts.
    pub related_user_id: Option<UserId>,

    /// Human-readable description.
    pub description: Option<String>,

    /// Additional structured context.
    pub metadata: serde_json::Value,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Record `amount` against `account`, whose counters already include it.
    #[must_use]
    pub fn record(account: &Account, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id: account.user_id,
            account_id: account.id,
            currency_code: account.currency_code.clone(),
            amount,
            balance_after: account.balance,
            transaction_type,
            reference: None,
            related_user_id: None,
            description: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Attach the originating event.
    #[must_use]
    pub fn with_reference(mut self, reference: Option<Reference>) -> Self {
        self.reference = reference;
        self
    }

    /// Attach the counterparty.
    #[must_use]
    pub fn with_related_user(mut self, user_id: UserId) -> Self {
        self.related_user_id = Some(user_id);
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Polymorphic pointer to the event that caused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Kind of the referenced entity (e.g. `item`, `post`, `event`).
    pub kind: String,
    /// Identifier of the referenced entity.
    pub id: String,
}

impl Reference {
    /// Build a reference.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// Type of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits granted by an operator or a platform process.
    Grant,

    /// Credits removed by an operator or a platform process.
    Deduct,

    /// Credits earned through platform activity.
    Reward,

    /// Refund of an earlier debit.
    Refund,

    /// Outgoing side of a user-to-user transfer.
    TransferOut,

    /// Incoming side of a user-to-user transfer.
    TransferIn,

    /// Marketplace purchase for oneself.
    ShopPurchase,

    /// Marketplace purchase delivered to another user.
    ShopGift,
}

impl TransactionType {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Deduct => "deduct",
            Self::Reward => "reward",
            Self::Refund => "refund",
            Self::TransferOut => "transfer_out",
            Self::TransferIn => "transfer_in",
            Self::ShopPurchase => "shop_purchase",
            Self::ShopGift => "shop_gift",
        }
    }

    /// Check if this transaction type adds funds.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::Grant | Self::Reward | Self::Refund | Self::TransferIn
        )
    }

    /// Check if this transaction type removes funds.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(
            self,
            Self::Deduct | Self::TransferOut | Self::ShopPurchase | Self::ShopGift
        )
    }

    /// Credit types that may be written on their own, without a transfer
    /// counterpart.
    #[must_use]
    pub const fn is_direct_credit(&self) -> bool {
        matches!(self, Self::Grant | Self::Reward | Self::Refund)
    }

    /// Debit types that may be written on their own, without a transfer
    /// counterpart or a purchased item.
    #[must_use]
    pub const fn is_direct_debit(&self) -> bool {
        matches!(self, Self::Deduct)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "grant" => Self::Grant,
            "deduct" => Self::Deduct,
            "reward" => Self::Reward,
            "refund" => Self::Refund,
            "transfer_out" => Self::TransferOut,
            "transfer_in" => Self::TransferIn,
            "shop_purchase" => Self::ShopPurchase,
            "shop_gift" => Self::ShopGift,
            other => return Err(UnknownVariant::new("transaction type", other)),
        })
    }
}

/// A stored string did not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
