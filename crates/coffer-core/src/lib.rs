//! Core types and utilities for coffer.
//!
//! This crate provides the foundational types of the community economy:
//!
//! - **Identifiers**: `UserId`, `AccountId`, `ItemId`, `OwnershipId`, `BadgeId`, `TransactionId`
//! - **Currencies**: `Currency`, `CurrencyConfig`, `CurrencySnapshot`
//! - **Ledger**: `Account`, `BalanceDelta`, `Transaction`, `TransactionType`
//! - **Marketplace**: `Item`, `ItemKind`, `ConsumeType`, `Ownership`
//! - **Identity**: `Caller`, `Role`
//! - **Errors**: `EconomyError`, `Conflict`
//!
//! # Amounts
//!
//! All balances and prices are `i64` minor units. Floating point never touches
//! money; a currency's `precision` only affects display.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod currency;
pub mod error;
pub mod identity;
pub mod ids;
pub mod item;
pub mod ownership;
pub mod query;
pub mod transaction;

pub use account::{Account, BalanceDelta};
pub use currency::{format_amount, ConfigEntry, Currency, CurrencyConfig, CurrencySnapshot};
pub use error::{Conflict, EconomyError, Result};
pub use identity::{Caller, Role};
pub use ids::{AccountId, BadgeId, IdError, ItemId, OwnershipId, TransactionId, UserId};
pub use item::{ConsumeType, Item, ItemKind, ItemKindError, ItemType, ItemUpdate, NewItem};
pub use ownership::{NewOwnership, Ownership, OwnershipStatus};
pub use query::{ItemFilter, OwnershipFilter, Page, TransactionFilter};
pub use transaction::{Reference, Transaction, TransactionType, UnknownVariant};
