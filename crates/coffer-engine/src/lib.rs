//! Coffer economy engine.
//!
//! This crate provides the economic subsystem of a community platform:
//!
//! - **Ledger**: per-user, per-currency balances with grant, deduct and transfer
//! - **Currency registry**: currency lookups, configuration and display
//! - **Marketplace**: catalog browsing, purchase, gift, equip and consume
//! - **Admin**: privileged currency, ledger and catalog operations
//!
//! Every externally visible mutation runs inside exactly one unit of work of
//! the underlying [`Store`]; the engine holds no locks of its own.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> coffer_core::Result<()> {
//! use std::sync::Arc;
//!
//! use coffer_core::{Caller, Currency, Role, UserId};
//! use coffer_engine::{Economy, EngineConfig, GrantRequest, LogNotifier, UnavailableBadges};
//! use coffer_store::MemoryStore;
//!
//! let economy = Economy::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(UnavailableBadges),
//!     Arc::new(LogNotifier),
//!     EngineConfig::from_env(),
//! );
//! let operator = Caller::new(UserId::new(1), Role::Admin);
//!
//! economy
//!     .admin
//!     .upsert_currency(&operator, Currency::new("credits", "Credits", "◆"))
//!     .await?;
//! economy
//!     .admin
//!     .grant(&operator, GrantRequest::new(UserId::new(7), "credits", 50))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admin;
pub mod collaborators;
pub mod config;
pub mod currency;
pub mod ledger;
pub mod marketplace;

pub use admin::Admin;
pub use collaborators::{
    BadgeGrant, BadgeService, BadgeSource, CollaboratorError, LogNotifier, Notification, Notifier,
    UnavailableBadges,
};
pub use config::EngineConfig;
pub use currency::CurrencyRegistry;
pub use ledger::{
    AccountAudit, DeductRequest, GrantRequest, Ledger, TransferReceipt, TransferRequest,
    MIN_TRANSFER_KEY,
};
pub use marketplace::{Marketplace, PurchaseReceipt};

use std::sync::Arc;

use coffer_store::Store;

/// All engine components wired around one store.
#[derive(Clone)]
pub struct Economy {
    /// Balances and transfers.
    pub ledger: Ledger,
    /// Currency lookups.
    pub currencies: CurrencyRegistry,
    /// Catalog and inventories.
    pub marketplace: Marketplace,
    /// Privileged operations.
    pub admin: Admin,
}

impl Economy {
    /// Wire every component.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        badges: Arc<dyn BadgeService>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Ledger::new(Arc::clone(&store), config.clone());
        let currencies = CurrencyRegistry::new(Arc::clone(&store), config.currency_cache_ttl);
        let marketplace = Marketplace::new(Arc::clone(&store), badges, notifier, config);
        let admin = Admin::new(store, ledger.clone(), currencies.clone());

        Self {
            ledger,
            currencies,
            marketplace,
            admin,
        }
    }
}
