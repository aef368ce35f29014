//! Currency registry.
//!
//! Read-mostly lookups over the currency table. Display names are served from a
//! short-TTL cache since they are read on every rendered balance; everything
//! else goes to the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use coffer_core::currency::MAX_PRECISION;
use coffer_core::{format_amount, Currency, CurrencySnapshot, EconomyError, Result};
use coffer_store::{Store, UnitOfWork};

/// Cached display name.
struct CachedName {
    /// `None` when the code is not registered.
    name: Option<String>,
    fetched_at: Instant,
}

/// Currency lookups and configuration.
#[derive(Clone)]
pub struct CurrencyRegistry {
    store: Arc<dyn Store>,
    names: Arc<RwLock<HashMap<String, CachedName>>>,
    ttl: Duration,
}

impl CurrencyRegistry {
    /// Create a registry over `store` with the given display-name cache TTL.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            names: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Get a currency by code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the code is not registered.
    pub async fn get(&self, code: &str) -> Result<Currency> {
        self.store
            .get_currency(code)
            .await?
            .ok_or_else(|| EconomyError::not_found("currency", code))
    }

    /// List registered currencies ordered by code.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self, active_only: bool) -> Result<Vec<Currency>> {
        Ok(self.store.list_currencies(active_only).await?)
    }

    /// Whether the currency exists and may take part in new operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_currency_active(&self, code: &str) -> Result<bool> {
        Ok(self
            .store
            .get_currency(code)
            .await?
            .is_some_and(|c| c.is_active))
    }

    /// Read an integer setting of a currency.
    ///
    /// Falls back to `default` when the currency, the key, or a well-formed
    /// value is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_currency_config(&self, code: &str, key: &str, default: i64) -> Result<i64> {
        let Some(currency) = self.store.get_currency(code).await? else {
            return Ok(default);
        };
        match currency.config.get_i64(key) {
            Some(value) => Ok(value),
            None => {
                if currency.config.entry(key).is_some() {
                    tracing::warn!(
                        currency = %code,
                        key = %key,
                        "Malformed currency setting, using default"
                    );
                }
                Ok(default)
            }
        }
    }

    /// Human-readable name of a currency; the code itself when unregistered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails on a cache miss.
    pub async fn display_name(&self, code: &str) -> Result<String> {
        {
            let cache = self.names.read().await;
            if let Some(entry) = cache.get(code) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.name.clone().unwrap_or_else(|| code.to_string()));
                }
            }
        }

        let name = self.store.get_currency(code).await?.map(|c| c.name);
        tracing::debug!(currency = %code, "Refreshed currency display name");

        let mut cache = self.names.write().await;
        cache.insert(
            code.to_string(),
            CachedName {
                name: name.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(name.unwrap_or_else(|| code.to_string()))
    }

    /// Format an amount of minor units with the currency's precision and symbol.
    /// Unregistered codes format as a bare integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn format_amount(&self, code: &str, amount: i64) -> Result<String> {
        Ok(match self.store.get_currency(code).await? {
            Some(currency) => currency.format_amount(amount),
            None => format_amount(amount, 0, ""),
        })
    }

    /// Create or update a currency by code.
    pub(crate) async fn upsert(&self, currency: &Currency) -> Result<Currency> {
        let code = currency.code.trim();
        if code.is_empty() || code != currency.code {
            return Err(EconomyError::Validation(
                "currency code must be non-empty without surrounding whitespace".into(),
            ));
        }
        if currency.name.trim().is_empty() {
            return Err(EconomyError::Validation("currency name must not be empty".into()));
        }
        if currency.precision > MAX_PRECISION {
            return Err(EconomyError::Validation(format!(
                "precision must be at most {MAX_PRECISION}"
            )));
        }

        let mut unit = self.store.begin().await?;
        let stored = unit.upsert_currency(currency).await?;
        unit.commit().await?;

        self.names.write().await.remove(&stored.code);
        tracing::info!(
            currency = %stored.code,
            is_active = stored.is_active,
            "Currency saved"
        );
        Ok(stored)
    }
}

/// Load the currency view one unit of work computes with.
pub(crate) async fn load_snapshot(
    unit: &mut dyn UnitOfWork,
    code: &str,
) -> Result<CurrencySnapshot> {
    Ok(unit
        .find_currency(code)
        .await?
        .map_or_else(|| CurrencySnapshot::unregistered(code), |c| c.snapshot()))
}
