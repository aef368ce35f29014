//! Currency definitions.
//!
//! Amounts everywhere in coffer are `i64` minor units. A currency's `precision`
//! says how many of the trailing digits are fractional when the amount is shown
//! to a person; it never changes arithmetic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest precision accepted for a currency.
pub const MAX_PRECISION: u8 = 8;

/// A currency known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    /// Unique currency code (e.g. `credits`).
    pub code: String,

    /// Human-readable name.
    pub name: String,

    /// Display symbol, appended to formatted amounts.
    pub symbol: String,

    /// Number of fractional digits used for display.
    pub precision: u8,

    /// Inactive currencies may not take part in new operations.
    pub is_active: bool,

    /// Per-currency numeric/string settings.
    pub config: CurrencyConfig,

    /// When the currency was first registered.
    pub created_at: DateTime<Utc>,

    /// When the currency was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Currency {
    /// Create an active currency with an empty configuration map.
    #[must_use]
    pub fn new(code: impl Into<String>, name: impl Into<String>, symbol: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            code: code.into(),
            name: name.into(),
            symbol: symbol.into(),
            precision: 0,
            is_active: true,
            config: CurrencyConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Format an amount of minor units for display, e.g. `12.50 ◆`.
    #[must_use]
    pub fn format_amount(&self, amount: i64) -> String {
        format_amount(amount, self.precision, &self.symbol)
    }

    /// Freeze the parts of this currency a unit of work depends on.
    #[must_use]
    pub fn snapshot(&self) -> CurrencySnapshot {
        CurrencySnapshot {
            code: self.code.clone(),
            symbol: self.symbol.clone(),
            precision: self.precision,
            is_active: self.is_active,
            config: self.config.clone(),
        }
    }
}

/// Format `amount` minor units with `precision` fractional digits and a trailing symbol.
#[must_use]
pub fn format_amount(amount: i64, precision: u8, symbol: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let magnitude = amount.unsigned_abs();
    let digits = if precision == 0 {
        magnitude.to_string()
    } else {
        let scale = 10_u64.pow(u32::from(precision.min(MAX_PRECISION)));
        format!(
            "{}.{:0width$}",
            magnitude / scale,
            magnitude % scale,
            width = usize::from(precision.min(MAX_PRECISION))
        )
    };

    if symbol.is_empty() {
        format!("{sign}{digits}")
    } else {
        format!("{sign}{digits} {symbol}")
    }
}

/// One configuration entry: a leaf value plus an operator-facing description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Leaf value; expected to be a number or a string.
    pub value: serde_json::Value,

    /// What the setting controls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-currency configuration map of `key -> {value, description}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyConfig(BTreeMap<String, ConfigEntry>);

impl CurrencyConfig {
    /// Insert or replace an entry.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        description: Option<String>,
    ) {
        self.0
            .insert(key.into(), ConfigEntry { value, description });
    }

    /// Look up a raw entry.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&ConfigEntry> {
        self.0.get(key)
    }

    /// Read an integer setting.
    ///
    /// Numbers and numeric strings are accepted. Returns `None` when the key is
    /// absent or the value is malformed.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match &self.entry(key)?.value {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Read an integer setting, falling back to `default` when absent or malformed.
    #[must_use]
    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    /// Read a string setting. Numbers are rendered to strings.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match &self.entry(key)?.value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigEntry)> {
        self.0.iter()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Immutable view of a currency taken at the start of a unit of work.
///
/// All purchase and transfer math inside one unit reads from the same snapshot,
/// even if an operator edits the currency concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencySnapshot {
    /// Currency code.
    pub code: String,
    /// Display symbol.
    pub symbol: String,
    /// Display precision.
    pub precision: u8,
    /// Active flag at snapshot time.
    pub is_active: bool,
    /// Configuration at snapshot time.
    pub config: CurrencyConfig,
}

impl CurrencySnapshot {
    /// Snapshot for a currency code with no registry row: no symbol, no settings.
    #[must_use]
    pub fn unregistered(code: &str) -> Self {
        Self {
            code: code.to_string(),
            symbol: String::new(),
            precision: 0,
            is_active: true,
            config: CurrencyConfig::default(),
        }
    }

    /// Format an amount for display.
    #[must_use]
    pub fn format_amount(&self, amount: i64) -> String {
        format_amount(amount, self.precision, &self.symbol)
    }
}
