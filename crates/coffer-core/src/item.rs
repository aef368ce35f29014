//! Marketplace catalog types.
//!
//! Item metadata arrives from storage as free-form JSON keyed by the item's type
//! string. It is decoded exactly once, at the storage boundary, into [`ItemKind`];
//! code past that point matches on the variant instead of poking at JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, Result};
use crate::transaction::UnknownVariant;
use crate::{BadgeId, ItemId};

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Row id.
    pub id: ItemId,
    /// Display name.
    pub name: String,
    /// Optional long description.
    pub description: Option<String>,
    /// Unit price in minor units of `currency_code`.
    pub price: i64,
    /// Currency the price is denominated in.
    pub currency_code: String,
    /// Type plus type-specific metadata.
    pub kind: ItemKind,
    /// How ownership of the item accumulates.
    pub consume_type: ConsumeType,
    /// Units left for sale; `None` means unlimited.
    pub stock: Option<i64>,
    /// Most units one user may hold; `None` means unlimited.
    pub max_own: Option<i64>,
    /// For subscriptions: days of validity added per unit purchased.
    pub duration_days: Option<i32>,
    /// Inactive items cannot be purchased.
    pub is_active: bool,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// When the item was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// The item's type.
    #[must_use]
    pub fn item_type(&self) -> ItemType {
        self.kind.item_type()
    }

    /// Badge granted by purchasing this item, if it is a badge.
    #[must_use]
    pub fn badge_id(&self) -> Option<BadgeId> {
        match self.kind {
            ItemKind::Badge { badge_id } => Some(badge_id),
            _ => None,
        }
    }
}

/// Item type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Decorative frame around the avatar. An equip slot.
    AvatarFrame,
    /// Purchasable badge, delivered by the badge collaborator.
    Badge,
    /// Anything else.
    Generic,
}

impl ItemType {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AvatarFrame => "avatar_frame",
            Self::Badge => "badge",
            Self::Generic => "generic",
        }
    }

    /// Whether at most one owned item of this type may be equipped per user.
    #[must_use]
    pub const fn is_equip_slot(&self) -> bool {
        matches!(self, Self::AvatarFrame)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "avatar_frame" => Ok(Self::AvatarFrame),
            "badge" => Ok(Self::Badge),
            "generic" => Ok(Self::Generic),
            other => Err(UnknownVariant::new("item type", other)),
        }
    }
}

/// Item type together with its validated metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    /// Avatar frame.
    AvatarFrame {
        /// Frame artwork.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
    },
    /// Badge purchase.
    Badge {
        /// The badge granted on purchase.
        badge_id: BadgeId,
    },
    /// Generic item with free-form attributes.
    Generic {
        /// Opaque attributes, passed through untouched.
        #[serde(default)]
        attributes: serde_json::Value,
    },
}

impl ItemKind {
    /// The type tag of this kind.
    #[must_use]
    pub const fn item_type(&self) -> ItemType {
        match self {
            Self::AvatarFrame { .. } => ItemType::AvatarFrame,
            Self::Badge { .. } => ItemType::Badge,
            Self::Generic { .. } => ItemType::Generic,
        }
    }

    /// Decode stored `(type, metadata)` columns.
    ///
    /// The metadata may be an object, `null`, or a JSON string holding an
    /// encoded object (legacy double encoding).
    ///
    /// # Errors
    ///
    /// Returns [`ItemKindError`] if the type is unknown or the metadata does not
    /// fit it.
    pub fn decode(
        item_type: &str,
        metadata: serde_json::Value,
    ) -> std::result::Result<Self, ItemKindError> {
        let item_type: ItemType = item_type.parse()?;
        let metadata = match metadata {
            serde_json::Value::String(encoded) => serde_json::from_str(&encoded)
                .map_err(|e| ItemKindError::Metadata(e.to_string()))?,
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };

        match item_type {
            ItemType::AvatarFrame => {
                let image_url = metadata
                    .get("image_url")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                Ok(Self::AvatarFrame { image_url })
            }
            ItemType::Badge => {
                let badge_id = match metadata.get("badge_id") {
                    Some(serde_json::Value::Number(n)) => n.as_i64(),
                    Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(|| ItemKindError::Metadata("badge item without badge_id".into()))?;
                Ok(Self::Badge {
                    badge_id: BadgeId::new(badge_id),
                })
            }
            ItemType::Generic => Ok(Self::Generic {
                attributes: metadata
                    .get("attributes")
                    .cloned()
                    .unwrap_or(metadata),
            }),
        }
    }

    /// Metadata column contents for this kind (the type goes in its own column).
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        match self {
            Self::AvatarFrame { image_url } => match image_url {
                Some(url) => serde_json::json!({ "image_url": url }),
                None => serde_json::json!({}),
            },
            Self::Badge { badge_id } => serde_json::json!({ "badge_id": badge_id }),
            Self::Generic { attributes } => serde_json::json!({ "attributes": attributes }),
        }
    }
}

/// Stored item metadata could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemKindError {
    /// Type column holds an unknown value.
    #[error(transparent)]
    UnknownType(#[from] UnknownVariant),

    /// Metadata does not match the type.
    #[error("invalid item metadata: {0}")]
    Metadata(String),
}

/// How repeated purchases of an item accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeType {
    /// Owned at most once per user.
    NonConsumable,
    /// Quantity accumulates and is used up.
    Consumable,
    /// Quantity accumulates; each unit extends validity.
    Subscription,
}

impl ConsumeType {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NonConsumable => "non_consumable",
            Self::Consumable => "consumable",
            Self::Subscription => "subscription",
        }
    }

    /// Whether owned quantity accumulates across purchases.
    #[must_use]
    pub const fn accumulates(&self) -> bool {
        !matches!(self, Self::NonConsumable)
    }
}

impl fmt::Display for ConsumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumeType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "non_consumable" => Ok(Self::NonConsumable),
            "consumable" => Ok(Self::Consumable),
            "subscription" => Ok(Self::Subscription),
            other => Err(UnknownVariant::new("consume type", other)),
        }
    }
}

/// Fields for creating a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    /// Display name.
    pub name: String,
    /// Optional long description.
    #[serde(default)]
    pub description: Option<String>,
    /// Unit price in minor units.
    pub price: i64,
    /// Currency of the price.
    pub currency_code: String,
    /// Type and metadata.
    pub kind: ItemKind,
    /// Accumulation policy.
    pub consume_type: ConsumeType,
    /// Initial stock; `None` for unlimited.
    #[serde(default)]
    pub stock: Option<i64>,
    /// Per-user cap; `None` for unlimited.
    #[serde(default)]
    pub max_own: Option<i64>,
    /// Validity per unit for subscriptions.
    #[serde(default)]
    pub duration_days: Option<i32>,
    /// Whether the item is on sale.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl NewItem {
    /// Minimal constructor: active, unlimited stock, no cap.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        price: i64,
        currency_code: impl Into<String>,
        kind: ItemKind,
        consume_type: ConsumeType,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            price,
            currency_code: currency_code.into(),
            kind,
            consume_type,
            stock: None,
            max_own: None,
            duration_days: None,
            is_active: true,
        }
    }

    /// Check catalog invariants.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::Validation`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        validate_catalog_fields(
            &self.name,
            self.price,
            self.stock,
            self.max_own,
            self.duration_days,
            self.consume_type,
        )
    }

    /// Materialize the row once the store has assigned an id.
    #[must_use]
    pub fn into_item(self, id: ItemId) -> Item {
        let now = Utc::now();
        Item {
            id,
            name: self.name,
            description: self.description,
            price: self.price,
            currency_code: self.currency_code,
            kind: self.kind,
            consume_type: self.consume_type,
            stock: self.stock,
            max_own: self.max_own,
            duration_days: self.duration_days,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a catalog entry. `None` leaves a field unchanged; the
/// nested options of `stock`/`max_own` distinguish "set unlimited" from "keep".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<Option<String>>,
    /// New price.
    #[serde(default)]
    pub price: Option<i64>,
    /// New stock.
    #[serde(default)]
    pub stock: Option<Option<i64>>,
    /// New per-user cap.
    #[serde(default)]
    pub max_own: Option<Option<i64>>,
    /// New active flag.
    #[serde(default)]
    pub is_active: Option<bool>,
    /// New type/metadata.
    #[serde(default)]
    pub kind: Option<ItemKind>,
}

impl ItemUpdate {
    /// Apply to `item` and re-check catalog invariants.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::Validation`] if the updated item is invalid; `item`
    /// is left untouched in that case.
    pub fn apply(self, item: &Item) -> Result<Item> {
        let mut next = item.clone();
        if let Some(name) = self.name {
            next.name = name;
        }
        if let Some(description) = self.description {
            next.description = description;
        }
        if let Some(price) = self.price {
            next.price = price;
        }
        if let Some(stock) = self.stock {
            next.stock = stock;
        }
        if let Some(max_own) = self.max_own {
            next.max_own = max_own;
        }
        if let Some(is_active) = self.is_active {
            next.is_active = is_active;
        }
        if let Some(kind) = self.kind {
            // Inventory rows carry the item type, so it is fixed at creation.
            if kind.item_type() != item.item_type() {
                return Err(EconomyError::Validation("item type cannot change".into()));
            }
            next.kind = kind;
        }

        validate_catalog_fields(
            &next.name,
            next.price,
            next.stock,
            next.max_own,
            next.duration_days,
            next.consume_type,
        )?;
        next.updated_at = Utc::now();
        Ok(next)
    }
}

fn validate_catalog_fields(
    name: &str,
    price: i64,
    stock: Option<i64>,
    max_own: Option<i64>,
    duration_days: Option<i32>,
    consume_type: ConsumeType,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EconomyError::Validation("item name must not be empty".into()));
    }
    if price < 0 {
        return Err(EconomyError::Validation("price must not be negative".into()));
    }
    if stock.is_some_and(|s| s < 0) {
        return Err(EconomyError::Validation("stock must not be negative".into()));
    }
    if max_own.is_some_and(|m| m < 1) {
        return Err(EconomyError::Validation("max_own must be at least 1".into()));
    }
    match (consume_type, duration_days) {
        (ConsumeType::Subscription, Some(days)) if days <= 0 => Err(EconomyError::Validation(
            "duration_days must be positive".into(),
        )),
        (ConsumeType::NonConsumable | ConsumeType::Consumable, Some(_)) => Err(
            EconomyError::Validation("duration_days only applies to subscriptions".into()),
        ),
        _ => Ok(()),
    }
}
