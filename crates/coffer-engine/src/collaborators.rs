//! Interfaces to services outside the economy.
//!
//! The badge service is called synchronously inside a purchase unit of work, so
//! its failure aborts the purchase. The notifier is fire-and-forget: it runs on a
//! spawned task after commit and its failures are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{BadgeId, ItemId, UserId};

/// Errors reported by collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator is not configured or cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator rejected or failed the call.
    #[error("{0}")]
    Failed(String),
}

/// Why a badge was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BadgeSource {
    /// Bought by the holder.
    Purchase {
        /// Catalog entry that delivered the badge.
        item_id: ItemId,
    },
    /// Bought for the holder by someone else.
    Gift {
        /// Catalog entry that delivered the badge.
        item_id: ItemId,
        /// Who paid.
        from_user_id: UserId,
    },
}

/// A badge held by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeGrant {
    /// Holder.
    pub user_id: UserId,
    /// Badge held.
    pub badge_id: BadgeId,
    /// Origin of the grant.
    pub source: BadgeSource,
    /// When the badge was first granted.
    pub granted_at: DateTime<Utc>,
}

/// The badge-granting service.
#[async_trait]
pub trait BadgeService: Send + Sync {
    /// Whether `user_id` already holds `badge_id`.
    async fn has_badge(&self, user_id: UserId, badge_id: BadgeId)
        -> Result<bool, CollaboratorError>;

    /// Grant a badge. Idempotent: returns the existing grant if already held.
    async fn grant_badge(
        &self,
        user_id: UserId,
        badge_id: BadgeId,
        source: BadgeSource,
    ) -> Result<BadgeGrant, CollaboratorError>;
}

/// A message for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient.
    pub user_id: UserId,
    /// Notification type, e.g. `gift_received`.
    pub kind: String,
    /// Human-readable text.
    pub message: String,
    /// Structured context.
    pub metadata: serde_json::Value,
}

/// The notification delivery service.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification.
    async fn send(&self, notification: Notification) -> Result<(), CollaboratorError>;
}

/// Badge service for deployments without one. Every call fails, so badge
/// purchases roll back.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBadges;

#[async_trait]
impl BadgeService for UnavailableBadges {
    async fn has_badge(
        &self,
        _user_id: UserId,
        _badge_id: BadgeId,
    ) -> Result<bool, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no badge service configured".into()))
    }

    async fn grant_badge(
        &self,
        _user_id: UserId,
        _badge_id: BadgeId,
        _source: BadgeSource,
    ) -> Result<BadgeGrant, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no badge service configured".into()))
    }
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<(), CollaboratorError> {
        tracing::info!(
            user_id = %notification.user_id,
            kind = %notification.kind,
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}

/// Send a notification on a background task; failures are logged, never returned.
pub(crate) fn notify_in_background(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let user_id = notification.user_id;
        let kind = notification.kind.clone();
        if let Err(e) = notifier.send(notification).await {
            tracing::warn!(
                user_id = %user_id,
                kind = %kind,
                error = %e,
                "Failed to deliver notification"
            );
        }
    });
}
