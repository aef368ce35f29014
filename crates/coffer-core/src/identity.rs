//! Caller identity supplied by the platform's authentication layer.

use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, Result};
use crate::UserId;

/// Platform role of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular community member.
    Member,
    /// Community moderator. Not privileged for economic operations.
    Moderator,
    /// Platform administrator.
    Admin,
}

/// The authenticated user behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Who is calling.
    pub user_id: UserId,
    /// Their role.
    pub role: Role,
}

impl Caller {
    /// A caller with the given role.
    #[must_use]
    pub const fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Whether the caller may run administrative ledger and marketplace operations.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Fail with [`EconomyError::Forbidden`] unless the caller is privileged.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-admin callers.
    pub fn require_privileged(&self) -> Result<()> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(EconomyError::Forbidden)
        }
    }
}
