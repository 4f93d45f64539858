//! # Access Control Gate
//!
//! Role-based authorization for every privileged operation in the engine.
//! The gate is deliberately boring: a table of `(role, account)` grants
//! with optional expiry, checked lazily at use time. No sweeps, no
//! background jobs — an expired grant is simply treated as absent the next
//! time anyone asks.
//!
//! ## Separation of Duties
//!
//! The roles are intentionally non-overlapping:
//!
//! - [`Role::Operator`] submits execution batches but cannot change what
//!   fuses exist or what substrates are granted.
//! - [`Role::FuseManager`] configures the fuse/substrate/callback
//!   registries but cannot execute anything.
//! - [`Role::BalanceUpdater`] may trigger balance recomputation, nothing
//!   else.
//! - [`Role::Withdrawer`] may run the instant-withdrawal path on behalf of
//!   the redemption layer.
//! - [`Role::Admin`] administers all role grants and holds no operational
//!   power of its own.
//!
//! The account that can *use* fuses is never automatically the account
//! that can *add* them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::Address;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during authorization and role administration.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The caller does not hold the role required for the operation.
    #[error("unauthorized: account {account} does not hold role {role}")]
    Unauthorized {
        /// The role that was required.
        role: Role,
        /// The account that attempted the operation.
        account: Address,
    },

    /// Attempted to revoke a grant that does not exist (or already expired).
    #[error("no active grant of role {role} for account {account}")]
    GrantNotFound {
        /// The role named in the revocation.
        role: Role,
        /// The account named in the revocation.
        account: Address,
    },

    /// Revoking this grant would leave the vault without any admin,
    /// permanently locking role administration.
    #[error("cannot revoke the last active admin grant")]
    LastAdmin,

    /// The supplied expiry is already in the past.
    #[error("grant expiry {expires_at} is in the past")]
    ExpiryInPast {
        /// The rejected expiry timestamp.
        expires_at: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The privileged roles recognized by the engine.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    /// Administers role grants for every role, including itself.
    Admin,
    /// Submits execution batches to the dispatcher.
    Operator,
    /// Configures fuses, substrates, dependency graphs, and callback
    /// handlers.
    FuseManager,
    /// Triggers explicit balance recomputation.
    BalanceUpdater,
    /// Runs the instant-withdrawal path for the redemption layer.
    Withdrawer,
}

impl Role {
    /// The role whose holders may grant and revoke this role.
    ///
    /// Flat hierarchy: `Admin` administers everything, including itself.
    pub fn admin_role(self) -> Role {
        Role::Admin
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "Admin"),
            Role::Operator => write!(f, "Operator"),
            Role::FuseManager => write!(f, "FuseManager"),
            Role::BalanceUpdater => write!(f, "BalanceUpdater"),
            Role::Withdrawer => write!(f, "Withdrawer"),
        }
    }
}

// ---------------------------------------------------------------------------
// Grants
// ---------------------------------------------------------------------------

/// A single role grant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleGrant {
    /// When the grant stops being valid. `None` means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the grant was created.
    pub granted_at: DateTime<Utc>,
    /// The admin account that created the grant.
    pub granted_by: Address,
}

impl RoleGrant {
    /// Returns `true` if the grant is valid at the given instant.
    fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// AccessControlGate
// ---------------------------------------------------------------------------

/// The role-grant table consulted by every other component.
///
/// Nested map: role → account → grant. Expired grants stay in the table
/// until explicitly revoked or overwritten; they are filtered out at read
/// time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessControlGate {
    grants: BTreeMap<Role, BTreeMap<Address, RoleGrant>>,
}

impl AccessControlGate {
    /// Creates a gate with a single bootstrap admin.
    ///
    /// The bootstrap grant has no expiry and records itself as its own
    /// grantor — someone has to go first.
    pub fn new(root_admin: Address) -> Self {
        let mut gate = Self {
            grants: BTreeMap::new(),
        };
        gate.grants.entry(Role::Admin).or_default().insert(
            root_admin,
            RoleGrant {
                expires_at: None,
                granted_at: Utc::now(),
                granted_by: root_admin,
            },
        );
        gate
    }

    /// Returns `true` if `account` currently holds `role`.
    ///
    /// Lazy expiry: an expired grant reads as absent.
    pub fn has_role(&self, role: Role, account: Address) -> bool {
        self.grants
            .get(&role)
            .and_then(|by_account| by_account.get(&account))
            .map(|grant| grant.is_active_at(Utc::now()))
            .unwrap_or(false)
    }

    /// Fails with [`AccessError::Unauthorized`] unless `account` holds
    /// `role`. This is the check every privileged entry point runs first.
    pub fn ensure(&self, role: Role, account: Address) -> Result<(), AccessError> {
        if self.has_role(role, account) {
            Ok(())
        } else {
            Err(AccessError::Unauthorized { role, account })
        }
    }

    /// Grants `role` to `account`, optionally expiring at `expires_at`.
    ///
    /// The caller must hold the role's admin role. Re-granting overwrites
    /// the existing grant (useful for extending an expiry).
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Unauthorized`] if the caller lacks the admin
    /// role, or [`AccessError::ExpiryInPast`] for an already-expired grant.
    pub fn grant(
        &mut self,
        caller: Address,
        role: Role,
        account: Address,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AccessError> {
        self.ensure(role.admin_role(), caller)?;

        if let Some(expiry) = expires_at {
            if expiry <= Utc::now() {
                return Err(AccessError::ExpiryInPast { expires_at: expiry });
            }
        }

        self.grants.entry(role).or_default().insert(
            account,
            RoleGrant {
                expires_at,
                granted_at: Utc::now(),
                granted_by: caller,
            },
        );
        info!(%role, %account, %caller, "role granted");
        Ok(())
    }

    /// Revokes `role` from `account`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Unauthorized`] if the caller lacks the admin
    /// role, [`AccessError::GrantNotFound`] if there is nothing to revoke,
    /// or [`AccessError::LastAdmin`] if the revocation would remove the
    /// final active admin.
    pub fn revoke(
        &mut self,
        caller: Address,
        role: Role,
        account: Address,
    ) -> Result<(), AccessError> {
        self.ensure(role.admin_role(), caller)?;

        // Expired grants are still revocable (table cleanup), but only an
        // active grant counts against the last-admin guard.
        let target_active = match self.grants.get(&role).and_then(|m| m.get(&account)) {
            Some(grant) => grant.is_active_at(Utc::now()),
            None => return Err(AccessError::GrantNotFound { role, account }),
        };

        if role == Role::Admin && target_active && self.active_count(Role::Admin) <= 1 {
            return Err(AccessError::LastAdmin);
        }

        if let Some(by_account) = self.grants.get_mut(&role) {
            by_account.remove(&account);
        }
        info!(%role, %account, %caller, "role revoked");
        Ok(())
    }

    /// Number of currently active (non-expired) grants of `role`.
    pub fn active_count(&self, role: Role) -> usize {
        let now = Utc::now();
        self.grants
            .get(&role)
            .map(|by_account| {
                by_account
                    .values()
                    .filter(|grant| grant.is_active_at(now))
                    .count()
            })
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
