//! # Fuse Registry
//!
//! Maps approved strategy-module addresses to their enabled state,
//! tracks which module computes each market's balance, and records which
//! modules (and in what order) the instant-withdrawal path may use.
//!
//! Module objects are trait objects bound at boot by governance; the
//! registry stores no serialized form of them. Everything else about a
//! fuse — its market, its address — the module reports about itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::{ActionFuse, BalanceFuse};
use crate::types::{Address, MarketId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during fuse registration and lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The action named a fuse that is not registered or is disabled.
    /// Fatal to the whole batch.
    #[error("unsupported fuse {0}")]
    UnsupportedFuse(Address),

    /// Attempted to register a fuse address twice.
    #[error("fuse {0} is already registered")]
    FuseAlreadyRegistered(Address),

    /// Attempted to configure a fuse that was never registered.
    #[error("fuse {0} is not registered")]
    FuseNotRegistered(Address),

    /// The market already has an active balance fuse; remove it first.
    #[error("{market} already has balance fuse {existing}")]
    BalanceFuseAlreadySet {
        /// The market in question.
        market: MarketId,
        /// Address of the currently active balance fuse.
        existing: Address,
    },

    /// The market has no active balance fuse.
    #[error("{0} has no balance fuse")]
    BalanceFuseNotSet(MarketId),

    /// Balance-fuse removal named an address that is not the active one.
    #[error("{market} balance fuse is {actual}, not {expected}")]
    BalanceFuseMismatch {
        /// The market in question.
        market: MarketId,
        /// Address the caller expected to remove.
        expected: Address,
        /// Address actually active.
        actual: Address,
    },

    /// An instant-withdrawal entry names a fuse that is not flagged
    /// eligible for that path.
    #[error("fuse {0} is not eligible for instant withdrawal")]
    NotInstantEligible(Address),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Registry record for one action fuse.
struct FuseEntry {
    module: Arc<dyn ActionFuse>,
    enabled: bool,
    instant_withdrawal: bool,
    added_at: DateTime<Utc>,
}

/// One step of the pre-configured instant-withdrawal order: which fuse to
/// exit through and the static tail of its payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstantWithdrawalEntry {
    /// The fuse to call `exit` on.
    pub fuse: Address,
    /// Static parameters appended after the amount prefix at call time.
    pub params: Vec<u8>,
}

// ---------------------------------------------------------------------------
// FuseRegistry
// ---------------------------------------------------------------------------

/// The approval registry consulted on every dispatched action.
#[derive(Default)]
pub struct FuseRegistry {
    fuses: BTreeMap<Address, FuseEntry>,
    balance_fuses: BTreeMap<MarketId, Arc<dyn BalanceFuse>>,
    instant_withdrawal_order: Vec<InstantWithdrawalEntry>,
}

impl FuseRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action fuse, enabled immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::FuseAlreadyRegistered`] if the address is
    /// taken.
    pub fn add(&mut self, module: Arc<dyn ActionFuse>) -> Result<(), RegistryError> {
        let address = module.address();
        if self.fuses.contains_key(&address) {
            return Err(RegistryError::FuseAlreadyRegistered(address));
        }
        let market = module.market();
        self.fuses.insert(
            address,
            FuseEntry {
                module,
                enabled: true,
                instant_withdrawal: false,
                added_at: Utc::now(),
            },
        );
        info!(%address, %market, "fuse registered");
        Ok(())
    }

    /// Deregisters a fuse entirely, returning the module.
    ///
    /// No open-position check happens here — see the governance notes on
    /// [`Vault::remove_fuse`](crate::vault::Vault::remove_fuse).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::FuseNotRegistered`] if the address is
    /// unknown.
    pub fn remove(&mut self, address: Address) -> Result<Arc<dyn ActionFuse>, RegistryError> {
        let entry = self
            .fuses
            .remove(&address)
            .ok_or(RegistryError::FuseNotRegistered(address))?;
        self.instant_withdrawal_order
            .retain(|step| step.fuse != address);
        info!(%address, "fuse removed");
        Ok(entry.module)
    }

    /// Enables or disables a registered fuse without removing it.
    ///
    /// A disabled fuse fails every action naming it, exactly like an
    /// unregistered one.
    pub fn set_enabled(&mut self, address: Address, enabled: bool) -> Result<(), RegistryError> {
        let entry = self
            .fuses
            .get_mut(&address)
            .ok_or(RegistryError::FuseNotRegistered(address))?;
        entry.enabled = enabled;
        info!(%address, enabled, "fuse toggled");
        Ok(())
    }

    /// Flags or unflags a fuse as eligible for the instant-withdrawal
    /// path. Unflagging also drops the fuse from the configured order.
    pub fn set_instant_withdrawal_eligible(
        &mut self,
        address: Address,
        eligible: bool,
    ) -> Result<(), RegistryError> {
        let entry = self
            .fuses
            .get_mut(&address)
            .ok_or(RegistryError::FuseNotRegistered(address))?;
        entry.instant_withdrawal = eligible;
        if !eligible {
            self.instant_withdrawal_order
                .retain(|step| step.fuse != address);
        }
        Ok(())
    }

    /// Resolves an address to a supported (registered and enabled) action
    /// fuse. The dispatcher's per-action gate.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnsupportedFuse`] — fatal to the batch —
    /// if the fuse is missing or disabled.
    pub fn resolve(&self, address: Address) -> Result<Arc<dyn ActionFuse>, RegistryError> {
        match self.fuses.get(&address) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.module)),
            _ => Err(RegistryError::UnsupportedFuse(address)),
        }
    }

    /// Returns `true` if the address names a registered, enabled fuse.
    pub fn is_supported(&self, address: Address) -> bool {
        self.fuses
            .get(&address)
            .map(|entry| entry.enabled)
            .unwrap_or(false)
    }

    /// Returns `true` if the address is registered at all, enabled or not.
    pub fn is_registered(&self, address: Address) -> bool {
        self.fuses.contains_key(&address)
    }

    /// The market of a registered fuse, enabled or not.
    pub fn market_of(&self, address: Address) -> Option<MarketId> {
        self.fuses.get(&address).map(|entry| entry.module.market())
    }

    /// Returns `true` if the fuse is flagged for instant withdrawal.
    pub fn is_instant_withdrawal_eligible(&self, address: Address) -> bool {
        self.fuses
            .get(&address)
            .map(|entry| entry.enabled && entry.instant_withdrawal)
            .unwrap_or(false)
    }

    /// When the fuse was registered, if it is.
    pub fn registered_at(&self, address: Address) -> Option<DateTime<Utc>> {
        self.fuses.get(&address).map(|entry| entry.added_at)
    }

    /// Installs the balance fuse for its market.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BalanceFuseAlreadySet`] if the market
    /// already has one — remove it explicitly first, so that swapping a
    /// valuation source is always a visible two-step governance act.
    pub fn set_balance_fuse(&mut self, module: Arc<dyn BalanceFuse>) -> Result<(), RegistryError> {
        let market = module.market();
        if let Some(existing) = self.balance_fuses.get(&market) {
            return Err(RegistryError::BalanceFuseAlreadySet {
                market,
                existing: existing.address(),
            });
        }
        let address = module.address();
        self.balance_fuses.insert(market, module);
        info!(%address, %market, "balance fuse installed");
        Ok(())
    }

    /// Removes the balance fuse for a market. The caller names the address
    /// it believes is active; a mismatch fails rather than silently
    /// removing the wrong module.
    pub fn remove_balance_fuse(
        &mut self,
        market: MarketId,
        address: Address,
    ) -> Result<Arc<dyn BalanceFuse>, RegistryError> {
        let active = self
            .balance_fuses
            .get(&market)
            .ok_or(RegistryError::BalanceFuseNotSet(market))?;
        let actual = active.address();
        if actual != address {
            return Err(RegistryError::BalanceFuseMismatch {
                market,
                expected: address,
                actual,
            });
        }
        let module = self
            .balance_fuses
            .remove(&market)
            .expect("presence checked above");
        info!(%address, %market, "balance fuse removed");
        Ok(module)
    }

    /// The active balance fuse for a market, if any.
    pub fn balance_fuse(&self, market: MarketId) -> Option<Arc<dyn BalanceFuse>> {
        self.balance_fuses.get(&market).map(Arc::clone)
    }

    /// Markets that currently have an active balance fuse, ascending.
    pub fn valued_markets(&self) -> Vec<MarketId> {
        self.balance_fuses.keys().copied().collect()
    }

    /// Replaces the instant-withdrawal order.
    ///
    /// Every entry must name a registered, enabled, instant-eligible fuse
    /// — the path runs outside normal operator review, so the configured
    /// list is validated at configuration time as well as at run time.
    pub fn set_instant_withdrawal_order(
        &mut self,
        order: Vec<InstantWithdrawalEntry>,
    ) -> Result<(), RegistryError> {
        for step in &order {
            let entry = self
                .fuses
                .get(&step.fuse)
                .ok_or(RegistryError::FuseNotRegistered(step.fuse))?;
            if !entry.instant_withdrawal {
                return Err(RegistryError::NotInstantEligible(step.fuse));
            }
        }
        info!(steps = order.len(), "instant-withdrawal order configured");
        self.instant_withdrawal_order = order;
        Ok(())
    }

    /// The configured instant-withdrawal order.
    pub fn instant_withdrawal_order(&self) -> &[InstantWithdrawalEntry] {
        &self.instant_withdrawal_order
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
