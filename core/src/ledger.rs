//! # Vault Ledger — The Balance Sheet Fuses Execute Against
//!
//! The ledger is the single shared mutable resource in the engine: the
//! vault's idle underlying balance plus its per-market, per-substrate
//! positions. A mutable reference to it is what "executing as the vault"
//! means — the dispatcher injects `&mut VaultLedger` into each fuse call
//! instead of the fuse holding any state of its own.
//!
//! ## Design Principles
//!
//! 1. **All amounts are `u64` in smallest-unit denomination.** No floating
//!    point, no decimals in arithmetic.
//! 2. **Checked arithmetic everywhere.** Overflow and underflow are
//!    explicit errors, never wraps or saturations.
//! 3. **Serializable.** The whole ledger derives `Serialize`/`Deserialize`
//!    and is `Clone` — the dispatcher's all-or-nothing rollback is a
//!    snapshot-and-restore of this struct.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::substrate::Substrate;
use crate::types::MarketId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Attempted to draw more idle underlying than the vault holds.
    #[error("insufficient idle balance: available {available}, requested {requested}")]
    InsufficientIdle {
        /// Idle balance currently held.
        available: u64,
        /// Amount that was requested.
        requested: u64,
    },

    /// Attempted to reduce a position below zero.
    #[error(
        "insufficient position: {market} substrate {substrate} holds {available}, requested {requested}"
    )]
    InsufficientPosition {
        /// The market the position belongs to.
        market: MarketId,
        /// The substrate keying the position.
        substrate: Substrate,
        /// Current position size.
        available: u64,
        /// Amount that was requested.
        requested: u64,
    },

    /// Arithmetic overflow. If you're hitting this, someone is moving more
    /// than 18.4 quintillion smallest units. That's either a bug or an
    /// attack.
    #[error("ledger overflow: current {current}, credit {credit}")]
    Overflow {
        /// Value before the failed credit.
        current: u64,
        /// Amount that caused the overflow.
        credit: u64,
    },

    /// Zero-amount operations are no-ops and almost certainly a caller bug.
    #[error("zero-amount ledger operations are not permitted")]
    ZeroAmount,
}

// ---------------------------------------------------------------------------
// VaultLedger
// ---------------------------------------------------------------------------

/// The vault's own holdings: idle underlying plus open positions.
///
/// Positions are keyed by `(market, substrate)`; a position records how
/// much underlying the vault has committed to that substrate. Valuation of
/// a position is the balance fuse's job, not the ledger's — the ledger
/// tracks principal flows only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultLedger {
    /// Underlying held by the vault and not deployed anywhere.
    idle: u64,
    /// Deployed principal per market, per substrate. Zero positions are
    /// pruned on close.
    positions: BTreeMap<MarketId, BTreeMap<Substrate, u64>>,
}

impl VaultLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle underlying currently held.
    pub fn idle(&self) -> u64 {
        self.idle
    }

    /// Credits idle underlying (deposit from the share-token layer, or
    /// flash-loan principal received).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the credit would exceed
    /// `u64::MAX`, [`LedgerError::ZeroAmount`] for a zero credit.
    pub fn deposit_idle(&mut self, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.idle = self.idle.checked_add(amount).ok_or(LedgerError::Overflow {
            current: self.idle,
            credit: amount,
        })?;
        Ok(self.idle)
    }

    /// Debits idle underlying (withdrawal to the share-token layer, or
    /// flash-loan repayment).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientIdle`] if the vault holds less
    /// than `amount`, [`LedgerError::ZeroAmount`] for a zero debit.
    pub fn withdraw_idle(&mut self, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if self.idle < amount {
            return Err(LedgerError::InsufficientIdle {
                available: self.idle,
                requested: amount,
            });
        }
        self.idle -= amount;
        Ok(self.idle)
    }

    /// Moves idle underlying into a position: the principal flow behind a
    /// fuse's `enter`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientIdle`] if idle funds don't cover
    /// the amount, [`LedgerError::Overflow`] if the position would exceed
    /// `u64::MAX`, [`LedgerError::ZeroAmount`] for a zero move.
    pub fn open_position(
        &mut self,
        market: MarketId,
        substrate: Substrate,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if self.idle < amount {
            return Err(LedgerError::InsufficientIdle {
                available: self.idle,
                requested: amount,
            });
        }

        let position = self
            .positions
            .entry(market)
            .or_default()
            .entry(substrate)
            .or_insert(0);
        let new_position = position.checked_add(amount).ok_or(LedgerError::Overflow {
            current: *position,
            credit: amount,
        })?;

        *position = new_position;
        self.idle -= amount;
        Ok(new_position)
    }

    /// Moves principal out of a position back to idle: the flow behind a
    /// fuse's `exit`.
    ///
    /// Zeroed positions are pruned so the map only carries live entries.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientPosition`] if the position holds
    /// less than `amount`, [`LedgerError::Overflow`] if idle would exceed
    /// `u64::MAX`, [`LedgerError::ZeroAmount`] for a zero move.
    pub fn close_position(
        &mut self,
        market: MarketId,
        substrate: Substrate,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let available = self.position(market, &substrate);
        if available < amount {
            return Err(LedgerError::InsufficientPosition {
                market,
                substrate,
                available,
                requested: amount,
            });
        }

        let new_idle = self.idle.checked_add(amount).ok_or(LedgerError::Overflow {
            current: self.idle,
            credit: amount,
        })?;

        let by_substrate = self
            .positions
            .get_mut(&market)
            .expect("position existence checked above");
        let remaining = available - amount;
        if remaining == 0 {
            by_substrate.remove(&substrate);
            if by_substrate.is_empty() {
                self.positions.remove(&market);
            }
        } else {
            by_substrate.insert(substrate, remaining);
        }

        self.idle = new_idle;
        Ok(remaining)
    }

    /// Current principal in a single position, zero if none.
    pub fn position(&self, market: MarketId, substrate: &Substrate) -> u64 {
        self.positions
            .get(&market)
            .and_then(|by_substrate| by_substrate.get(substrate))
            .copied()
            .unwrap_or(0)
    }

    /// Total deployed principal in one market.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the sum exceeds `u64::MAX`.
    pub fn market_principal(&self, market: MarketId) -> Result<u64, LedgerError> {
        let Some(by_substrate) = self.positions.get(&market) else {
            return Ok(0);
        };
        let mut total: u64 = 0;
        for amount in by_substrate.values() {
            total = total.checked_add(*amount).ok_or(LedgerError::Overflow {
                current: total,
                credit: *amount,
            })?;
        }
        Ok(total)
    }

    /// All non-zero positions in a market, in substrate order.
    pub fn market_positions(&self, market: MarketId) -> Vec<(Substrate, u64)> {
        self.positions
            .get(&market)
            .map(|by_substrate| by_substrate.iter().map(|(s, a)| (*s, *a)).collect())
            .unwrap_or_default()
    }

    /// Markets that currently carry at least one open position.
    pub fn active_markets(&self) -> Vec<MarketId> {
        self.positions.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
