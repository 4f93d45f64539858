//! # Crate-Level Error Type
//!
//! Each module owns its own `thiserror` enum; [`VaultError`] folds them
//! into the one type that crosses the vault's public surface and the fuse
//! trait boundary. Downstream (fuse-originated) failures travel through
//! unmodified — the dispatcher never rewraps or rewords them.

use thiserror::Error;

use crate::access::AccessError;
use crate::balance::BalanceError;
use crate::callback::CallbackError;
use crate::execute::DispatchError;
use crate::fuse::{FuseError, RegistryError};
use crate::ledger::LedgerError;
use crate::substrate::SubstrateError;

/// Any failure a vault operation can surface.
///
/// Every variant is fatal to the call that raised it; nothing in this
/// core is retried internally, and every failure of a mutating operation
/// rolls back all state changes made since the call began.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Caller lacks a required role.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// A substrate was not granted, or failed to decode.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// A fuse was unsupported or a registry configuration was invalid.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A ledger movement failed (insufficient funds, overflow).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Balance aggregation failed (value overflow).
    #[error(transparent)]
    Balance(#[from] BalanceError),

    /// A re-entrancy violation or callback-routing failure.
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// A batch-level dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The invoked module's own logic failed; propagated unmodified.
    #[error(transparent)]
    Fuse(#[from] FuseError),
}
