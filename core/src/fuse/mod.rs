//! # Fuses — Pluggable Strategy Modules
//!
//! A fuse is an approved strategy module the dispatcher can run against
//! the vault's own balance sheet. The vault core knows nothing about any
//! external protocol; a fuse carries that knowledge and receives the
//! vault's state as an injected capability instead of holding any of its
//! own.
//!
//! Two kinds:
//!
//! - **Action fuses** ([`ActionFuse`]) mutate state — open or close
//!   positions, stake, unstake, claim. They receive a mutable
//!   [`ExecutionContext`](crate::execute::ExecutionContext).
//! - **Balance fuses** ([`BalanceFuse`]) are read-only — they report the
//!   vault's valuation within their market. At most one is active per
//!   market.
//!
//! Approval is a registry toggle, not a per-call decision: a fuse is
//! either supported (registered and enabled) or every action naming it
//! fails.

pub mod registry;

pub use registry::{FuseRegistry, InstantWithdrawalEntry, RegistryError};

use thiserror::Error;

use crate::error::VaultError;
use crate::execute::ExecutionContext;
use crate::ledger::VaultLedger;
use crate::types::{Address, MarketId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures originating inside a fuse's own logic.
///
/// These are the "downstream failure" class: the dispatcher propagates
/// them unmodified, aborting the whole batch.
#[derive(Debug, Error)]
pub enum FuseError {
    /// The opaque payload did not decode to what the fuse expects.
    #[error("malformed fuse payload: {0}")]
    MalformedPayload(String),

    /// The external protocol rejected the fuse's request.
    #[error("external protocol rejected the call: {0}")]
    ProtocolRejected(String),

    /// A balance fuse could not produce a valuation (e.g., oracle
    /// unavailable). Stale data is worse than an explicit failure, so
    /// this fails the whole recomputation.
    #[error("valuation unavailable: {0}")]
    ValuationUnavailable(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A state-mutating strategy module.
///
/// The fuse executes "as the vault": the [`ExecutionContext`] hands it
/// mutable ledger access plus the substrate-permission lookup it is
/// obligated to consult before touching anything. The dispatcher does not
/// know which substrates a payload names — that check is the fuse's
/// responsibility, and [`ExecutionContext::require_granted`] is how it
/// discharges it.
pub trait ActionFuse: Send + Sync {
    /// The module's identity, keying the fuse registry.
    fn address(&self) -> Address;

    /// The single market this fuse is associated with.
    fn market(&self) -> MarketId;

    /// Deploys capital / opens a position according to the payload.
    fn enter(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError>;

    /// Unwinds capital / closes a position according to the payload.
    fn exit(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError>;
}

/// A read-only valuation module.
///
/// Reports the vault's total value within one market, in underlying
/// smallest units. The engine treats it as pure: same ledger in, same
/// value out. A failing balance fuse fails the update that invoked it —
/// the cache is never silently retained.
pub trait BalanceFuse: Send + Sync {
    /// The module's identity.
    fn address(&self) -> Address;

    /// The market this fuse values.
    fn market(&self) -> MarketId;

    /// The vault's current valuation within this market.
    fn balance_of(&self, ledger: &VaultLedger) -> Result<u64, VaultError>;
}
