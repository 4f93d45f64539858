//! # Lending Fuses
//!
//! Supply and withdraw against a pool-style lending market. The action
//! fuse moves principal between the vault's idle funds and a granted pool
//! substrate; the balance fuse values the deployed principal marked up by
//! an externally supplied accrual rate.
//!
//! Payloads:
//!
//! - `enter` — bincode [`SupplyParams`]: which pool, how much.
//! - `exit` — 8-byte big-endian amount followed by the pool substrate's
//!   raw 32 bytes. The same shape the instant-withdrawal path produces,
//!   so one exit implementation serves both callers.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use conduit_core::error::VaultError;
use conduit_core::execute::{decode_instant_payload, ExecutionContext};
use conduit_core::fuse::{ActionFuse, BalanceFuse, FuseError};
use conduit_core::ledger::VaultLedger;
use conduit_core::substrate::Substrate;
use conduit_core::types::{Address, MarketId};

/// Basis-point denominator for accrual math.
const BPS_DENOM: u64 = 10_000;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Parameters for a supply (`enter`) action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupplyParams {
    /// The pool substrate to supply into. Must be granted for the fuse's
    /// market.
    pub pool: Substrate,
    /// Amount of underlying to supply, in smallest units.
    pub amount: u64,
}

impl SupplyParams {
    /// Encodes the parameters into an action payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("supply params always encode")
    }
}

fn decode_supply(payload: &[u8]) -> Result<SupplyParams, VaultError> {
    bincode::deserialize(payload)
        .map_err(|e| FuseError::MalformedPayload(format!("supply params: {e}")).into())
}

fn decode_pool(tail: &[u8]) -> Result<Substrate, VaultError> {
    let raw: [u8; 32] = tail.try_into().map_err(|_| {
        FuseError::MalformedPayload("exit payload tail must be a 32-byte substrate".into())
    })?;
    Ok(Substrate::from_raw(raw))
}

/// Builds the exit payload: amount prefix plus the pool substrate.
pub fn encode_exit(amount: u64, pool: Substrate) -> Vec<u8> {
    let mut payload = amount.to_be_bytes().to_vec();
    payload.extend_from_slice(pool.as_bytes());
    payload
}

// ---------------------------------------------------------------------------
// Action fuse
// ---------------------------------------------------------------------------

/// Supplies idle funds into a lending pool and withdraws them back.
pub struct LendingSupplyFuse {
    address: Address,
    market: MarketId,
}

impl LendingSupplyFuse {
    /// Creates the fuse for one market.
    pub fn new(address: Address, market: MarketId) -> Self {
        Self { address, market }
    }
}

impl ActionFuse for LendingSupplyFuse {
    fn address(&self) -> Address {
        self.address
    }

    fn market(&self) -> MarketId {
        self.market
    }

    fn enter(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError> {
        let params = decode_supply(payload)?;
        ctx.require_granted(self.market, &params.pool)?;
        ctx.ledger_mut()
            .open_position(self.market, params.pool, params.amount)?;
        debug!(market = %self.market, pool = %params.pool, amount = params.amount, "supplied");
        Ok(())
    }

    fn exit(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError> {
        let (amount, tail) = decode_instant_payload(payload)?;
        let pool = decode_pool(tail)?;
        ctx.require_granted(self.market, &pool)?;

        // The instant-withdrawal path asks for "up to this much"; a
        // smaller position is not an error, an empty one is.
        let held = ctx.ledger().position(self.market, &pool);
        let closing = amount.min(held);
        ctx.ledger_mut().close_position(self.market, pool, closing)?;
        debug!(market = %self.market, pool = %pool, amount = closing, "withdrawn");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Balance fuse
// ---------------------------------------------------------------------------

/// Values the market's principal marked up by an accrual rate.
///
/// The rate handle is shared with whatever oracle process tracks the
/// external pool's interest; the engine only ever reads it.
pub struct LendingBalanceFuse {
    address: Address,
    market: MarketId,
    rate_bps: Arc<RwLock<u32>>,
}

impl LendingBalanceFuse {
    /// Creates the balance fuse with a shared accrual-rate handle.
    pub fn new(address: Address, market: MarketId, rate_bps: Arc<RwLock<u32>>) -> Self {
        Self {
            address,
            market,
            rate_bps,
        }
    }
}

impl BalanceFuse for LendingBalanceFuse {
    fn address(&self) -> Address {
        self.address
    }

    fn market(&self) -> MarketId {
        self.market
    }

    fn balance_of(&self, ledger: &VaultLedger) -> Result<u64, VaultError> {
        let principal = ledger.market_principal(self.market)?;
        let rate = u64::from(*self.rate_bps.read());

        let accrued = principal
            .checked_mul(rate)
            .map(|scaled| scaled / BPS_DENOM)
            .ok_or_else(|| {
                FuseError::ValuationUnavailable(format!(
                    "accrual overflow: principal {principal}, rate {rate} bps"
                ))
            })?;
        principal.checked_add(accrued).ok_or_else(|| {
            FuseError::ValuationUnavailable(format!(
                "valuation overflow: principal {principal}, accrued {accrued}"
            ))
            .into()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::callback::CallbackHandlerRegistry;
    use conduit_core::execute::VaultState;
    use conduit_core::fuse::FuseRegistry;
    use conduit_core::substrate::SubstrateRegistry;

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn pool() -> Substrate {
        Substrate::pool(addr(0xAA))
    }

    struct Fixture {
        fuses: FuseRegistry,
        substrates: SubstrateRegistry,
        callbacks: CallbackHandlerRegistry,
        state: VaultState,
    }

    fn fixture(granted: bool) -> Fixture {
        let mut fuses = FuseRegistry::new();
        fuses
            .add(Arc::new(LendingSupplyFuse::new(addr(1), MarketId(10))))
            .unwrap();
        let mut substrates = SubstrateRegistry::new();
        if granted {
            substrates.grant(MarketId(10), &[pool()]);
        }
        let mut state = VaultState::default();
        state.ledger.deposit_idle(1_000).unwrap();
        Fixture {
            fuses,
            substrates,
            callbacks: CallbackHandlerRegistry::new(),
            state,
        }
    }

    #[test]
    fn supply_moves_idle_into_pool() {
        let mut fx = fixture(true);
        let fuse = LendingSupplyFuse::new(addr(1), MarketId(10));
        let payload = SupplyParams {
            pool: pool(),
            amount: 400,
        }
        .encode();

        let mut ctx = ExecutionContext::new(
            &fx.fuses,
            &fx.substrates,
            &fx.callbacks,
            &mut fx.state,
        );
        fuse.enter(&mut ctx, &payload).unwrap();
        drop(ctx);

        assert_eq!(fx.state.ledger.idle(), 600);
        assert_eq!(fx.state.ledger.position(MarketId(10), &pool()), 400);
    }

    #[test]
    fn supply_into_ungranted_pool_fails() {
        let mut fx = fixture(false);
        let fuse = LendingSupplyFuse::new(addr(1), MarketId(10));
        let payload = SupplyParams {
            pool: pool(),
            amount: 400,
        }
        .encode();

        let mut ctx = ExecutionContext::new(
            &fx.fuses,
            &fx.substrates,
            &fx.callbacks,
            &mut fx.state,
        );
        let result = fuse.enter(&mut ctx, &payload);
        assert!(matches!(result.unwrap_err(), VaultError::Substrate(_)));
    }

    #[test]
    fn garbage_payload_rejected() {
        let mut fx = fixture(true);
        let fuse = LendingSupplyFuse::new(addr(1), MarketId(10));

        let mut ctx = ExecutionContext::new(
            &fx.fuses,
            &fx.substrates,
            &fx.callbacks,
            &mut fx.state,
        );
        let result = fuse.enter(&mut ctx, &[0xFF; 3]);
        assert!(matches!(
            result.unwrap_err(),
            VaultError::Fuse(FuseError::MalformedPayload(_))
        ));
    }

    #[test]
    fn exit_caps_at_held_position() {
        let mut fx = fixture(true);
        let fuse = LendingSupplyFuse::new(addr(1), MarketId(10));
        fx.state
            .ledger
            .open_position(MarketId(10), pool(), 300)
            .unwrap();

        let mut ctx = ExecutionContext::new(
            &fx.fuses,
            &fx.substrates,
            &fx.callbacks,
            &mut fx.state,
        );
        fuse.exit(&mut ctx, &encode_exit(1_000, pool())).unwrap();
        drop(ctx);

        assert_eq!(fx.state.ledger.position(MarketId(10), &pool()), 0);
        assert_eq!(fx.state.ledger.idle(), 1_000);
    }

    #[test]
    fn balance_fuse_marks_up_principal() {
        let mut ledger = VaultLedger::new();
        ledger.deposit_idle(10_000).unwrap();
        ledger.open_position(MarketId(10), pool(), 10_000).unwrap();

        let rate = Arc::new(RwLock::new(500u32)); // 5%
        let fuse = LendingBalanceFuse::new(addr(2), MarketId(10), Arc::clone(&rate));

        assert_eq!(fuse.balance_of(&ledger).unwrap(), 10_500);

        *rate.write() = 0;
        assert_eq!(fuse.balance_of(&ledger).unwrap(), 10_000);
    }

    #[test]
    fn balance_fuse_overflow_is_loud() {
        let mut ledger = VaultLedger::new();
        ledger.deposit_idle(u64::MAX).unwrap();
        ledger
            .open_position(MarketId(10), pool(), u64::MAX)
            .unwrap();

        let rate = Arc::new(RwLock::new(500u32));
        let fuse = LendingBalanceFuse::new(addr(2), MarketId(10), rate);
        assert!(matches!(
            fuse.balance_of(&ledger).unwrap_err(),
            VaultError::Fuse(FuseError::ValuationUnavailable(_))
        ));
    }
}
