//! Integration tests for the vault engine.
//!
//! These tests exercise whole operation flows through the facade,
//! simulating real governance-then-execution sequences: staffing roles,
//! approving fuses, granting substrates, dispatching batches, and
//! verifying the all-or-nothing guarantee from the outside.

use std::sync::Arc;

use conduit_core::access::Role;
use conduit_core::error::VaultError;
use conduit_core::execute::{
    decode_instant_payload, Action, ExecutionContext, FuseMethod,
};
use conduit_core::fuse::{ActionFuse, BalanceFuse, FuseError, InstantWithdrawalEntry};
use conduit_core::ledger::VaultLedger;
use conduit_core::substrate::Substrate;
use conduit_core::types::{Address, MarketId};
use conduit_core::Vault;

const ADMIN: u8 = 1;
const OPERATOR: u8 = 2;
const MANAGER: u8 = 3;
const UPDATER: u8 = 4;
const WITHDRAWER: u8 = 5;

fn addr(byte: u8) -> Address {
    Address::new([byte; 20])
}

/// Run with `RUST_LOG=debug` to see the engine's dispatch trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Moves idle funds into a fixed substrate on enter, back out on exit.
/// Payloads are the 8-byte big-endian amount (plus ignored tail on exit).
struct MoveFuse {
    address: Address,
    market: MarketId,
    substrate: Substrate,
}

impl ActionFuse for MoveFuse {
    fn address(&self) -> Address {
        self.address
    }
    fn market(&self) -> MarketId {
        self.market
    }
    fn enter(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError> {
        let (amount, _) = decode_instant_payload(payload)?;
        ctx.require_granted(self.market, &self.substrate)?;
        ctx.ledger_mut()
            .open_position(self.market, self.substrate, amount)?;
        Ok(())
    }
    fn exit(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError> {
        let (amount, _) = decode_instant_payload(payload)?;
        ctx.require_granted(self.market, &self.substrate)?;
        let held = ctx.ledger().position(self.market, &self.substrate);
        ctx.ledger_mut()
            .close_position(self.market, self.substrate, amount.min(held))?;
        Ok(())
    }
}

/// Fails every invocation, standing in for a strategy hitting a protocol
/// error.
struct FailFuse {
    address: Address,
    market: MarketId,
}

impl ActionFuse for FailFuse {
    fn address(&self) -> Address {
        self.address
    }
    fn market(&self) -> MarketId {
        self.market
    }
    fn enter(&self, _ctx: &mut ExecutionContext<'_>, _payload: &[u8]) -> Result<(), VaultError> {
        Err(FuseError::ProtocolRejected("liquidity gate closed".into()).into())
    }
    fn exit(&self, _ctx: &mut ExecutionContext<'_>, _payload: &[u8]) -> Result<(), VaultError> {
        Err(FuseError::ProtocolRejected("liquidity gate closed".into()).into())
    }
}

/// Values a market at its deployed principal.
struct PrincipalBalanceFuse {
    address: Address,
    market: MarketId,
}

impl BalanceFuse for PrincipalBalanceFuse {
    fn address(&self) -> Address {
        self.address
    }
    fn market(&self) -> MarketId {
        self.market
    }
    fn balance_of(&self, ledger: &VaultLedger) -> Result<u64, VaultError> {
        Ok(ledger.market_principal(self.market)?)
    }
}

fn amount_payload(amount: u64) -> Vec<u8> {
    amount.to_be_bytes().to_vec()
}

fn enter(fuse: u8, amount: u64) -> Action {
    Action {
        fuse: addr(fuse),
        method: FuseMethod::Enter,
        payload: amount_payload(amount),
    }
}

fn exit(fuse: u8, amount: u64) -> Action {
    Action {
        fuse: addr(fuse),
        method: FuseMethod::Exit,
        payload: amount_payload(amount),
    }
}

/// A fully staffed vault with one market wired up: MoveFuse at addr(10)
/// into market 1 / pool 0xAA, principal balance fuse, substrate granted,
/// and 10_000 idle.
fn one_market_vault() -> (Vault, Substrate) {
    init_tracing();
    let mut vault = Vault::new(addr(ADMIN));
    for (role, holder) in [
        (Role::Operator, OPERATOR),
        (Role::FuseManager, MANAGER),
        (Role::BalanceUpdater, UPDATER),
        (Role::Withdrawer, WITHDRAWER),
    ] {
        vault.grant_role(addr(ADMIN), role, addr(holder), None).unwrap();
    }

    let pool = Substrate::pool(addr(0xAA));
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(MoveFuse {
                address: addr(10),
                market: MarketId(1),
                substrate: pool,
            })],
        )
        .unwrap();
    vault
        .add_balance_fuse(
            addr(MANAGER),
            Arc::new(PrincipalBalanceFuse {
                address: addr(11),
                market: MarketId(1),
            }),
        )
        .unwrap();
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(1), &[pool])
        .unwrap();
    vault.deposit_underlying(10_000).unwrap();
    (vault, pool)
}

// ---------------------------------------------------------------------------
// Deploy / rebalance flows
// ---------------------------------------------------------------------------

#[test]
fn deposit_deploy_and_value() {
    let (mut vault, pool) = one_market_vault();

    vault.execute(addr(OPERATOR), &[enter(10, 4_000)]).unwrap();

    assert_eq!(vault.ledger().idle(), 6_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool), 4_000);
    // The touched market was revalued as part of the batch.
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 4_000);
    assert_eq!(vault.total_assets().unwrap(), 4_000);
}

#[test]
fn rebalance_across_markets_in_one_batch() {
    let (mut vault, _) = one_market_vault();
    let pool_b = Substrate::pool(addr(0xBB));
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(MoveFuse {
                address: addr(20),
                market: MarketId(2),
                substrate: pool_b,
            })],
        )
        .unwrap();
    vault
        .add_balance_fuse(
            addr(MANAGER),
            Arc::new(PrincipalBalanceFuse {
                address: addr(21),
                market: MarketId(2),
            }),
        )
        .unwrap();
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(2), &[pool_b])
        .unwrap();

    vault.execute(addr(OPERATOR), &[enter(10, 6_000)]).unwrap();

    // Pull 2_500 out of market 1 and push it into market 2, atomically.
    vault
        .execute(addr(OPERATOR), &[exit(10, 2_500), enter(20, 2_500)])
        .unwrap();

    assert_eq!(vault.total_assets_in_market(MarketId(1)), 3_500);
    assert_eq!(vault.total_assets_in_market(MarketId(2)), 2_500);
    assert_eq!(vault.total_assets().unwrap(), 6_000);
    assert_eq!(vault.ledger().idle(), 4_000);
}

// ---------------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------------

#[test]
fn failing_action_rolls_back_whole_batch() {
    let (mut vault, pool) = one_market_vault();
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(FailFuse {
                address: addr(66),
                market: MarketId(6),
            })],
        )
        .unwrap();

    // First action succeeds, second fails: nothing may stick.
    let result = vault.execute(addr(OPERATOR), &[enter(10, 4_000), enter(66, 1)]);
    assert!(matches!(
        result.unwrap_err(),
        VaultError::Fuse(FuseError::ProtocolRejected(_))
    ));

    assert_eq!(vault.ledger().idle(), 10_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool), 0);
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 0);
    assert!(vault.last_update_seq(MarketId(1)).is_none());
}

#[test]
fn ungranted_substrate_rolls_back_whole_batch() {
    let (mut vault, _) = one_market_vault();
    let ungranted = Substrate::pool(addr(0xCC));
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(MoveFuse {
                address: addr(30),
                market: MarketId(3),
                substrate: ungranted,
            })],
        )
        .unwrap();

    let result = vault.execute(addr(OPERATOR), &[enter(10, 4_000), enter(30, 100)]);
    assert!(matches!(result.unwrap_err(), VaultError::Substrate(_)));
    assert_eq!(vault.ledger().idle(), 10_000);
}

#[test]
fn unsupported_fuse_rolls_back_whole_batch() {
    let (mut vault, _) = one_market_vault();

    let result = vault.execute(addr(OPERATOR), &[enter(10, 4_000), enter(99, 1)]);
    assert!(matches!(result.unwrap_err(), VaultError::Registry(_)));
    assert_eq!(vault.ledger().idle(), 10_000);
}

#[test]
fn disabled_fuse_fails_like_unregistered() {
    let (mut vault, _) = one_market_vault();
    vault.set_fuse_enabled(addr(MANAGER), addr(10), false).unwrap();

    let result = vault.execute(addr(OPERATOR), &[enter(10, 4_000)]);
    assert!(matches!(result.unwrap_err(), VaultError::Registry(_)));

    vault.set_fuse_enabled(addr(MANAGER), addr(10), true).unwrap();
    vault.execute(addr(OPERATOR), &[enter(10, 4_000)]).unwrap();
}

// ---------------------------------------------------------------------------
// Balance recomputation
// ---------------------------------------------------------------------------

#[test]
fn recompute_is_idempotent_without_mutation() {
    let (mut vault, _) = one_market_vault();
    vault.execute(addr(OPERATOR), &[enter(10, 4_000)]).unwrap();

    vault
        .update_markets_balances(addr(UPDATER), &[MarketId(1)])
        .unwrap();
    let first = vault.total_assets_in_market(MarketId(1));
    let first_seq = vault.last_update_seq(MarketId(1));

    vault
        .update_markets_balances(addr(UPDATER), &[MarketId(1)])
        .unwrap();
    assert_eq!(vault.total_assets_in_market(MarketId(1)), first);
    // The sequence advances; the value does not.
    assert!(vault.last_update_seq(MarketId(1)) > first_seq);
}

#[test]
fn dependents_are_refreshed_transitively() {
    let (mut vault, _) = one_market_vault();
    let pool_b = Substrate::pool(addr(0xBB));
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(MoveFuse {
                address: addr(20),
                market: MarketId(2),
                substrate: pool_b,
            })],
        )
        .unwrap();
    vault
        .add_balance_fuse(
            addr(MANAGER),
            Arc::new(PrincipalBalanceFuse {
                address: addr(21),
                market: MarketId(2),
            }),
        )
        .unwrap();
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(2), &[pool_b])
        .unwrap();
    // Market 2 depends on market 1: updating 1 must refresh 2.
    vault
        .update_dependency_graphs(addr(MANAGER), vec![(MarketId(1), vec![MarketId(2)])])
        .unwrap();

    vault.execute(addr(OPERATOR), &[enter(20, 3_000)]).unwrap();
    let seq_before = vault.last_update_seq(MarketId(2)).unwrap();

    vault
        .update_markets_balances(addr(UPDATER), &[MarketId(1)])
        .unwrap();
    assert!(vault.last_update_seq(MarketId(2)).unwrap() > seq_before);
    assert_eq!(vault.total_assets_in_market(MarketId(2)), 3_000);
}

#[test]
fn removing_balance_fuse_drops_market_from_total() {
    let (mut vault, _) = one_market_vault();
    vault.execute(addr(OPERATOR), &[enter(10, 4_000)]).unwrap();
    assert_eq!(vault.total_assets().unwrap(), 4_000);

    vault
        .remove_balance_fuse(addr(MANAGER), MarketId(1), addr(11))
        .unwrap();
    assert_eq!(vault.total_assets().unwrap(), 0);
    assert!(vault.last_update_seq(MarketId(1)).is_none());
}

// ---------------------------------------------------------------------------
// Instant withdrawal
// ---------------------------------------------------------------------------

fn configure_instant(vault: &mut Vault) {
    vault
        .set_instant_withdrawal_eligible(addr(MANAGER), addr(10), true)
        .unwrap();
    vault
        .configure_instant_withdrawal_fuses(
            addr(MANAGER),
            vec![InstantWithdrawalEntry {
                fuse: addr(10),
                params: vec![],
            }],
        )
        .unwrap();
}

#[test]
fn instant_withdrawal_unwinds_just_enough() {
    let (mut vault, pool) = one_market_vault();
    configure_instant(&mut vault);
    vault.execute(addr(OPERATOR), &[enter(10, 9_000)]).unwrap();
    assert_eq!(vault.ledger().idle(), 1_000);

    vault.instant_withdraw(addr(WITHDRAWER), 4_000).unwrap();

    assert_eq!(vault.ledger().idle(), 4_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool), 6_000);
    // The unwound market was revalued.
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 6_000);

    vault.withdraw_underlying(4_000).unwrap();
    assert_eq!(vault.ledger().idle(), 0);
}

#[test]
fn instant_withdrawal_shortfall_rolls_back() {
    let (mut vault, pool) = one_market_vault();
    configure_instant(&mut vault);
    vault.execute(addr(OPERATOR), &[enter(10, 9_000)]).unwrap();

    // Only 10_000 exists in total; 50_000 cannot be raised.
    let result = vault.instant_withdraw(addr(WITHDRAWER), 50_000);
    assert!(matches!(result.unwrap_err(), VaultError::Dispatch(_)));

    // Nothing was unwound.
    assert_eq!(vault.ledger().idle(), 1_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool), 9_000);
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[test]
fn expired_grant_stops_working() {
    let (mut vault, _) = one_market_vault();
    vault
        .grant_role(
            addr(ADMIN),
            Role::Operator,
            addr(77),
            Some(chrono::Utc::now() + chrono::Duration::milliseconds(30)),
        )
        .unwrap();
    assert!(vault.has_role(Role::Operator, addr(77)));

    std::thread::sleep(std::time::Duration::from_millis(60));
    assert!(!vault.has_role(Role::Operator, addr(77)));
    let result = vault.execute(addr(77), &[enter(10, 1)]);
    assert!(matches!(result.unwrap_err(), VaultError::Access(_)));
}

#[test]
fn revoked_operator_cannot_execute() {
    let (mut vault, _) = one_market_vault();
    vault
        .revoke_role(addr(ADMIN), Role::Operator, addr(OPERATOR))
        .unwrap();
    let result = vault.execute(addr(OPERATOR), &[enter(10, 1)]);
    assert!(matches!(result.unwrap_err(), VaultError::Access(_)));
}
