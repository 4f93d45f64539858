//! Integration tests for the lending fuses.
//!
//! These exercise the full governance-then-execution lifecycle through the
//! vault facade: staff roles, approve the fuses, grant the pool substrate,
//! supply, accrue, revalue, and withdraw.

use std::sync::Arc;

use parking_lot::RwLock;

use conduit_core::access::Role;
use conduit_core::error::VaultError;
use conduit_core::execute::{Action, FuseMethod};
use conduit_core::substrate::Substrate;
use conduit_core::types::{Address, MarketId};
use conduit_core::Vault;
use conduit_fuses::lending::{
    encode_exit, LendingBalanceFuse, LendingSupplyFuse, SupplyParams,
};

const ADMIN: u8 = 1;
const OPERATOR: u8 = 2;
const MANAGER: u8 = 3;
const UPDATER: u8 = 4;

fn addr(byte: u8) -> Address {
    Address::new([byte; 20])
}

fn pool() -> Substrate {
    Substrate::pool(addr(0xAA))
}

/// Vault with the lending pair wired into market 1 and 100_000 idle.
/// Returns the shared accrual-rate handle.
fn lending_vault() -> (Vault, Arc<RwLock<u32>>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut vault = Vault::new(addr(ADMIN));
    for (role, holder) in [
        (Role::Operator, OPERATOR),
        (Role::FuseManager, MANAGER),
        (Role::BalanceUpdater, UPDATER),
    ] {
        vault.grant_role(addr(ADMIN), role, addr(holder), None).unwrap();
    }

    let rate = Arc::new(RwLock::new(0u32));
    vault
        .add_fuses(
            addr(MANAGER),
            vec![Arc::new(LendingSupplyFuse::new(addr(10), MarketId(1)))],
        )
        .unwrap();
    vault
        .add_balance_fuse(
            addr(MANAGER),
            Arc::new(LendingBalanceFuse::new(
                addr(11),
                MarketId(1),
                Arc::clone(&rate),
            )),
        )
        .unwrap();
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(1), &[pool()])
        .unwrap();
    vault.deposit_underlying(100_000).unwrap();
    (vault, rate)
}

fn supply(amount: u64) -> Action {
    Action {
        fuse: addr(10),
        method: FuseMethod::Enter,
        payload: SupplyParams {
            pool: pool(),
            amount,
        }
        .encode(),
    }
}

fn withdraw(amount: u64) -> Action {
    Action {
        fuse: addr(10),
        method: FuseMethod::Exit,
        payload: encode_exit(amount, pool()),
    }
}

#[test]
fn supply_accrue_withdraw_lifecycle() {
    let (mut vault, rate) = lending_vault();

    // 1. Supply
    vault.execute(addr(OPERATOR), &[supply(40_000)]).unwrap();
    assert_eq!(vault.ledger().idle(), 60_000);
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 40_000);

    // 2. Accrue 5% and revalue
    *rate.write() = 500;
    vault
        .update_markets_balances(addr(UPDATER), &[MarketId(1)])
        .unwrap();
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 42_000);
    assert_eq!(vault.total_assets().unwrap(), 42_000);

    // 3. Withdraw the principal
    vault.execute(addr(OPERATOR), &[withdraw(40_000)]).unwrap();
    assert_eq!(vault.ledger().idle(), 100_000);
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 0);
}

#[test]
fn supply_beyond_idle_rolls_back() {
    let (mut vault, _) = lending_vault();

    let result = vault.execute(addr(OPERATOR), &[supply(200_000)]);
    assert!(matches!(result.unwrap_err(), VaultError::Ledger(_)));
    assert_eq!(vault.ledger().idle(), 100_000);
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 0);
}

#[test]
fn supply_into_unapproved_pool_rolls_back() {
    let (mut vault, _) = lending_vault();
    let stranger = Substrate::pool(addr(0xBB));

    let action = Action {
        fuse: addr(10),
        method: FuseMethod::Enter,
        payload: SupplyParams {
            pool: stranger,
            amount: 1_000,
        }
        .encode(),
    };
    let result = vault.execute(addr(OPERATOR), &[action]);
    assert!(matches!(result.unwrap_err(), VaultError::Substrate(_)));
    assert_eq!(vault.ledger().idle(), 100_000);
}

#[test]
fn split_supply_across_two_pools() {
    let (mut vault, _) = lending_vault();
    let second = Substrate::pool(addr(0xCC));
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(1), &[second])
        .unwrap();

    let into_second = Action {
        fuse: addr(10),
        method: FuseMethod::Enter,
        payload: SupplyParams {
            pool: second,
            amount: 10_000,
        }
        .encode(),
    };
    vault
        .execute(addr(OPERATOR), &[supply(30_000), into_second])
        .unwrap();

    assert_eq!(vault.ledger().position(MarketId(1), &pool()), 30_000);
    assert_eq!(vault.ledger().position(MarketId(1), &second), 10_000);
    assert_eq!(vault.total_assets_in_market(MarketId(1)), 40_000);
}
