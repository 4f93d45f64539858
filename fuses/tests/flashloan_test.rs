//! Integration tests for the flash-loan fuse.
//!
//! Exercise the whole re-entrancy path through the vault facade: borrow,
//! deploy the proceeds with nested actions inside the lender's callback,
//! repay with fee — and verify that any failure inside the window erases
//! the entire attempt, borrowed funds included.

use std::sync::Arc;

use conduit_core::access::Role;
use conduit_core::callback::ExternalProtocol;
use conduit_core::error::VaultError;
use conduit_core::execute::{Action, FuseMethod};
use conduit_core::substrate::Substrate;
use conduit_core::types::{Address, MarketId};
use conduit_core::Vault;
use conduit_fuses::flashloan::{
    FlashLoanFuse, FlashLoanHandler, FlashLoanParams, MockFlashLender, ON_FLASH_LOAN,
};
use conduit_fuses::lending::{LendingSupplyFuse, SupplyParams};

const ADMIN: u8 = 1;
const OPERATOR: u8 = 2;
const MANAGER: u8 = 3;
const LENDER: u8 = 9;

fn addr(byte: u8) -> Address {
    Address::new([byte; 20])
}

fn pool() -> Substrate {
    Substrate::pool(addr(0xAA))
}

/// Vault wired for flash loans: lending fuse at addr(10) into market 1,
/// flash fuse at addr(20) in market 2 against the returned mock lender
/// (10 bps fee), callback handler registered, pool granted, 1_000 idle.
fn flash_vault(lender: Arc<MockFlashLender>) -> Vault {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut vault = Vault::new(addr(ADMIN));
    for (role, holder) in [(Role::Operator, OPERATOR), (Role::FuseManager, MANAGER)] {
        vault.grant_role(addr(ADMIN), role, addr(holder), None).unwrap();
    }

    vault
        .add_fuses(
            addr(MANAGER),
            vec![
                Arc::new(LendingSupplyFuse::new(addr(10), MarketId(1))),
                Arc::new(FlashLoanFuse::new(
                    addr(20),
                    MarketId(2),
                    lender.clone(),
                    10,
                )),
            ],
        )
        .unwrap();
    vault
        .update_callback_handler(
            addr(MANAGER),
            lender.address(),
            ON_FLASH_LOAN,
            Some((Arc::new(FlashLoanHandler::new(addr(30))), ON_FLASH_LOAN)),
        )
        .unwrap();
    vault
        .grant_market_substrates(addr(MANAGER), MarketId(1), &[pool()])
        .unwrap();
    vault.deposit_underlying(1_000).unwrap();
    vault
}

fn flash_loan(amount: u64, actions: Vec<Action>) -> Action {
    Action {
        fuse: addr(20),
        method: FuseMethod::Enter,
        payload: FlashLoanParams { amount, actions }.encode(),
    }
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

#[test]
fn borrow_deploy_repay() {
    let lender = Arc::new(MockFlashLender::new(addr(LENDER)));
    let mut vault = flash_vault(lender.clone());

    // Borrow 5_000, supply 900 inside the window, repay 5_005.
    vault
        .execute(addr(OPERATOR), &[flash_loan(5_000, vec![supply(900)])])
        .unwrap();

    assert_eq!(vault.ledger().idle(), 95);
    assert_eq!(vault.ledger().position(MarketId(1), &pool()), 900);
    assert_eq!(lender.calls.lock().len(), 1);
}

#[test]
fn nested_actions_pass_substrate_checks() {
    let lender = Arc::new(MockFlashLender::new(addr(LENDER)));
    let mut vault = flash_vault(lender);
    let ungranted = Substrate::pool(addr(0xBB));

    let bad_supply = Action {
        fuse: addr(10),
        method: FuseMethod::Enter,
        payload: SupplyParams {
            pool: ungranted,
            amount: 100,
        }
        .encode(),
    };
    let result = vault.execute(addr(OPERATOR), &[flash_loan(5_000, vec![bad_supply])]);

    // The nested failure surfaced unmodified and the borrow was erased.
    assert!(matches!(result.unwrap_err(), VaultError::Substrate(_)));
    assert_eq!(vault.ledger().idle(), 1_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool()), 0);
}

#[test]
fn over_deploying_the_loan_rolls_back() {
    let lender = Arc::new(MockFlashLender::new(addr(LENDER)));
    let mut vault = flash_vault(lender);

    // Supplying everything leaves nothing to repay with.
    let result = vault.execute(addr(OPERATOR), &[flash_loan(5_000, vec![supply(6_000)])]);
    assert!(matches!(result.unwrap_err(), VaultError::Ledger(_)));
    assert_eq!(vault.ledger().idle(), 1_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool()), 0);
}

#[test]
fn misbehaving_lender_rolls_back() {
    let lender = Arc::new(MockFlashLender::misbehaving(addr(LENDER)));
    let mut vault = flash_vault(lender.clone());

    let result = vault.execute(addr(OPERATOR), &[flash_loan(5_000, vec![supply(900)])]);
    assert!(matches!(result.unwrap_err(), VaultError::Callback(_)));

    // The first callback's supply was erased along with everything else.
    assert_eq!(vault.ledger().idle(), 1_000);
    assert_eq!(vault.ledger().position(MarketId(1), &pool()), 0);
    assert_eq!(lender.calls.lock().len(), 1);
}

#[test]
fn handler_must_be_registered_before_borrowing() {
    let lender = Arc::new(MockFlashLender::new(addr(LENDER)));
    let mut vault = flash_vault(lender.clone());
    vault
        .update_callback_handler(addr(MANAGER), lender.address(), ON_FLASH_LOAN, None)
        .unwrap();

    let result = vault.execute(addr(OPERATOR), &[flash_loan(100, vec![])]);
    assert!(matches!(result.unwrap_err(), VaultError::Callback(_)));
    assert_eq!(vault.ledger().idle(), 1_000);
}
