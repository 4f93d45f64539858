//! # Flash-Loan Fuse
//!
//! Borrow, run a nested action list inside the lender's callback, repay
//! with fee — one atomic action. This is the module that exercises the
//! engine's whole re-entrancy story: the fuse delegates control through
//! [`ExecutionContext::call_external`], the lender calls back exactly once
//! with [`ON_FLASH_LOAN`], the handler decodes the nested actions, and the
//! dispatcher re-enters one level deeper with all the usual checks.
//!
//! If anything inside the window fails — a nested action, the repayment,
//! the lender itself — the error propagates out of `enter` unmodified and
//! the facade's snapshot erases the whole attempt, borrowed funds
//! included.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use conduit_core::callback::{CallbackHandler, CallbackSink, ExternalProtocol};
use conduit_core::error::VaultError;
use conduit_core::execute::{Action, ExecutionContext};
use conduit_core::fuse::{ActionFuse, FuseError};
use conduit_core::types::{Address, MarketId, Selector};

/// The callback selector flash lenders present when returning control.
pub const ON_FLASH_LOAN: Selector = Selector::new([0xAB, 0xCD, 0x12, 0x34]);

/// Basis-point denominator for fee math.
const BPS_DENOM: u64 = 10_000;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Parameters for a flash-loan (`enter`) action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlashLoanParams {
    /// Amount of underlying to borrow, in smallest units.
    pub amount: u64,
    /// The action list to run inside the loan window, bincode-encoded so
    /// it can travel through the lender's callback untouched.
    pub actions: Vec<Action>,
}

impl FlashLoanParams {
    /// Encodes the parameters into an action payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("flash-loan params always encode")
    }
}

// ---------------------------------------------------------------------------
// Fuse
// ---------------------------------------------------------------------------

/// Borrows from a flash lender and repays with fee inside one action.
pub struct FlashLoanFuse {
    address: Address,
    market: MarketId,
    lender: Arc<dyn ExternalProtocol>,
    fee_bps: u32,
}

impl FlashLoanFuse {
    /// Creates the fuse against one lender. `fee_bps` must match the
    /// lender's terms; repayment is `amount + amount * fee_bps / 10_000`.
    pub fn new(
        address: Address,
        market: MarketId,
        lender: Arc<dyn ExternalProtocol>,
        fee_bps: u32,
    ) -> Self {
        Self {
            address,
            market,
            lender,
            fee_bps,
        }
    }

    fn fee(&self, amount: u64) -> Result<u64, VaultError> {
        amount
            .checked_mul(u64::from(self.fee_bps))
            .map(|scaled| scaled / BPS_DENOM)
            .ok_or_else(|| {
                FuseError::MalformedPayload(format!("fee overflow on amount {amount}")).into()
            })
    }
}

impl ActionFuse for FlashLoanFuse {
    fn address(&self) -> Address {
        self.address
    }

    fn market(&self) -> MarketId {
        self.market
    }

    fn enter(&self, ctx: &mut ExecutionContext<'_>, payload: &[u8]) -> Result<(), VaultError> {
        let params: FlashLoanParams = bincode::deserialize(payload)
            .map_err(|e| FuseError::MalformedPayload(format!("flash-loan params: {e}")))?;
        let fee = self.fee(params.amount)?;
        let repayment = params.amount.checked_add(fee).ok_or_else(|| {
            FuseError::MalformedPayload(format!("repayment overflow on amount {}", params.amount))
        })?;

        // Loan proceeds land as idle funds; the nested actions deploy them.
        ctx.ledger_mut().deposit_idle(params.amount)?;
        debug!(lender = %self.lender.address(), amount = params.amount, fee, "borrowing");

        let calldata = bincode::serialize(&params.actions)
            .map_err(|e| FuseError::MalformedPayload(format!("nested actions: {e}")))?;
        ctx.call_external(self.lender.as_ref(), &calldata)?;

        // Repay out of whatever idle the nested actions left behind. An
        // insufficient-idle error here fails the whole loan.
        ctx.ledger_mut().withdraw_idle(repayment)?;
        debug!(lender = %self.lender.address(), repayment, "repaid");
        Ok(())
    }

    fn exit(&self, _ctx: &mut ExecutionContext<'_>, _payload: &[u8]) -> Result<(), VaultError> {
        // A flash loan opens and closes within enter; there is nothing to
        // unwind afterwards.
        Err(FuseError::ProtocolRejected("flash-loan fuse has no exit path".into()).into())
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Decodes a flash lender's callback payload into the nested action list.
pub struct FlashLoanHandler {
    address: Address,
}

impl FlashLoanHandler {
    /// Creates the handler module.
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl CallbackHandler for FlashLoanHandler {
    fn address(&self) -> Address {
        self.address
    }

    fn handle(&self, _entry: Selector, payload: &[u8]) -> Result<Vec<Action>, VaultError> {
        bincode::deserialize(payload)
            .map_err(|e| FuseError::MalformedPayload(format!("callback actions: {e}")).into())
    }
}

// ---------------------------------------------------------------------------
// Mock lender
// ---------------------------------------------------------------------------

/// A lender that immediately calls back with the calldata it was handed.
///
/// Stands in for the real protocol in tests and local runs; records every
/// call so assertions can check the delegation actually happened.
pub struct MockFlashLender {
    address: Address,
    /// Calldata of every `call` received, in order.
    pub calls: Mutex<Vec<Vec<u8>>>,
    /// When `true`, call back a second time after the first returns — a
    /// misbehaving lender probing the single-use authorization.
    pub double_callback: bool,
}

impl MockFlashLender {
    /// A well-behaved lender.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            calls: Mutex::new(Vec::new()),
            double_callback: false,
        }
    }

    /// A lender that attempts a second callback.
    pub fn misbehaving(address: Address) -> Self {
        Self {
            double_callback: true,
            ..Self::new(address)
        }
    }
}

impl ExternalProtocol for MockFlashLender {
    fn address(&self) -> Address {
        self.address
    }

    fn call(&self, sink: &mut dyn CallbackSink, calldata: &[u8]) -> Result<(), VaultError> {
        self.calls.lock().push(calldata.to_vec());
        sink.callback(self.address, ON_FLASH_LOAN, calldata)?;
        if self.double_callback {
            sink.callback(self.address, ON_FLASH_LOAN, calldata)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
