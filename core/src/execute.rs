//! # Fuse Execution Dispatcher
//!
//! The syscall layer of the vault: an ordered list of `(module, payload)`
//! actions, validated against the fuse registry, run in the vault's own
//! state context, followed by balance recomputation over every touched
//! market. All-or-nothing — the facade snapshots mutable state before
//! dispatch and restores it on any failure, so a failed batch leaves the
//! vault byte-identical to before the call.
//!
//! ## State Machine
//!
//! A single top-level batch moves through
//! `Idle → Authorizing → Dispatching(i) → [AwaitingCallback →
//! ResumedDispatching] → BalanceRecompute → Idle`, with any failure
//! transitioning straight back to `Idle` under rollback. The phases exist
//! as tracing structure, not as a runtime interlock — the engine is
//! single-threaded and the transitions are the code path itself.
//!
//! ## Re-Entrancy
//!
//! [`ExecutionContext::call_external`] is the only gate to the outside
//! world. It stacks a frame-scoped [`CallbackAuthorization`], hands the
//! protocol a [`CallbackSink`], and restores the previous frame's slot on
//! return — success or failure. Nested dispatch triggered by a callback
//! runs through the same validation as top-level dispatch.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balance::BalanceCache;
use crate::callback::{
    CallbackAuthorization, CallbackHandlerRegistry, CallbackError, CallbackSink,
    ExternalProtocol,
};
use crate::config::MAX_BATCH_ACTIONS;
use crate::error::VaultError;
use crate::fuse::{FuseRegistry, InstantWithdrawalEntry};
use crate::ledger::VaultLedger;
use crate::substrate::{Substrate, SubstrateError, SubstrateRegistry};
use crate::types::{Address, MarketId, Selector};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Batch-level dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An empty batch is a no-op and almost certainly a caller bug.
    #[error("empty action batch")]
    EmptyBatch,

    /// The batch exceeds the configured action cap.
    #[error("batch of {len} actions exceeds maximum {max}")]
    BatchTooLarge {
        /// Number of actions submitted.
        len: usize,
        /// The configured cap.
        max: usize,
    },

    /// The instant-withdrawal order was exhausted before enough idle
    /// liquidity was raised.
    #[error("instant withdrawal raised {available} of {requested} requested")]
    InsufficientInstantLiquidity {
        /// Amount of idle liquidity required.
        requested: u64,
        /// Idle liquidity available after exhausting the order.
        available: u64,
    },
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Which fuse entry point an action invokes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuseMethod {
    /// Deploy capital / open a position.
    Enter,
    /// Unwind capital / close a position.
    Exit,
}

/// One step of a batch: an approved module plus an opaque payload only
/// that module knows how to decode.
///
/// Serializable so that nested action lists can travel inside callback
/// payloads (bincode) and batches can be logged or replayed (JSON).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    /// Address of the fuse to invoke.
    pub fuse: Address,
    /// Entry point to call on it.
    pub method: FuseMethod,
    /// Opaque, fuse-specific parameters.
    pub payload: Vec<u8>,
}

/// Tracing-visible batch phases. See the module docs for the transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPhase {
    /// No batch in flight.
    Idle,
    /// Role check in progress.
    Authorizing,
    /// Running action `index` at nesting `depth`.
    Dispatching {
        /// Zero-based action index within its list.
        index: usize,
        /// Callback nesting depth (0 = top level).
        depth: usize,
    },
    /// Control delegated to an external protocol.
    AwaitingCallback {
        /// Depth of the delegating action.
        depth: usize,
    },
    /// Recomputing touched markets.
    BalanceRecompute,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPhase::Idle => write!(f, "Idle"),
            ExecutionPhase::Authorizing => write!(f, "Authorizing"),
            ExecutionPhase::Dispatching { index, depth } => {
                write!(f, "Dispatching(i={index}, depth={depth})")
            }
            ExecutionPhase::AwaitingCallback { depth } => {
                write!(f, "AwaitingCallback(depth={depth})")
            }
            ExecutionPhase::BalanceRecompute => write!(f, "BalanceRecompute"),
        }
    }
}

// ---------------------------------------------------------------------------
// VaultState
// ---------------------------------------------------------------------------

/// The mutable state covered by the all-or-nothing guarantee: the ledger
/// and the valuation cache. Registries are configuration and are never
/// mutated during dispatch, so they sit outside the snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultState {
    /// The vault's balance sheet.
    pub ledger: VaultLedger,
    /// Cached per-market valuations.
    pub cache: BalanceCache,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// The capability handle injected into every fuse call.
///
/// Holding one means "you are the vault, for the duration of this action":
/// mutable ledger access, the substrate-permission lookup the fuse is
/// obligated to consult, the external-call gateway, and touched-market
/// tracking for the post-batch recompute. Fuses never see the registries
/// they are validated against.
pub struct ExecutionContext<'a> {
    fuses: &'a FuseRegistry,
    substrates: &'a SubstrateRegistry,
    callbacks: &'a CallbackHandlerRegistry,
    state: &'a mut VaultState,
    touched: BTreeSet<MarketId>,
    depth: usize,
    pending: Option<CallbackAuthorization>,
    batch_id: Uuid,
}

impl<'a> ExecutionContext<'a> {
    /// Builds a fresh context for one top-level call.
    pub fn new(
        fuses: &'a FuseRegistry,
        substrates: &'a SubstrateRegistry,
        callbacks: &'a CallbackHandlerRegistry,
        state: &'a mut VaultState,
    ) -> Self {
        Self {
            fuses,
            substrates,
            callbacks,
            state,
            touched: BTreeSet::new(),
            depth: 0,
            pending: None,
            batch_id: Uuid::new_v4(),
        }
    }

    /// Read access to the vault's balance sheet.
    pub fn ledger(&self) -> &VaultLedger {
        &self.state.ledger
    }

    /// Mutable access to the vault's balance sheet — the capability that
    /// lets a fuse move vault-owned assets.
    pub fn ledger_mut(&mut self) -> &mut VaultLedger {
        &mut self.state.ledger
    }

    /// Is `substrate` granted for `market`? Non-failing form.
    pub fn is_granted(&self, market: MarketId, substrate: &Substrate) -> bool {
        self.substrates.is_granted(market, substrate)
    }

    /// The check every fuse must run before touching a substrate.
    ///
    /// # Errors
    ///
    /// Returns [`SubstrateError::NotGranted`] — fatal to the batch — if
    /// the substrate is not in the market's allow-set.
    pub fn require_granted(
        &self,
        market: MarketId,
        substrate: &Substrate,
    ) -> Result<(), VaultError> {
        if self.substrates.is_granted(market, substrate) {
            Ok(())
        } else {
            Err(SubstrateError::NotGranted {
                market,
                substrate: *substrate,
            }
            .into())
        }
    }

    /// Marks a market as touched so the post-batch recompute covers it.
    /// The dispatcher touches each action's declared market automatically;
    /// fuses that reach into additional markets must touch those
    /// themselves.
    pub fn touch(&mut self, market: MarketId) {
        self.touched.insert(market);
    }

    /// Current callback nesting depth (0 = top level).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Correlation id for this top-level call, for log stitching.
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Delegates control to an external protocol, authorizing exactly one
    /// callback from it while the call is in flight.
    ///
    /// The previous frame's authorization slot is saved and restored
    /// around the call — on success and on failure alike — so the window
    /// closes the instant the external call returns.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::MaxDepthExceeded`] if another nesting
    /// level would break the cap; otherwise whatever the protocol or its
    /// callback-triggered nested dispatch returns.
    pub fn call_external(
        &mut self,
        protocol: &dyn ExternalProtocol,
        calldata: &[u8],
    ) -> Result<(), VaultError> {
        CallbackAuthorization::check_depth(self.depth)?;

        let auth = CallbackAuthorization {
            protocol: protocol.address(),
            depth: self.depth,
        };
        debug!(
            batch = %self.batch_id,
            phase = %ExecutionPhase::AwaitingCallback { depth: self.depth },
            protocol = %auth.protocol,
            "delegating control to external protocol"
        );

        let previous = self.pending.replace(auth);
        let result = protocol.call(self, calldata);
        self.pending = previous;

        debug!(
            batch = %self.batch_id,
            protocol = %auth.protocol,
            ok = result.is_ok(),
            "external protocol returned"
        );
        result
    }

    /// Consumes the context, yielding the set of touched markets.
    pub fn into_touched(self) -> BTreeSet<MarketId> {
        self.touched
    }
}

impl CallbackSink for ExecutionContext<'_> {
    fn callback(
        &mut self,
        caller: Address,
        selector: Selector,
        payload: &[u8],
    ) -> Result<(), VaultError> {
        // Single-use authorization: taken, not peeked. A second callback
        // from the same delegation finds the slot empty and fails.
        let auth = self.pending.take().ok_or(CallbackError::UnexpectedCallback {
            caller,
            selector,
        })?;
        if auth.protocol != caller {
            return Err(CallbackError::UnexpectedCallback { caller, selector }.into());
        }

        let registration = self
            .callbacks
            .resolve(caller, selector)
            .ok_or(CallbackError::NoHandlerRegistered {
                protocol: caller,
                selector,
            })?
            .clone();

        debug!(
            batch = %self.batch_id,
            protocol = %caller,
            %selector,
            handler = %registration.handler.address(),
            depth = self.depth,
            "callback authorized, re-entering dispatcher"
        );

        let actions = registration.handler.handle(registration.entry, payload)?;

        self.depth += 1;
        let result = run_actions(self, &actions);
        self.depth -= 1;
        result
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Validates a batch's shape before any state is touched.
pub fn validate_batch(actions: &[Action]) -> Result<(), DispatchError> {
    if actions.is_empty() {
        return Err(DispatchError::EmptyBatch);
    }
    if actions.len() > MAX_BATCH_ACTIONS {
        return Err(DispatchError::BatchTooLarge {
            len: actions.len(),
            max: MAX_BATCH_ACTIONS,
        });
    }
    Ok(())
}

/// Runs an action list in order against the context.
///
/// Each action resolves its fuse through the registry (unsupported or
/// disabled fuses abort the batch), has its declared market marked
/// touched, and is invoked with the context as its capability handle.
/// Called at depth 0 by the facade and recursively by callback routing.
///
/// # Errors
///
/// The first failing action aborts the list; the originating error
/// propagates unmodified. Rollback is the caller's responsibility.
pub fn run_actions(ctx: &mut ExecutionContext<'_>, actions: &[Action]) -> Result<(), VaultError> {
    for (index, action) in actions.iter().enumerate() {
        debug!(
            batch = %ctx.batch_id,
            phase = %ExecutionPhase::Dispatching { index, depth: ctx.depth },
            fuse = %action.fuse,
            method = ?action.method,
            "dispatching action"
        );

        let fuse = ctx.fuses.resolve(action.fuse)?;
        ctx.touch(fuse.market());

        match action.method {
            FuseMethod::Enter => fuse.enter(ctx, &action.payload)?,
            FuseMethod::Exit => fuse.exit(ctx, &action.payload)?,
        }
    }
    Ok(())
}

/// Runs the pre-configured instant-withdrawal order until idle liquidity
/// covers `amount`.
///
/// Every entry must name a supported, instant-eligible fuse — this path
/// runs outside normal operator review, so eligibility is re-checked at
/// run time even though configuration already validated it. Each step's
/// payload is the still-missing amount (8 bytes, big-endian) followed by
/// the entry's static params.
///
/// # Errors
///
/// Returns [`DispatchError::InsufficientInstantLiquidity`] if the order
/// is exhausted short of the target; fuse and registry failures propagate
/// unmodified.
pub fn run_instant_withdrawal(
    ctx: &mut ExecutionContext<'_>,
    order: &[InstantWithdrawalEntry],
    amount: u64,
) -> Result<(), VaultError> {
    for (index, step) in order.iter().enumerate() {
        let available = ctx.ledger().idle();
        if available >= amount {
            break;
        }

        let fuse = ctx.fuses.resolve(step.fuse)?;
        if !ctx.fuses.is_instant_withdrawal_eligible(step.fuse) {
            return Err(crate::fuse::RegistryError::NotInstantEligible(step.fuse).into());
        }

        let missing = amount - available;
        let mut payload = Vec::with_capacity(8 + step.params.len());
        payload.extend_from_slice(&missing.to_be_bytes());
        payload.extend_from_slice(&step.params);

        debug!(
            batch = %ctx.batch_id,
            phase = %ExecutionPhase::Dispatching { index, depth: 0 },
            fuse = %step.fuse,
            missing,
            "instant-withdrawal exit"
        );

        ctx.touch(fuse.market());
        fuse.exit(ctx, &payload)?;
    }

    let available = ctx.ledger().idle();
    if available < amount {
        warn!(
            batch = %ctx.batch_id,
            requested = amount,
            available,
            "instant-withdrawal order exhausted short of target"
        );
        return Err(DispatchError::InsufficientInstantLiquidity {
            requested: amount,
            available,
        }
        .into());
    }
    Ok(())
}

/// Decodes the amount prefix of an instant-withdrawal payload, returning
/// the amount and the static parameter tail. Helper for fuses serving
/// that path.
pub fn decode_instant_payload(payload: &[u8]) -> Result<(u64, &[u8]), VaultError> {
    if payload.len() < 8 {
        return Err(crate::fuse::FuseError::MalformedPayload(
            "instant-withdrawal payload shorter than amount prefix".into(),
        )
        .into());
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&payload[..8]);
    Ok((u64::from_be_bytes(prefix), &payload[8..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
