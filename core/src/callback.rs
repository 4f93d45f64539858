//! # Callback Routing — Safe Re-Entrant Execution
//!
//! Some strategies hand control to an external protocol mid-action and
//! expect it to call back before the action returns — flash loans are the
//! canonical case: borrow, run nested actions, repay, all inside one
//! atomic external callback. The vault core knows nothing about flash
//! loans; it knows how to authorize and route a callback.
//!
//! Two pieces:
//!
//! - **[`CallbackHandlerRegistry`]** — durable configuration mapping
//!   `(external protocol address, callback selector)` to a handler module
//!   and the entry selector to invoke on it.
//! - **[`CallbackAuthorization`]** — ephemeral, frame-scoped state set
//!   immediately before control is delegated and restored immediately
//!   after the external call returns. It never persists across top-level
//!   calls: a callback matching a registered pair succeeds only while its
//!   authorizing action is in flight, and each authorization admits
//!   exactly one callback.
//!
//! A callback with no pending authorization, from the wrong caller, or
//! for an unregistered pair is always fatal and never retried.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::MAX_CALLBACK_DEPTH;
use crate::error::VaultError;
use crate::execute::Action;
use crate::types::{Address, Selector};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Re-entrancy violations and callback-routing failures.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// A callback arrived with no pending authorization, or from a
    /// different party than the one control was delegated to.
    #[error("unexpected callback from {caller} with selector {selector}")]
    UnexpectedCallback {
        /// The party that attempted the callback.
        caller: Address,
        /// The selector it presented.
        selector: Selector,
    },

    /// The `(protocol, selector)` pair has no registered handler.
    #[error("no callback handler registered for {protocol} selector {selector}")]
    NoHandlerRegistered {
        /// The external protocol that called back.
        protocol: Address,
        /// The selector it presented.
        selector: Selector,
    },

    /// Nested re-entry exceeded the configured depth cap.
    #[error("callback nesting exceeded maximum depth {0}")]
    MaxDepthExceeded(usize),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A registered module that interprets one protocol's callback payload.
///
/// The handler decodes the application-specific payload into a further
/// action list; the dispatcher then re-enters with the same fuse-approval
/// and substrate checks as top-level dispatch. No bypass exists for
/// callback-triggered actions.
pub trait CallbackHandler: Send + Sync {
    /// The handler module's identity.
    fn address(&self) -> Address;

    /// Decodes the callback payload into the nested action list.
    ///
    /// `entry` is the entry selector configured at registration time,
    /// letting one handler module serve several protocols with distinct
    /// payload encodings.
    fn handle(&self, entry: Selector, payload: &[u8]) -> Result<Vec<Action>, VaultError>;
}

/// The interface an external protocol presents to the engine.
///
/// `call` receives a [`CallbackSink`] through which the protocol may call
/// back into the vault exactly once while the call is in flight. The sink
/// is the only route back in — there is no ambient vault handle to
/// capture.
pub trait ExternalProtocol: Send + Sync {
    /// The protocol's on-vault identity; callbacks are authorized against
    /// it.
    fn address(&self) -> Address;

    /// Synchronously performs the protocol's side of the interaction,
    /// optionally calling back through `sink` before returning.
    fn call(&self, sink: &mut dyn CallbackSink, calldata: &[u8]) -> Result<(), VaultError>;
}

/// The vault-side surface an external protocol calls back through.
///
/// Implemented by the execution context; rejects anything outside the
/// authorization window.
pub trait CallbackSink {
    /// Routes a callback: authorizes `caller`, resolves the handler for
    /// `(caller, selector)`, decodes `payload` into nested actions, and
    /// re-enters the dispatcher one level deeper.
    fn callback(
        &mut self,
        caller: Address,
        selector: Selector,
        payload: &[u8],
    ) -> Result<(), VaultError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A registered `(handler module, entry selector)` pair.
#[derive(Clone)]
pub struct CallbackRegistration {
    /// The handler module to invoke.
    pub handler: Arc<dyn CallbackHandler>,
    /// The entry selector passed to the handler.
    pub entry: Selector,
}

/// Durable mapping from `(protocol, selector)` to its handler.
#[derive(Clone, Default)]
pub struct CallbackHandlerRegistry {
    handlers: BTreeMap<(Address, Selector), CallbackRegistration>,
}

impl CallbackHandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears the handler for a `(protocol, selector)` pair.
    /// `None` removes any existing registration.
    pub fn update(
        &mut self,
        protocol: Address,
        selector: Selector,
        registration: Option<CallbackRegistration>,
    ) {
        match registration {
            Some(reg) => {
                let handler = reg.handler.address();
                self.handlers.insert((protocol, selector), reg);
                info!(%protocol, %selector, %handler, "callback handler registered");
            }
            None => {
                self.handlers.remove(&(protocol, selector));
                info!(%protocol, %selector, "callback handler cleared");
            }
        }
    }

    /// Resolves the handler for a pair, if registered.
    pub fn resolve(&self, protocol: Address, selector: Selector) -> Option<&CallbackRegistration> {
        self.handlers.get(&(protocol, selector))
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// The ephemeral single-slot authorization for one pending external call.
///
/// Created immediately before delegating control, consumed by the first
/// matching callback, restored to the previous frame's slot when the
/// external call returns. Never stored on the vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackAuthorization {
    /// The external protocol control was delegated to. Only this party
    /// may call back.
    pub protocol: Address,
    /// Dispatch depth of the delegating action.
    pub depth: usize,
}

impl CallbackAuthorization {
    /// Checks the proposed nesting depth against the engine cap.
    pub fn check_depth(depth: usize) -> Result<(), CallbackError> {
        if depth >= MAX_CALLBACK_DEPTH {
            Err(CallbackError::MaxDepthExceeded(MAX_CALLBACK_DEPTH))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
