//! # Engine Configuration & Constants
//!
//! Every magic number in the vault core lives here. If you're hardcoding a
//! constant somewhere else, you're doing it wrong and you owe the team
//! coffee.
//!
//! These limits are defensive caps, not tuning knobs — raising them after
//! deployment changes the worst-case work a single call can perform, so
//! treat every change as a review-worthy event.

// ---------------------------------------------------------------------------
// Identifier Layout
// ---------------------------------------------------------------------------

/// Byte length of an [`Address`](crate::types::Address). Modules, accounts,
/// and external protocols all use the same 20-byte identity space.
pub const ADDRESS_LENGTH: usize = 20;

/// Byte length of a callback [`Selector`](crate::types::Selector).
pub const SELECTOR_LENGTH: usize = 4;

/// Total byte length of an encoded [`Substrate`](crate::substrate::Substrate).
pub const SUBSTRATE_LENGTH: usize = 32;

/// Byte length of a substrate payload. One byte of the 32 is the kind tag;
/// the rest is kind-specific payload.
pub const SUBSTRATE_PAYLOAD_LENGTH: usize = SUBSTRATE_LENGTH - 1;

// ---------------------------------------------------------------------------
// Execution Limits
// ---------------------------------------------------------------------------

/// Maximum number of actions a single batch may carry.
///
/// A batch is all-or-nothing, so an oversized batch holds the whole vault's
/// rollback snapshot hostage for its full duration. 64 is comfortably above
/// anything a sane rebalance needs.
pub const MAX_BATCH_ACTIONS: usize = 64;

/// Maximum re-entrant callback nesting depth.
///
/// Each external callback re-enters the dispatcher one level deeper
/// (a flash loan whose nested actions take another flash loan, and so on).
/// Legitimate strategies rarely need more than two levels.
pub const MAX_CALLBACK_DEPTH: usize = 4;

/// Maximum number of substrates a single grant call may submit.
pub const MAX_SUBSTRATES_PER_GRANT: usize = 128;

// ---------------------------------------------------------------------------
// Engine Version
// ---------------------------------------------------------------------------

/// Engine version string, taken from the crate version at compile time.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
