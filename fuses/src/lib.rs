// Copyright (c) 2026 Conduit Labs. MIT License.
// See LICENSE for details.

//! # Conduit Fuses
//!
//! Strategy modules for the Conduit vault engine. These are the pluggable
//! halves of the system: the engine in `conduit-core` decides *whether* an
//! action may run; the fuses here decide *what* running it means for one
//! concrete external protocol:
//!
//! - **Lending** — supply/withdraw against a pool-style lending market,
//!   with a balance fuse that marks positions up by an accrual rate.
//! - **Flash Loan** — borrow, run a nested action list inside the lender's
//!   callback, repay with fee, all within one atomic action.
//!
//! ## Design Principles
//!
//! 1. A fuse checks its substrates before moving a single unit. The
//!    engine enforces nothing on its behalf.
//! 2. All monetary operations use checked arithmetic — wrapping math and
//!    money do not mix.
//! 3. Payloads are bincode: compact, versioned by struct shape, and the
//!    same encoding nested action lists already travel in.

pub mod flashloan;
pub mod lending;
