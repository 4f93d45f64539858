// Copyright (c) 2026 Conduit Labs. MIT License.
// See LICENSE for details.

//! # Conduit Core — Vault Execution Engine
//!
//! This is the beating heart of Conduit: a single-asset vault core that
//! routes capital into external markets through pluggable strategy
//! modules ("fuses") without ever trusting any of them further than a
//! permission check.
//!
//! Conduit takes a pragmatic stance: every external protocol is assumed
//! hostile, every fuse is assumed buggy, and the engine's job is to make
//! neither assumption matter. Batches are atomic, permissions are exact,
//! and re-entrancy is a narrow, explicitly authorized window rather than
//! a standing door.
//!
//! ## Architecture
//!
//! The engine is split into modules that mirror the actual concerns of an
//! asset-management vault:
//!
//! - **types** — Addresses, market ids, selectors. The vocabulary.
//! - **access** — Role-based authorization with expiring grants.
//! - **substrate** — Typed 32-byte permission targets, granted per market.
//! - **fuse** — The strategy-module traits and their registry.
//! - **ledger** — The balance sheet: idle funds and open positions.
//! - **balance** — Valuation cache, dependency graph, recompute engine.
//! - **callback** — Routing and authorization for re-entrant callbacks.
//! - **execute** — The batch dispatcher and execution context.
//! - **vault** — The facade that ties it all together.
//! - **config** — Engine constants and limits.
//!
//! ## Design Philosophy
//!
//! 1. Correctness over performance (but we're still fast).
//! 2. All arithmetic on funds is checked. Silent wrap is a felony.
//! 3. A failed batch leaves no trace. All or nothing, always.
//! 4. If it touches money, it has tests. Plural.

pub mod access;
pub mod balance;
pub mod callback;
pub mod config;
pub mod error;
pub mod execute;
pub mod fuse;
pub mod ledger;
pub mod substrate;
pub mod types;
pub mod vault;

pub use error::VaultError;
pub use vault::Vault;
