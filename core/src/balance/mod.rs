//! # Balance Aggregation — Cross-Market Valuation
//!
//! The accounting core of the vault: each market's valuation is computed
//! by its balance fuse, cached, and summed into the vault's total value.
//! A dependency graph ties markets together so that updating one market
//! also recomputes every market whose valuation depends on it.
//!
//! ```text
//! graph.rs   — directed dependency graph over market ids, BFS closure
//! engine.rs  — cache + recomputation walk + total-value summation
//! ```
//!
//! A broken or missing dependency edge is the most failure-prone part of
//! this design: it produces stale valuations without any error being
//! raised. The closure walk recomputes each market at most once per call,
//! so cycles in the graph terminate; correctness of the edges themselves
//! is a governance responsibility.

pub mod engine;
pub mod graph;

pub use engine::{market_value, total_value, update_markets, BalanceCache, BalanceError, CachedBalance};
pub use graph::DependencyGraph;
