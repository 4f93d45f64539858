//! # Balance Cache & Recomputation Engine
//!
//! Per-market cached valuations plus the walk that refreshes them. The
//! cache is invalidated explicitly, never by time — any age-based
//! staleness policy belongs to the price-oracle collaborator, not here.
//!
//! The update walk is where stale-accounting bugs live, so the rules are
//! strict:
//!
//! - every named market and every transitive dependent is recomputed,
//!   each at most once per call;
//! - a failing balance fuse fails the whole update — the cache is never
//!   silently retained over an error;
//! - two back-to-back updates with no intervening mutation produce
//!   identical values (idempotence).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::graph::DependencyGraph;
use crate::error::VaultError;
use crate::fuse::FuseRegistry;
use crate::ledger::VaultLedger;
use crate::types::MarketId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by aggregation itself (balance-fuse failures propagate
/// as [`VaultError`] unmodified and are not wrapped here).
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Summing market valuations overflowed `u64`. The vault's books
    /// cannot represent its own total value — fail loudly.
    #[error("total value overflow: running total {current}, next market value {next}")]
    ValueOverflow {
        /// Running total before the failed addition.
        current: u64,
        /// Market value that caused the overflow.
        next: u64,
    },
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// One market's last-computed valuation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBalance {
    /// Valuation in underlying smallest units.
    pub value: u64,
    /// The update sequence number that wrote this entry.
    pub updated_at_seq: u64,
    /// Wall-clock timestamp of the write. Informational only — nothing
    /// expires on it.
    pub updated_at: DateTime<Utc>,
}

/// The per-market valuation cache plus its monotone update counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BalanceCache {
    entries: BTreeMap<MarketId, CachedBalance>,
    seq: u64,
}

impl BalanceCache {
    /// Creates an empty cache at sequence zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached entry for a market, if it has ever been computed.
    pub fn get(&self, market: MarketId) -> Option<&CachedBalance> {
        self.entries.get(&market)
    }

    /// The cached value for a market, zero if never computed.
    pub fn value(&self, market: MarketId) -> u64 {
        self.entries.get(&market).map(|e| e.value).unwrap_or(0)
    }

    /// Drops a market's entry (used when its balance fuse is removed).
    pub fn evict(&mut self, market: MarketId) -> Option<CachedBalance> {
        self.entries.remove(&market)
    }

    /// The sequence number of the most recent update call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn begin_update(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn put(&mut self, market: MarketId, value: u64, seq: u64) {
        self.entries.insert(
            market,
            CachedBalance {
                value,
                updated_at_seq: seq,
                updated_at: Utc::now(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Recomputation
// ---------------------------------------------------------------------------

/// Recomputes the named markets and all their transitive dependents.
///
/// Walks the dependency graph's closure of `ids` (each market at most
/// once), invokes each visited market's balance fuse against the ledger,
/// and writes fresh cache entries under a single new sequence number.
/// Markets without a balance fuse are walked (their dependents may have
/// one) but contribute no cache entry.
///
/// Returns the markets whose cache entries were rewritten, in walk order.
///
/// # Errors
///
/// Any balance-fuse failure aborts the whole update and propagates
/// unmodified. The caller is responsible for snapshot rollback so that a
/// partial walk is never observable.
pub fn update_markets(
    fuses: &FuseRegistry,
    graph: &DependencyGraph,
    ledger: &VaultLedger,
    cache: &mut BalanceCache,
    ids: &[MarketId],
) -> Result<Vec<MarketId>, VaultError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let closure = graph.closure(ids);
    let seq = cache.begin_update();
    let mut updated = Vec::new();

    for market in closure {
        let Some(fuse) = fuses.balance_fuse(market) else {
            debug!(%market, "no balance fuse, skipping valuation");
            continue;
        };
        let value = fuse.balance_of(ledger)?;
        let previous = cache.value(market);
        cache.put(market, value, seq);
        updated.push(market);
        debug!(%market, previous, value, seq, "market valuation refreshed");
    }

    if updated.is_empty() {
        warn!(?ids, "balance update touched no valued market");
    }
    Ok(updated)
}

/// Sum of cached valuations over all markets with an active balance fuse.
///
/// Markets whose fuse exists but has never been computed count as zero.
///
/// # Errors
///
/// Returns [`BalanceError::ValueOverflow`] if the sum exceeds `u64::MAX`.
pub fn total_value(fuses: &FuseRegistry, cache: &BalanceCache) -> Result<u64, BalanceError> {
    let mut total: u64 = 0;
    for market in fuses.valued_markets() {
        let value = cache.value(market);
        total = total
            .checked_add(value)
            .ok_or(BalanceError::ValueOverflow {
                current: total,
                next: value,
            })?;
    }
    Ok(total)
}

/// The cached valuation of one market, zero if never computed.
pub fn market_value(cache: &BalanceCache, market: MarketId) -> u64 {
    cache.value(market)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
