//! # Dependency Graph over Markets
//!
//! Edge `M → D` means "valuation of market D depends on state in market
//! M" — shared collateral, cross-margined positions, a reward gauge whose
//! value tracks another market's pool. Stored as an adjacency map from
//! market id to the set of dependent market ids.
//!
//! The structure does not enforce acyclicity. Instead,
//! [`DependencyGraph::closure`] is a mark-and-sweep breadth-first walk
//! that visits each market at most once,
//! so recomputation terminates even when governance configures a cycle.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::MarketId;

/// Adjacency map: market → markets whose valuation depends on it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    dependents: BTreeMap<MarketId, BTreeSet<MarketId>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the full dependent set of one market. An empty set clears
    /// the market's node.
    pub fn set_dependents(&mut self, market: MarketId, dependents: Vec<MarketId>) {
        if dependents.is_empty() {
            self.dependents.remove(&market);
        } else {
            self.dependents
                .insert(market, dependents.into_iter().collect());
        }
    }

    /// The markets directly dependent on `market`, in ascending order.
    pub fn dependents_of(&self, market: MarketId) -> Vec<MarketId> {
        self.dependents
            .get(&market)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The transitive closure of `seeds` under the dependency relation,
    /// in breadth-first discovery order with seeds first.
    ///
    /// Mark-and-sweep over a visited set: each market appears at most
    /// once, so the walk terminates on cyclic graphs. Duplicate seeds are
    /// collapsed.
    pub fn closure(&self, seeds: &[MarketId]) -> Vec<MarketId> {
        let mut visited: BTreeSet<MarketId> = BTreeSet::new();
        let mut order: Vec<MarketId> = Vec::new();
        let mut queue: VecDeque<MarketId> = VecDeque::new();

        for seed in seeds {
            if visited.insert(*seed) {
                order.push(*seed);
                queue.push_back(*seed);
            }
        }

        while let Some(market) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(&market) {
                for dependent in dependents {
                    if visited.insert(*dependent) {
                        order.push(*dependent);
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        order
    }
}
