//! # Vault Facade
//!
//! Assembles the registries, the gate, and the mutable state into the one
//! object hosts interact with. Three surfaces:
//!
//! - **Execution** — `execute`, `update_markets_balances`,
//!   `instant_withdraw`, each gated by its own role and wrapped in the
//!   all-or-nothing snapshot.
//! - **Governance** — role grants, fuse/substrate/graph/callback
//!   configuration, all gated by [`Role::FuseManager`] or [`Role::Admin`].
//! - **Queries** — read-only views of total value, per-market value, and
//!   registry membership.
//!
//! Every mutating method takes `&mut self`: the engine is strictly
//! single-threaded and synchronous, and the host platform serializes
//! calls against the vault. Re-entrant nesting happens *inside* a call
//! via the execution context, never through this facade.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::access::{AccessControlGate, Role};
use crate::balance::{self, BalanceError, DependencyGraph};
use crate::callback::{CallbackHandler, CallbackHandlerRegistry, CallbackRegistration};
use crate::error::VaultError;
use crate::execute::{
    self, Action, ExecutionContext, ExecutionPhase, VaultState,
};
use crate::fuse::{ActionFuse, BalanceFuse, FuseRegistry, InstantWithdrawalEntry, RegistryError};
use crate::ledger::VaultLedger;
use crate::substrate::{Substrate, SubstrateRegistry};
use crate::types::{Address, MarketId, Selector};

/// The vault core: registries, gate, graph, and the snapshot-covered
/// mutable state.
pub struct Vault {
    access: AccessControlGate,
    substrates: SubstrateRegistry,
    fuses: FuseRegistry,
    graph: DependencyGraph,
    callbacks: CallbackHandlerRegistry,
    state: VaultState,
}

impl Vault {
    /// Creates an empty vault with a single bootstrap admin.
    pub fn new(root_admin: Address) -> Self {
        Self {
            access: AccessControlGate::new(root_admin),
            substrates: SubstrateRegistry::new(),
            fuses: FuseRegistry::new(),
            graph: DependencyGraph::new(),
            callbacks: CallbackHandlerRegistry::new(),
            state: VaultState::default(),
        }
    }

    // -----------------------------------------------------------------
    // Execution surface
    // -----------------------------------------------------------------

    /// Submits a batch of actions for ordinary execution.
    ///
    /// Operator role only. The batch is atomic: either every action
    /// commits and every touched market is revalued, or the vault's
    /// observable state is byte-identical to before the call.
    ///
    /// # Errors
    ///
    /// Authorization, batch-shape, fuse-resolution, substrate, ledger,
    /// callback, and downstream fuse failures — each aborting the batch
    /// with full rollback and surfacing the originating error unmodified.
    pub fn execute(&mut self, caller: Address, actions: &[Action]) -> Result<(), VaultError> {
        self.access.ensure(Role::Operator, caller)?;
        execute::validate_batch(actions)?;

        let snapshot = self.state.clone();
        let result = self.dispatch_and_recompute(actions);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = snapshot;
                warn!(%caller, error = %err, "batch failed, state rolled back");
                Err(err)
            }
        }
    }

    fn dispatch_and_recompute(&mut self, actions: &[Action]) -> Result<(), VaultError> {
        let mut ctx = ExecutionContext::new(
            &self.fuses,
            &self.substrates,
            &self.callbacks,
            &mut self.state,
        );
        let batch_id = ctx.batch_id();
        execute::run_actions(&mut ctx, actions)?;
        let touched: Vec<MarketId> = ctx.into_touched().into_iter().collect();

        info!(
            batch = %batch_id,
            phase = %ExecutionPhase::BalanceRecompute,
            actions = actions.len(),
            touched = touched.len(),
            "batch dispatched, recomputing touched markets"
        );

        let VaultState { ledger, cache } = &mut self.state;
        balance::update_markets(&self.fuses, &self.graph, ledger, cache, &touched)?;
        Ok(())
    }

    /// Explicitly recomputes the named markets and their dependents.
    ///
    /// Balance-updater role only. Atomic: a failing balance fuse rolls
    /// the cache back rather than leaving a partially refreshed walk.
    pub fn update_markets_balances(
        &mut self,
        caller: Address,
        markets: &[MarketId],
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::BalanceUpdater, caller)?;

        let snapshot = self.state.clone();
        let VaultState { ledger, cache } = &mut self.state;
        match balance::update_markets(&self.fuses, &self.graph, ledger, cache, markets) {
            Ok(updated) => {
                info!(%caller, updated = updated.len(), "explicit balance update");
                Ok(())
            }
            Err(err) => {
                self.state = snapshot;
                warn!(%caller, error = %err, "balance update failed, cache rolled back");
                Err(err)
            }
        }
    }

    /// Raises idle liquidity through the pre-configured instant-withdrawal
    /// order, then recomputes every market it touched.
    ///
    /// Withdrawer role only — this path serves the redemption layer and
    /// runs outside normal operator review, restricted to fuses
    /// explicitly flagged eligible. Returns with at least `amount` idle
    /// on success. If idle funds already cover the request, no fuse is
    /// called.
    pub fn instant_withdraw(&mut self, caller: Address, amount: u64) -> Result<(), VaultError> {
        self.access.ensure(Role::Withdrawer, caller)?;

        if self.state.ledger.idle() >= amount {
            return Ok(());
        }

        let snapshot = self.state.clone();
        let result = self.instant_withdraw_inner(amount);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = snapshot;
                warn!(%caller, error = %err, "instant withdrawal failed, state rolled back");
                Err(err)
            }
        }
    }

    fn instant_withdraw_inner(&mut self, amount: u64) -> Result<(), VaultError> {
        let order = self.fuses.instant_withdrawal_order().to_vec();
        let mut ctx = ExecutionContext::new(
            &self.fuses,
            &self.substrates,
            &self.callbacks,
            &mut self.state,
        );
        execute::run_instant_withdrawal(&mut ctx, &order, amount)?;
        let touched: Vec<MarketId> = ctx.into_touched().into_iter().collect();

        let VaultState { ledger, cache } = &mut self.state;
        balance::update_markets(&self.fuses, &self.graph, ledger, cache, &touched)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Underlying flows (share-token collaborator)
    // -----------------------------------------------------------------

    /// Credits idle underlying. Called by the share-token layer after it
    /// has taken custody of a depositor's funds; that layer is a trusted
    /// collaborator and carries its own authorization.
    pub fn deposit_underlying(&mut self, amount: u64) -> Result<u64, VaultError> {
        Ok(self.state.ledger.deposit_idle(amount)?)
    }

    /// Debits idle underlying for a redemption payout. Pair with
    /// [`instant_withdraw`](Self::instant_withdraw) when idle funds don't
    /// cover the redemption.
    pub fn withdraw_underlying(&mut self, amount: u64) -> Result<u64, VaultError> {
        Ok(self.state.ledger.withdraw_idle(amount)?)
    }

    // -----------------------------------------------------------------
    // Governance surface — roles
    // -----------------------------------------------------------------

    /// Grants a role. Caller must hold the role's admin role.
    pub fn grant_role(
        &mut self,
        caller: Address,
        role: Role,
        account: Address,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), VaultError> {
        Ok(self.access.grant(caller, role, account, expires_at)?)
    }

    /// Revokes a role. Caller must hold the role's admin role.
    pub fn revoke_role(
        &mut self,
        caller: Address,
        role: Role,
        account: Address,
    ) -> Result<(), VaultError> {
        Ok(self.access.revoke(caller, role, account)?)
    }

    // -----------------------------------------------------------------
    // Governance surface — fuses and markets
    // -----------------------------------------------------------------

    /// Registers a list of action fuses. Fuse-manager role only.
    ///
    /// The list registers as a unit: every address is checked against the
    /// registry and against the rest of the list before anything is
    /// inserted, so a rejected list leaves the registry untouched.
    pub fn add_fuses(
        &mut self,
        caller: Address,
        modules: Vec<Arc<dyn ActionFuse>>,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;

        let mut seen: BTreeSet<Address> = BTreeSet::new();
        for module in &modules {
            let address = module.address();
            if self.fuses.is_registered(address) || !seen.insert(address) {
                return Err(RegistryError::FuseAlreadyRegistered(address).into());
            }
        }
        for module in modules {
            self.fuses.add(module)?;
        }
        Ok(())
    }

    /// Deregisters an action fuse. Fuse-manager role only.
    ///
    /// Deliberately does not block removal while the fuse's market still
    /// carries value — governance is expected to close positions first.
    /// The engine logs a warning instead of refusing, so an early removal
    /// is visible without being a dead end.
    pub fn remove_fuse(&mut self, caller: Address, address: Address) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;

        // Look past the enabled flag: a disabled fuse's market can still
        // carry value worth warning about.
        if let Some(market) = self.fuses.market_of(address) {
            let cached = self.state.cache.value(market);
            if cached > 0 {
                warn!(
                    %address,
                    %market,
                    cached,
                    "removing fuse while its market still carries value"
                );
            }
        }
        self.fuses.remove(address)?;
        Ok(())
    }

    /// Enables or disables a registered fuse. Fuse-manager role only.
    pub fn set_fuse_enabled(
        &mut self,
        caller: Address,
        address: Address,
        enabled: bool,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        Ok(self.fuses.set_enabled(address, enabled)?)
    }

    /// Installs a market's balance fuse. Fuse-manager role only.
    pub fn add_balance_fuse(
        &mut self,
        caller: Address,
        module: Arc<dyn BalanceFuse>,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        Ok(self.fuses.set_balance_fuse(module)?)
    }

    /// Removes a market's balance fuse and evicts its cached valuation —
    /// a market without a valuation source contributes nothing to total
    /// value, so a leftover cache entry would only mislead.
    pub fn remove_balance_fuse(
        &mut self,
        caller: Address,
        market: MarketId,
        address: Address,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        self.fuses.remove_balance_fuse(market, address)?;
        self.state.cache.evict(market);
        Ok(())
    }

    /// Flags a fuse as eligible for the instant-withdrawal path.
    pub fn set_instant_withdrawal_eligible(
        &mut self,
        caller: Address,
        address: Address,
        eligible: bool,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        Ok(self
            .fuses
            .set_instant_withdrawal_eligible(address, eligible)?)
    }

    /// Replaces the instant-withdrawal order. Fuse-manager role only.
    pub fn configure_instant_withdrawal_fuses(
        &mut self,
        caller: Address,
        order: Vec<InstantWithdrawalEntry>,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        Ok(self.fuses.set_instant_withdrawal_order(order)?)
    }

    /// Adds substrates to a market's allow-set. Fuse-manager role only.
    pub fn grant_market_substrates(
        &mut self,
        caller: Address,
        market: MarketId,
        substrates: &[Substrate],
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        if substrates.len() > crate::config::MAX_SUBSTRATES_PER_GRANT {
            return Err(crate::substrate::SubstrateError::GrantTooLarge {
                len: substrates.len(),
                max: crate::config::MAX_SUBSTRATES_PER_GRANT,
            }
            .into());
        }
        self.substrates.grant(market, substrates);
        Ok(())
    }

    /// Removes substrates from a market's allow-set. Fuse-manager role
    /// only.
    pub fn revoke_market_substrates(
        &mut self,
        caller: Address,
        market: MarketId,
        substrates: &[Substrate],
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        self.substrates.revoke(market, substrates);
        Ok(())
    }

    /// Replaces dependency edges: for each `(market, dependents)` pair,
    /// the full dependent set of `market`. Fuse-manager role only.
    pub fn update_dependency_graphs(
        &mut self,
        caller: Address,
        edges: Vec<(MarketId, Vec<MarketId>)>,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        for (market, dependents) in edges {
            self.graph.set_dependents(market, dependents);
        }
        Ok(())
    }

    /// Sets or clears the callback handler for a `(protocol, selector)`
    /// pair. Fuse-manager role only.
    pub fn update_callback_handler(
        &mut self,
        caller: Address,
        protocol: Address,
        selector: Selector,
        handler: Option<(Arc<dyn CallbackHandler>, Selector)>,
    ) -> Result<(), VaultError> {
        self.access.ensure(Role::FuseManager, caller)?;
        let registration = handler.map(|(handler, entry)| CallbackRegistration { handler, entry });
        self.callbacks.update(protocol, selector, registration);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------

    /// Total vault value: sum of cached valuations over all markets with
    /// an active balance fuse.
    pub fn total_assets(&self) -> Result<u64, BalanceError> {
        balance::total_value(&self.fuses, &self.state.cache)
    }

    /// Cached valuation of one market, zero if never computed.
    pub fn total_assets_in_market(&self, market: MarketId) -> u64 {
        balance::market_value(&self.state.cache, market)
    }

    /// Is the address a registered, enabled action fuse?
    pub fn is_fuse_supported(&self, address: Address) -> bool {
        self.fuses.is_supported(address)
    }

    /// Is the substrate granted for the market?
    pub fn is_substrate_granted(&self, market: MarketId, substrate: &Substrate) -> bool {
        self.substrates.is_granted(market, substrate)
    }

    /// All substrates granted for a market.
    pub fn granted_substrates(&self, market: MarketId) -> Vec<Substrate> {
        self.substrates.granted(market)
    }

    /// The update sequence number that last wrote a market's cache entry.
    pub fn last_update_seq(&self, market: MarketId) -> Option<u64> {
        self.state.cache.get(market).map(|entry| entry.updated_at_seq)
    }

    /// Does the account currently hold the role?
    pub fn has_role(&self, role: Role, account: Address) -> bool {
        self.access.has_role(role, account)
    }

    /// Read-only view of the balance sheet.
    pub fn ledger(&self) -> &VaultLedger {
        &self.state.ledger
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
