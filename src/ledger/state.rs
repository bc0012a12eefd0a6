//! Position ledger: per-user positions, whitelists and the atomic reallocate call.
//!
//! Every mutating call runs against a draft copy of the ledger world
//! (positions, whitelists, token book, vault share books) and the draft
//! replaces the live state only when every step succeeded. Events raised by
//! the call are buffered in the draft and appended to the log on commit, so a
//! reverted call leaves nothing behind, not even an event.
//!
//! The write lock is held for the full call, so two calls against the same
//! position are strictly ordered and the second one validates against the
//! first one's committed result.

use super::error::LedgerError;
use super::router::SwapRouter;
use super::token::TokenBook;
use super::types::{LedgerEvent, Position, ReallocateParams, VaultInfo};
use super::vault::VaultGateway;
use alloy_primitives::{Address, U256};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Maximum withdrawal fee governance may set (5%).
pub const MAX_FEE_BPS: u32 = 500;

const BPS_DENOMINATOR: u32 = 10_000;

/// Address set with O(1) membership that remembers first-insertion order.
#[derive(Debug, Clone, Default)]
struct Whitelist {
    members: HashMap<Address, bool>,
    order: Vec<Address>,
}

impl Whitelist {
    /// Returns true when membership changed.
    fn set(&mut self, address: Address, allowed: bool) -> bool {
        match self.members.insert(address, allowed) {
            Some(previous) => previous != allowed,
            None => {
                self.order.push(address);
                allowed
            }
        }
    }

    fn contains(&self, address: &Address) -> bool {
        self.members.get(address).copied().unwrap_or(false)
    }

    fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.order.iter().copied().filter(|a| self.contains(a))
    }
}

#[derive(Debug, Clone)]
struct LedgerState {
    owner: Address,
    paused: bool,
    fee_bps: u32,
    vault_whitelist: Whitelist,
    router_whitelist: Whitelist,
    operators: HashSet<Address>,
    positions: HashMap<Address, Vec<Position>>,
    /// Users in order of their first deposit
    users: Vec<Address>,
    vaults: HashMap<Address, Box<dyn VaultGateway>>,
    routers: HashMap<Address, Box<dyn SwapRouter>>,
    tokens: TokenBook,
    /// Events raised by the call in progress; empty between calls
    pending: Vec<LedgerEvent>,
}

impl LedgerState {
    fn new(owner: Address) -> Self {
        Self {
            owner,
            paused: false,
            fee_bps: 0,
            vault_whitelist: Whitelist::default(),
            router_whitelist: Whitelist::default(),
            operators: HashSet::new(),
            positions: HashMap::new(),
            users: Vec::new(),
            vaults: HashMap::new(),
            routers: HashMap::new(),
            tokens: TokenBook::new(),
            pending: Vec::new(),
        }
    }

    fn ensure_not_paused(&self) -> Result<(), LedgerError> {
        if self.paused {
            return Err(LedgerError::Paused);
        }
        Ok(())
    }

    fn ensure_owner(&self, caller: Address) -> Result<(), LedgerError> {
        if caller != self.owner {
            return Err(LedgerError::Unauthorized { caller });
        }
        Ok(())
    }

    fn ensure_vault_whitelisted(&self, vault: Address) -> Result<(), LedgerError> {
        if !self.vault_whitelist.contains(&vault) {
            return Err(LedgerError::VaultNotWhitelisted(vault));
        }
        if !self.vaults.contains_key(&vault) {
            return Err(LedgerError::UnknownVault(vault));
        }
        Ok(())
    }

    fn active_position(&self, user: Address, index: usize) -> Result<Position, LedgerError> {
        let positions = self.positions.get(&user).map(Vec::as_slice).unwrap_or(&[]);
        let position = positions
            .get(index)
            .ok_or(LedgerError::InvalidPositionIndex {
                index,
                len: positions.len(),
            })?;
        if !position.active {
            return Err(LedgerError::InactivePosition { index });
        }
        Ok(position.clone())
    }

    fn store_position(&mut self, user: Address, index: usize, position: Position) {
        if let Some(slot) = self
            .positions
            .get_mut(&user)
            .and_then(|positions| positions.get_mut(index))
        {
            *slot = position;
        }
    }

    fn valuation(&self, vault: Address, shares: U256) -> U256 {
        self.vaults
            .get(&vault)
            .map(|v| v.convert_to_assets(&self.tokens, shares))
            .unwrap_or(U256::ZERO)
    }

    fn deposit(
        &mut self,
        this: Address,
        caller: Address,
        vault: Address,
        amount: U256,
        min_shares_out: U256,
    ) -> Result<U256, LedgerError> {
        self.ensure_not_paused()?;
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        self.ensure_vault_whitelisted(vault)?;

        let gateway = self
            .vaults
            .get_mut(&vault)
            .ok_or(LedgerError::UnknownVault(vault))?;
        let asset = gateway.asset();

        let before = self.tokens.balance_of(asset, this);
        self.tokens
            .transfer_from(asset, this, caller, this, amount)?;
        let received = self.tokens.balance_of(asset, this) - before;

        let shares = gateway.deposit(&mut self.tokens, this, received, this)?;
        if shares < min_shares_out {
            return Err(LedgerError::SlippageExceeded {
                kind: "shares",
                minimum: min_shares_out,
                actual: shares,
            });
        }
        let assets = gateway.convert_to_assets(&self.tokens, shares);

        let positions = self.positions.entry(caller).or_default();
        if positions.is_empty() && !self.users.contains(&caller) {
            self.users.push(caller);
        }
        positions.push(Position {
            vault,
            asset,
            shares,
            assets,
            active: true,
        });
        let index = positions.len() - 1;

        self.pending.push(LedgerEvent::PositionOpened {
            user: caller,
            index,
            vault,
            assets,
            shares,
        });

        Ok(shares)
    }

    fn withdraw(
        &mut self,
        this: Address,
        caller: Address,
        index: usize,
        shares: U256,
        min_assets_out: U256,
    ) -> Result<U256, LedgerError> {
        self.ensure_not_paused()?;
        let mut position = self.active_position(caller, index)?;
        if shares.is_zero() || shares > position.shares {
            return Err(LedgerError::InvalidShareAmount {
                requested: shares,
                available: position.shares,
            });
        }
        self.ensure_vault_whitelisted(position.vault)?;

        let gateway = self
            .vaults
            .get_mut(&position.vault)
            .ok_or(LedgerError::UnknownVault(position.vault))?;
        let redeemed = gateway.redeem(&mut self.tokens, shares, this, this)?;

        let fee = redeemed * U256::from(self.fee_bps) / U256::from(BPS_DENOMINATOR);
        let net = redeemed - fee;
        if net < min_assets_out {
            return Err(LedgerError::SlippageExceeded {
                kind: "assets",
                minimum: min_assets_out,
                actual: net,
            });
        }

        self.tokens.transfer(position.asset, this, caller, net)?;
        if !fee.is_zero() {
            self.tokens.transfer(position.asset, this, self.owner, fee)?;
        }

        position.shares -= shares;
        position.assets = self.valuation(position.vault, position.shares);
        let closed = position.shares.is_zero();
        if closed {
            position.active = false;
            position.assets = U256::ZERO;
        }
        self.store_position(caller, index, position);

        self.pending.push(LedgerEvent::Withdrawn {
            user: caller,
            index,
            shares,
            assets: net,
            fee,
        });
        if closed {
            self.pending.push(LedgerEvent::PositionClosed {
                user: caller,
                index,
            });
        }

        Ok(net)
    }

    fn reallocate(
        &mut self,
        this: Address,
        caller: Address,
        user: Address,
        index: usize,
        params: &ReallocateParams,
    ) -> Result<U256, LedgerError> {
        self.ensure_not_paused()?;
        if caller != user && !self.operators.contains(&caller) {
            return Err(LedgerError::Unauthorized { caller });
        }
        let legs = params.legs()?;
        let target = params.target_vault;

        // 1. Validate target and position
        self.ensure_vault_whitelisted(target)?;
        let mut position = self.active_position(user, index)?;
        if position.vault == target {
            return Err(LedgerError::SameVault(target));
        }
        self.ensure_vault_whitelisted(position.vault)?;

        let source_asset = position.asset;
        let target_asset = self
            .vaults
            .get(&target)
            .map(|v| v.asset())
            .ok_or(LedgerError::UnknownVault(target))?;
        if legs.is_empty() && source_asset != target_asset {
            return Err(LedgerError::AssetMismatch {
                expected: target_asset,
                actual: source_asset,
            });
        }

        let source_before = self.tokens.balance_of(source_asset, this);
        let target_before = self.tokens.balance_of(target_asset, this);

        // 2. Redeem everything from the source vault
        let source = self
            .vaults
            .get_mut(&position.vault)
            .ok_or(LedgerError::UnknownVault(position.vault))?;
        let redeemed = source.redeem(&mut self.tokens, position.shares, this, this)?;

        // 3. Swap legs
        for (i, leg) in legs.iter().enumerate() {
            if !self.router_whitelist.contains(&leg.router) {
                return Err(LedgerError::RouterNotWhitelisted(leg.router));
            }
            let router = self
                .routers
                .get(&leg.router)
                .ok_or(LedgerError::UnknownRouter(leg.router))?;

            self.tokens
                .approve(leg.input_token, this, leg.router, leg.input_amount);
            let out = router
                .execute(
                    &mut self.tokens,
                    this,
                    &leg.calldata,
                    leg.input_token,
                    leg.output_token,
                    leg.input_amount,
                )
                .map_err(|reason| LedgerError::SwapFailed { leg: i, reason })?;
            self.tokens.approve(leg.input_token, this, leg.router, U256::ZERO);

            debug!(leg = i, router = %leg.router, input = %leg.input_amount, output = %out, "Swap leg executed");
        }

        // 4. Deposit into the target vault
        let available = self
            .tokens
            .balance_of(target_asset, this)
            .saturating_sub(target_before);
        if available.is_zero() {
            return Err(LedgerError::NothingToDeposit);
        }

        let gateway = self
            .vaults
            .get_mut(&target)
            .ok_or(LedgerError::UnknownVault(target))?;
        let new_shares = gateway.deposit(&mut self.tokens, this, available, this)?;
        if new_shares < params.min_shares_out {
            return Err(LedgerError::SlippageExceeded {
                kind: "shares",
                minimum: params.min_shares_out,
                actual: new_shares,
            });
        }
        let new_assets = gateway.convert_to_assets(&self.tokens, new_shares);

        // Unswapped source asset goes back to the user
        if source_asset != target_asset {
            let leftover = self
                .tokens
                .balance_of(source_asset, this)
                .saturating_sub(source_before);
            if !leftover.is_zero() {
                self.tokens.transfer(source_asset, this, user, leftover)?;
            }
        }

        // 5. Overwrite the position
        let from_vault = position.vault;
        position.vault = target;
        position.asset = target_asset;
        position.shares = new_shares;
        position.assets = new_assets;
        self.store_position(user, index, position);

        self.pending.push(LedgerEvent::PositionOptimized {
            user,
            index,
            from_vault,
            to_vault: target,
            assets: redeemed,
            new_shares,
        });

        Ok(new_shares)
    }
}

/// The on-chain position ledger, run in-process.
#[derive(Debug)]
pub struct PositionLedger {
    address: Address,
    state: RwLock<LedgerState>,
    /// Committed events, oldest first. Only appended while `state` is write-locked.
    log: RwLock<Vec<LedgerEvent>>,
}

impl PositionLedger {
    /// Deploy a ledger at `address` governed by `owner`.
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            state: RwLock::new(LedgerState::new(owner)),
            log: RwLock::new(Vec::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Run `op` on a draft and commit it, returning the events it raised.
    async fn transact<T>(
        &self,
        op: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<(T, Vec<LedgerEvent>), LedgerError> {
        let mut state = self.state.write().await;
        let mut draft = state.clone();
        let result = op(&mut draft)?;
        let raised = std::mem::take(&mut draft.pending);
        *state = draft;
        self.log.write().await.extend(raised.iter().cloned());
        Ok((result, raised))
    }

    async fn apply<T>(
        &self,
        op: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        self.transact(op).await.map(|(result, _)| result)
    }

    // ==================== User operations ====================

    /// Deposit `amount` of the vault's underlying asset and open a new position.
    pub async fn deposit(
        &self,
        caller: Address,
        vault: Address,
        amount: U256,
        min_shares_out: U256,
    ) -> Result<U256, LedgerError> {
        let this = self.address;
        let shares = self
            .apply(|s| s.deposit(this, caller, vault, amount, min_shares_out))
            .await?;
        info!(user = %caller, %vault, %amount, %shares, "Position opened");
        Ok(shares)
    }

    /// Redeem `shares` of a position back to the caller.
    pub async fn withdraw(
        &self,
        caller: Address,
        index: usize,
        shares: U256,
        min_assets_out: U256,
    ) -> Result<U256, LedgerError> {
        let this = self.address;
        let assets = self
            .apply(|s| s.withdraw(this, caller, index, shares, min_assets_out))
            .await?;
        info!(user = %caller, index, %shares, %assets, "Position withdrawn");
        Ok(assets)
    }

    /// Move a position into `params.target_vault`, swapping through the given legs.
    pub async fn reallocate(
        &self,
        caller: Address,
        user: Address,
        index: usize,
        params: &ReallocateParams,
    ) -> Result<U256, LedgerError> {
        self.reallocate_with_events(caller, user, index, params)
            .await
            .map(|(new_shares, _)| new_shares)
    }

    /// [`reallocate`](Self::reallocate), also returning the events it raised.
    pub async fn reallocate_with_events(
        &self,
        caller: Address,
        user: Address,
        index: usize,
        params: &ReallocateParams,
    ) -> Result<(U256, Vec<LedgerEvent>), LedgerError> {
        let this = self.address;
        let (new_shares, events) = self
            .transact(|s| s.reallocate(this, caller, user, index, params))
            .await?;
        info!(
            %user,
            index,
            target = %params.target_vault,
            legs = params.routers.len(),
            %new_shares,
            "Position reallocated"
        );
        Ok((new_shares, events))
    }

    // ==================== Governance ====================

    pub async fn set_vault_whitelist(
        &self,
        caller: Address,
        vault: Address,
        allowed: bool,
    ) -> Result<(), LedgerError> {
        self.apply(|s| {
            s.ensure_owner(caller)?;
            if allowed && !s.vaults.contains_key(&vault) {
                return Err(LedgerError::UnknownVault(vault));
            }
            if s.vault_whitelist.set(vault, allowed) {
                s.pending.push(LedgerEvent::VaultWhitelisted { vault, allowed });
            }
            Ok(())
        })
        .await?;
        debug!(%vault, allowed, "Vault whitelist updated");
        Ok(())
    }

    pub async fn set_router_whitelist(
        &self,
        caller: Address,
        router: Address,
        allowed: bool,
    ) -> Result<(), LedgerError> {
        self.set_router_whitelist_with_events(caller, router, allowed)
            .await
            .map(|_| ())
    }

    pub async fn set_router_whitelist_with_events(
        &self,
        caller: Address,
        router: Address,
        allowed: bool,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let (_, events) = self
            .transact(|s| {
                s.ensure_owner(caller)?;
                if s.router_whitelist.set(router, allowed) {
                    s.pending
                        .push(LedgerEvent::RouterWhitelisted { router, allowed });
                }
                Ok(())
            })
            .await?;
        debug!(%router, allowed, "Router whitelist updated");
        Ok(events)
    }

    pub async fn set_operator(
        &self,
        caller: Address,
        operator: Address,
        allowed: bool,
    ) -> Result<(), LedgerError> {
        self.apply(|s| {
            s.ensure_owner(caller)?;
            let changed = if allowed {
                s.operators.insert(operator)
            } else {
                s.operators.remove(&operator)
            };
            if changed {
                s.pending.push(LedgerEvent::OperatorSet { operator, allowed });
            }
            Ok(())
        })
        .await
    }

    pub async fn set_paused(&self, caller: Address, paused: bool) -> Result<(), LedgerError> {
        self.apply(|s| {
            s.ensure_owner(caller)?;
            if s.paused != paused {
                s.paused = paused;
                s.pending.push(LedgerEvent::PausedSet { paused });
            }
            Ok(())
        })
        .await
    }

    pub async fn set_fee(&self, caller: Address, fee_bps: u32) -> Result<(), LedgerError> {
        self.apply(|s| {
            s.ensure_owner(caller)?;
            if fee_bps > MAX_FEE_BPS {
                return Err(LedgerError::FeeAboveCap {
                    requested: fee_bps,
                    cap: MAX_FEE_BPS,
                });
            }
            if s.fee_bps != fee_bps {
                s.fee_bps = fee_bps;
                s.pending.push(LedgerEvent::FeeUpdated { fee_bps });
            }
            Ok(())
        })
        .await
    }

    // ==================== Chain simulation ====================

    /// Deploy a vault contract so it can be whitelisted.
    pub async fn register_vault(&self, vault: Box<dyn VaultGateway>) {
        let mut state = self.state.write().await;
        debug!(vault = %vault.address(), asset = %vault.asset(), "Vault registered");
        state.vaults.insert(vault.address(), vault);
    }

    /// Deploy a router contract so swap legs can target it.
    pub async fn register_router(&self, router: Box<dyn SwapRouter>) {
        let mut state = self.state.write().await;
        debug!(router = %router.address(), "Router registered");
        state.routers.insert(router.address(), router);
    }

    pub async fn mint(&self, token: Address, to: Address, amount: U256) -> Result<(), LedgerError> {
        self.apply(|s| Ok(s.tokens.mint(token, to, amount)?)).await
    }

    /// Grant `spender` an allowance over `owner`'s `token`.
    pub async fn approve(&self, owner: Address, token: Address, spender: Address, amount: U256) {
        self.state
            .write()
            .await
            .tokens
            .approve(token, owner, spender, amount);
    }

    /// Grow a vault's custody without minting shares.
    pub async fn accrue_yield(&self, vault: Address, amount: U256) -> Result<(), LedgerError> {
        self.apply(|s| {
            let asset = s
                .vaults
                .get(&vault)
                .map(|v| v.asset())
                .ok_or(LedgerError::UnknownVault(vault))?;
            Ok(s.tokens.mint(asset, vault, amount)?)
        })
        .await
    }

    // ==================== Reads ====================

    /// All position slots of `user`, with `assets` valued at the live rate.
    pub async fn get_user_positions(&self, user: Address) -> Vec<Position> {
        let state = self.state.read().await;
        state
            .positions
            .get(&user)
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| {
                        let mut p = p.clone();
                        if p.active {
                            p.assets = state.valuation(p.vault, p.shares);
                        }
                        p
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn users_with_active_positions(&self) -> Vec<Address> {
        let state = self.state.read().await;
        state
            .users
            .iter()
            .copied()
            .filter(|user| {
                state
                    .positions
                    .get(user)
                    .is_some_and(|ps| ps.iter().any(|p| p.active))
            })
            .collect()
    }

    /// Whitelisted vaults in the order they were first whitelisted.
    pub async fn whitelisted_vaults(&self) -> Vec<VaultInfo> {
        let state = self.state.read().await;
        state
            .vault_whitelist
            .iter()
            .filter_map(|address| {
                state.vaults.get(&address).map(|v| VaultInfo {
                    address,
                    asset: v.asset(),
                })
            })
            .collect()
    }

    pub async fn is_vault_whitelisted(&self, vault: Address) -> bool {
        self.state.read().await.vault_whitelist.contains(&vault)
    }

    pub async fn is_router_whitelisted(&self, router: Address) -> bool {
        self.state.read().await.router_whitelist.contains(&router)
    }

    pub async fn is_operator(&self, address: Address) -> bool {
        self.state.read().await.operators.contains(&address)
    }

    /// Shares `assets` would mint in `vault` right now.
    pub async fn preview_deposit(&self, vault: Address, assets: U256) -> Result<U256, LedgerError> {
        let state = self.state.read().await;
        let gateway = state
            .vaults
            .get(&vault)
            .ok_or(LedgerError::UnknownVault(vault))?;
        Ok(gateway.convert_to_shares(&state.tokens, assets))
    }

    pub async fn balance_of(&self, token: Address, holder: Address) -> U256 {
        self.state.read().await.tokens.balance_of(token, holder)
    }

    pub async fn owner(&self) -> Address {
        self.state.read().await.owner
    }

    pub async fn fee_bps(&self) -> u32 {
        self.state.read().await.fee_bps
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }

    pub async fn events(&self) -> Vec<LedgerEvent> {
        self.log.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::router::SimulatedRouter;
    use crate::ledger::types::SwapLeg;
    use crate::ledger::vault::ShareVault;
    use std::sync::Arc;

    const LEDGER: Address = Address::repeat_byte(0x1e);
    const OWNER: Address = Address::repeat_byte(0x0f);
    const OPERATOR: Address = Address::repeat_byte(0x0e);
    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);
    const USDC: Address = Address::repeat_byte(0x01);
    const DAI: Address = Address::repeat_byte(0x02);
    const VAULT_A: Address = Address::repeat_byte(0x0a);
    const VAULT_B: Address = Address::repeat_byte(0x0b);
    const VAULT_DAI: Address = Address::repeat_byte(0x0d);
    const ROUTER: Address = Address::repeat_byte(0x77);

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    /// Ledger with USDC vaults A and B, a DAI vault, a USDC->DAI router, and
    /// Alice/Bob funded with 10_000 USDC each and approved to the ledger.
    async fn setup() -> PositionLedger {
        let ledger = PositionLedger::new(LEDGER, OWNER);
        for (vault, asset) in [(VAULT_A, USDC), (VAULT_B, USDC), (VAULT_DAI, DAI)] {
            ledger
                .register_vault(Box::new(ShareVault::new(vault, asset)))
                .await;
            ledger.set_vault_whitelist(OWNER, vault, true).await.unwrap();
        }
        ledger
            .register_router(Box::new(
                SimulatedRouter::new(ROUTER).with_rate(USDC, DAI, 9_950),
            ))
            .await;
        ledger.set_operator(OWNER, OPERATOR, true).await.unwrap();

        for user in [ALICE, BOB] {
            ledger.mint(USDC, user, u(10_000)).await.unwrap();
            ledger.approve(user, USDC, LEDGER, U256::MAX).await;
        }
        ledger
    }

    fn swap_leg(amount: U256, min_out: U256) -> SwapLeg {
        SwapLeg {
            router: ROUTER,
            calldata: SimulatedRouter::encode_calldata(min_out),
            input_token: USDC,
            output_token: DAI,
            input_amount: amount,
        }
    }

    #[tokio::test]
    async fn test_deposit_opens_position() {
        let ledger = setup().await;

        let shares = ledger.deposit(ALICE, VAULT_A, u(1_000), u(1_000)).await.unwrap();

        assert_eq!(shares, u(1_000));
        let positions = ledger.get_user_positions(ALICE).await;
        assert_eq!(
            positions,
            vec![Position {
                vault: VAULT_A,
                asset: USDC,
                shares: u(1_000),
                assets: u(1_000),
                active: true,
            }]
        );
        assert_eq!(ledger.balance_of(USDC, ALICE).await, u(9_000));
        assert_eq!(ledger.balance_of(USDC, LEDGER).await, U256::ZERO);
        assert_eq!(ledger.users_with_active_positions().await, vec![ALICE]);
    }

    #[tokio::test]
    async fn test_deposit_below_slippage_floor_changes_nothing() {
        let ledger = setup().await;
        let events_before = ledger.events().await.len();

        let err = ledger
            .deposit(ALICE, VAULT_A, u(1_000), u(1_001))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::SlippageExceeded { .. }));
        assert!(ledger.get_user_positions(ALICE).await.is_empty());
        assert_eq!(ledger.balance_of(USDC, ALICE).await, u(10_000));
        assert_eq!(ledger.events().await.len(), events_before);
    }

    #[tokio::test]
    async fn test_deposit_validation() {
        let ledger = setup().await;
        let unknown = Address::repeat_byte(0xee);

        assert_eq!(
            ledger.deposit(ALICE, VAULT_A, U256::ZERO, U256::ZERO).await,
            Err(LedgerError::ZeroAmount)
        );
        assert_eq!(
            ledger.deposit(ALICE, unknown, u(10), U256::ZERO).await,
            Err(LedgerError::VaultNotWhitelisted(unknown))
        );

        // DAI vault: Alice holds no DAI
        let err = ledger
            .deposit(ALICE, VAULT_DAI, u(10), U256::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Token(_)));
    }

    #[tokio::test]
    async fn test_deposit_requires_allowance() {
        let ledger = setup().await;
        let carol = Address::repeat_byte(0xc0);
        ledger.mint(USDC, carol, u(500)).await.unwrap();

        let err = ledger
            .deposit(carol, VAULT_A, u(500), U256::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Token(_)));
        assert_eq!(ledger.balance_of(USDC, carol).await, u(500));
    }

    #[tokio::test]
    async fn test_partial_then_full_withdraw_deactivates() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let out = ledger.withdraw(ALICE, 0, u(400), u(400)).await.unwrap();
        assert_eq!(out, u(400));
        let position = &ledger.get_user_positions(ALICE).await[0];
        assert_eq!(position.shares, u(600));
        assert_eq!(position.assets, u(600));
        assert!(position.active);

        ledger.withdraw(ALICE, 0, u(600), U256::ZERO).await.unwrap();
        let positions = ledger.get_user_positions(ALICE).await;
        assert_eq!(positions.len(), 1, "slot is kept after closing");
        assert!(!positions[0].active);
        assert_eq!(positions[0].shares, U256::ZERO);
        assert_eq!(ledger.balance_of(USDC, ALICE).await, u(10_000));
        assert!(ledger.users_with_active_positions().await.is_empty());
        assert!(ledger
            .events()
            .await
            .contains(&LedgerEvent::PositionClosed { user: ALICE, index: 0 }));

        assert_eq!(
            ledger.withdraw(ALICE, 0, u(1), U256::ZERO).await,
            Err(LedgerError::InactivePosition { index: 0 })
        );
    }

    #[tokio::test]
    async fn test_withdraw_more_than_held_leaves_position_untouched() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        let before = ledger.get_user_positions(ALICE).await;

        let err = ledger.withdraw(ALICE, 0, u(1_001), U256::ZERO).await.unwrap_err();

        assert!(matches!(err, LedgerError::InvalidShareAmount { .. }));
        assert_eq!(ledger.get_user_positions(ALICE).await, before);
        assert_eq!(
            ledger.withdraw(ALICE, 3, u(1), U256::ZERO).await,
            Err(LedgerError::InvalidPositionIndex { index: 3, len: 1 })
        );
        assert!(matches!(
            ledger.withdraw(ALICE, 0, U256::ZERO, U256::ZERO).await,
            Err(LedgerError::InvalidShareAmount { .. })
        ));
    }

    #[tokio::test]
    async fn test_withdraw_fee_goes_to_owner() {
        let ledger = setup().await;
        ledger.set_fee(OWNER, 100).await.unwrap();
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        // Net 990 < 1_000 floor
        assert!(matches!(
            ledger.withdraw(ALICE, 0, u(1_000), u(1_000)).await,
            Err(LedgerError::SlippageExceeded { .. })
        ));

        let net = ledger.withdraw(ALICE, 0, u(1_000), u(990)).await.unwrap();
        assert_eq!(net, u(990));
        assert_eq!(ledger.balance_of(USDC, OWNER).await, u(10));
    }

    #[tokio::test]
    async fn test_same_asset_reallocation_updates_every_field() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        ledger.accrue_yield(VAULT_A, u(100)).await.unwrap();

        let params = ReallocateParams::new(VAULT_B, &[], u(1_100));
        let new_shares = ledger.reallocate(OPERATOR, ALICE, 0, &params).await.unwrap();

        assert_eq!(new_shares, u(1_100));
        let position = &ledger.get_user_positions(ALICE).await[0];
        assert_eq!(position.vault, VAULT_B);
        assert_eq!(position.asset, USDC);
        assert_eq!(position.shares, u(1_100));
        assert_eq!(position.assets, u(1_100));
        assert!(ledger.events().await.iter().any(|e| matches!(
            e,
            LedgerEvent::PositionOptimized { from_vault, to_vault, .. }
                if *from_vault == VAULT_A && *to_vault == VAULT_B
        )));
    }

    #[tokio::test]
    async fn test_reallocation_returns_only_its_own_events() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        ledger.accrue_yield(VAULT_A, u(50)).await.unwrap();
        let logged_before = ledger.events().await.len();

        let params = ReallocateParams::new(VAULT_B, &[], U256::ZERO);
        let (_, events) = ledger
            .reallocate_with_events(OPERATOR, ALICE, 0, &params)
            .await
            .unwrap();

        assert_eq!(
            events,
            vec![LedgerEvent::PositionOptimized {
                user: ALICE,
                index: 0,
                from_vault: VAULT_A,
                to_vault: VAULT_B,
                assets: u(1_050),
                new_shares: u(1_050),
            }]
        );
        let logged = ledger.events().await;
        assert_eq!(logged.len(), logged_before + 1);
        assert_eq!(logged.last(), events.last());
    }

    #[tokio::test]
    async fn test_cross_asset_reallocation_swaps_through_router() {
        let ledger = setup().await;
        ledger.set_router_whitelist(OWNER, ROUTER, true).await.unwrap();
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_DAI, &[swap_leg(u(1_000), u(990))], u(990));
        let new_shares = ledger.reallocate(ALICE, ALICE, 0, &params).await.unwrap();

        assert_eq!(new_shares, u(995));
        let position = &ledger.get_user_positions(ALICE).await[0];
        assert_eq!(position.vault, VAULT_DAI);
        assert_eq!(position.asset, DAI);
        assert_eq!(position.assets, u(995));
        // Custody fully consumed by the swap
        assert_eq!(ledger.balance_of(USDC, LEDGER).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_partial_swap_refunds_leftover_source_asset() {
        let ledger = setup().await;
        ledger.set_router_whitelist(OWNER, ROUTER, true).await.unwrap();
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_DAI, &[swap_leg(u(800), u(796))], U256::ZERO);
        ledger.reallocate(ALICE, ALICE, 0, &params).await.unwrap();

        assert_eq!(ledger.balance_of(USDC, ALICE).await, u(9_200));
        assert_eq!(ledger.balance_of(USDC, LEDGER).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_swap_leg_failure_reverts_whole_reallocation() {
        let ledger = setup().await;
        ledger.set_router_whitelist(OWNER, ROUTER, true).await.unwrap();
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        let positions_before = ledger.get_user_positions(ALICE).await;
        let events_before = ledger.events().await;

        // Min output above what the router delivers
        let params = ReallocateParams::new(VAULT_DAI, &[swap_leg(u(1_000), u(999))], U256::ZERO);
        let err = ledger.reallocate(ALICE, ALICE, 0, &params).await.unwrap_err();

        assert!(matches!(err, LedgerError::SwapFailed { leg: 0, .. }));
        assert_eq!(ledger.get_user_positions(ALICE).await, positions_before);
        assert_eq!(ledger.events().await, events_before);
        assert_eq!(ledger.balance_of(USDC, VAULT_A).await, u(1_000));
        assert_eq!(ledger.balance_of(DAI, LEDGER).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_unwhitelisted_router_is_rejected() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_DAI, &[swap_leg(u(1_000), u(990))], U256::ZERO);
        assert_eq!(
            ledger.reallocate(ALICE, ALICE, 0, &params).await,
            Err(LedgerError::RouterNotWhitelisted(ROUTER))
        );
        assert_eq!(ledger.get_user_positions(ALICE).await[0].vault, VAULT_A);
    }

    #[tokio::test]
    async fn test_mismatched_asset_without_legs_fails() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_DAI, &[], U256::ZERO);
        assert_eq!(
            ledger.reallocate(ALICE, ALICE, 0, &params).await,
            Err(LedgerError::AssetMismatch {
                expected: DAI,
                actual: USDC
            })
        );
    }

    #[tokio::test]
    async fn test_reallocate_slippage_floor_reverts() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        let before = ledger.get_user_positions(ALICE).await;

        let params = ReallocateParams::new(VAULT_B, &[], u(1_001));
        assert!(matches!(
            ledger.reallocate(ALICE, ALICE, 0, &params).await,
            Err(LedgerError::SlippageExceeded { .. })
        ));
        assert_eq!(ledger.get_user_positions(ALICE).await, before);
        assert_eq!(ledger.balance_of(USDC, VAULT_B).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_reallocate_requires_owner_or_operator() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_B, &[], U256::ZERO);
        assert_eq!(
            ledger.reallocate(BOB, ALICE, 0, &params).await,
            Err(LedgerError::Unauthorized { caller: BOB })
        );
    }

    #[tokio::test]
    async fn test_concurrent_reallocations_only_one_succeeds() {
        let ledger = Arc::new(setup().await);
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();

        let params = ReallocateParams::new(VAULT_B, &[], U256::ZERO);
        let (first, second) = tokio::join!(
            ledger.reallocate(OPERATOR, ALICE, 0, &params),
            ledger.reallocate(ALICE, ALICE, 0, &params),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| *r == Err(LedgerError::SameVault(VAULT_B))));
        let position = &ledger.get_user_positions(ALICE).await[0];
        assert_eq!(position.shares, u(1_000));
        assert_eq!(ledger.balance_of(USDC, VAULT_B).await, u(1_000));
        assert_eq!(ledger.balance_of(USDC, VAULT_A).await, U256::ZERO);
    }

    #[tokio::test]
    async fn test_pause_blocks_user_operations() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        ledger.set_paused(OWNER, true).await.unwrap();
        assert!(ledger.is_paused().await);

        assert_eq!(
            ledger.deposit(ALICE, VAULT_A, u(1), U256::ZERO).await,
            Err(LedgerError::Paused)
        );
        assert_eq!(
            ledger.withdraw(ALICE, 0, u(1), U256::ZERO).await,
            Err(LedgerError::Paused)
        );
        let params = ReallocateParams::new(VAULT_B, &[], U256::ZERO);
        assert_eq!(
            ledger.reallocate(ALICE, ALICE, 0, &params).await,
            Err(LedgerError::Paused)
        );

        ledger.set_paused(OWNER, false).await.unwrap();
        assert!(ledger.withdraw(ALICE, 0, u(1), U256::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_governance_is_owner_only_and_idempotent() {
        let ledger = setup().await;

        assert_eq!(
            ledger.set_router_whitelist(ALICE, ROUTER, true).await,
            Err(LedgerError::Unauthorized { caller: ALICE })
        );
        assert_eq!(
            ledger.set_fee(OWNER, MAX_FEE_BPS + 1).await,
            Err(LedgerError::FeeAboveCap {
                requested: MAX_FEE_BPS + 1,
                cap: MAX_FEE_BPS
            })
        );

        ledger.set_router_whitelist(OWNER, ROUTER, true).await.unwrap();
        let events = ledger.events().await.len();
        ledger.set_router_whitelist(OWNER, ROUTER, true).await.unwrap();
        assert_eq!(ledger.events().await.len(), events);
        assert!(ledger.is_router_whitelisted(ROUTER).await);

        assert!(ledger.is_operator(OPERATOR).await);
        ledger.set_operator(OWNER, OPERATOR, false).await.unwrap();
        assert!(!ledger.is_operator(OPERATOR).await);

        ledger.set_fee(OWNER, 25).await.unwrap();
        assert_eq!(ledger.fee_bps().await, 25);
        assert_eq!(ledger.owner().await, OWNER);
    }

    #[tokio::test]
    async fn test_dewhitelisted_vault_is_rejected_at_call_time() {
        let ledger = setup().await;
        ledger.deposit(ALICE, VAULT_A, u(1_000), U256::ZERO).await.unwrap();
        ledger.set_vault_whitelist(OWNER, VAULT_B, false).await.unwrap();
        assert!(!ledger.is_vault_whitelisted(VAULT_B).await);

        let params = ReallocateParams::new(VAULT_B, &[], U256::ZERO);
        assert_eq!(
            ledger.reallocate(ALICE, ALICE, 0, &params).await,
            Err(LedgerError::VaultNotWhitelisted(VAULT_B))
        );
        let order: Vec<Address> = ledger
            .whitelisted_vaults()
            .await
            .iter()
            .map(|v| v.address)
            .collect();
        assert_eq!(order, vec![VAULT_A, VAULT_DAI]);
    }
}
