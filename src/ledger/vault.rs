//! Vault gateway: uniform deposit/redeem surface over share-based custody contracts.

use super::error::VaultError;
use super::token::TokenBook;
use alloy_primitives::{Address, U256};
use std::collections::HashMap;
use std::fmt;

/// Deposit/redeem/convert interface every whitelisted vault conforms to.
///
/// Vaults keep their underlying custody in the shared [`TokenBook`] under
/// their own address, so conversions read it rather than caching totals.
pub trait VaultGateway: Send + Sync + fmt::Debug {
    /// Contract address of the vault.
    fn address(&self) -> Address;

    /// Declared underlying asset.
    fn asset(&self) -> Address;

    /// Pull `assets` from `caller` and mint shares to `receiver`.
    fn deposit(
        &mut self,
        tokens: &mut TokenBook,
        caller: Address,
        assets: U256,
        receiver: Address,
    ) -> Result<U256, VaultError>;

    /// Burn `shares` held by `owner` and send the underlying to `receiver`.
    fn redeem(
        &mut self,
        tokens: &mut TokenBook,
        shares: U256,
        receiver: Address,
        owner: Address,
    ) -> Result<U256, VaultError>;

    fn convert_to_assets(&self, tokens: &TokenBook, shares: U256) -> U256;

    fn convert_to_shares(&self, tokens: &TokenBook, assets: U256) -> U256;

    fn balance_of(&self, holder: Address) -> U256;

    fn total_assets(&self, tokens: &TokenBook) -> U256;

    fn clone_box(&self) -> Box<dyn VaultGateway>;
}

impl Clone for Box<dyn VaultGateway> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// ERC-4626 style vault with floor-rounded conversions.
#[derive(Debug, Clone)]
pub struct ShareVault {
    address: Address,
    asset: Address,
    total_supply: U256,
    shares: HashMap<Address, U256>,
}

impl ShareVault {
    pub fn new(address: Address, asset: Address) -> Self {
        Self {
            address,
            asset,
            total_supply: U256::ZERO,
            shares: HashMap::new(),
        }
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    /// `amount * numerator / denominator`, rounding down.
    fn mul_div(amount: U256, numerator: U256, denominator: U256) -> Option<U256> {
        if denominator.is_zero() {
            return None;
        }
        amount.checked_mul(numerator).map(|p| p / denominator)
    }
}

impl VaultGateway for ShareVault {
    fn address(&self) -> Address {
        self.address
    }

    fn asset(&self) -> Address {
        self.asset
    }

    fn deposit(
        &mut self,
        tokens: &mut TokenBook,
        caller: Address,
        assets: U256,
        receiver: Address,
    ) -> Result<U256, VaultError> {
        let shares = if self.total_supply.is_zero() {
            assets
        } else {
            Self::mul_div(assets, self.total_supply, self.total_assets(tokens))
                .ok_or(VaultError::Overflow)?
        };
        if shares.is_zero() {
            return Err(VaultError::ZeroShares { assets });
        }

        tokens.transfer(self.asset, caller, self.address, assets)?;

        let held = self.balance_of(receiver);
        self.shares
            .insert(receiver, held.checked_add(shares).ok_or(VaultError::Overflow)?);
        self.total_supply = self
            .total_supply
            .checked_add(shares)
            .ok_or(VaultError::Overflow)?;

        Ok(shares)
    }

    fn redeem(
        &mut self,
        tokens: &mut TokenBook,
        shares: U256,
        receiver: Address,
        owner: Address,
    ) -> Result<U256, VaultError> {
        if self.total_supply.is_zero() {
            return Err(VaultError::EmptyVault {
                vault: self.address,
            });
        }
        let held = self.balance_of(owner);
        if shares > held {
            return Err(VaultError::InsufficientShares {
                owner,
                available: held,
                requested: shares,
            });
        }

        let assets = self.convert_to_assets(tokens, shares);
        tokens.transfer(self.asset, self.address, receiver, assets)?;

        self.shares.insert(owner, held - shares);
        self.total_supply -= shares;

        Ok(assets)
    }

    fn convert_to_assets(&self, tokens: &TokenBook, shares: U256) -> U256 {
        if self.total_supply.is_zero() {
            return shares;
        }
        Self::mul_div(shares, self.total_assets(tokens), self.total_supply).unwrap_or(U256::ZERO)
    }

    fn convert_to_shares(&self, tokens: &TokenBook, assets: U256) -> U256 {
        let total_assets = self.total_assets(tokens);
        if self.total_supply.is_zero() || total_assets.is_zero() {
            return assets;
        }
        Self::mul_div(assets, self.total_supply, total_assets).unwrap_or(U256::ZERO)
    }

    fn balance_of(&self, holder: Address) -> U256 {
        self.shares.get(&holder).copied().unwrap_or(U256::ZERO)
    }

    fn total_assets(&self, tokens: &TokenBook) -> U256 {
        tokens.balance_of(self.asset, self.address)
    }

    fn clone_box(&self) -> Box<dyn VaultGateway> {
        Box::new(self.clone())
    }
}
