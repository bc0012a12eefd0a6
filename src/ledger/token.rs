//! ERC-20 style balance and allowance book shared by the ledger, vaults and routers.

use super::error::TokenError;
use alloy_primitives::{Address, U256};
use std::collections::HashMap;

/// Balances and allowances for every token known to the simulated chain.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    balances: HashMap<(Address, Address), U256>,
    allowances: HashMap<(Address, Address, Address), U256>,
}

impl TokenBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, token: Address, holder: Address) -> U256 {
        self.balances
            .get(&(token, holder))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Create `amount` of `token` out of thin air.
    pub fn mint(&mut self, token: Address, to: Address, amount: U256) -> Result<(), TokenError> {
        let balance = self.balance_of(token, to);
        let updated = balance
            .checked_add(amount)
            .ok_or(TokenError::Overflow { token })?;
        self.balances.insert((token, to), updated);
        Ok(())
    }

    pub fn burn(&mut self, token: Address, from: Address, amount: U256) -> Result<(), TokenError> {
        let balance = self.balance_of(token, from);
        let updated = balance
            .checked_sub(amount)
            .ok_or(TokenError::InsufficientBalance {
                token,
                holder: from,
                available: balance,
                required: amount,
            })?;
        self.balances.insert((token, from), updated);
        Ok(())
    }

    /// Overwrite the allowance `owner` grants `spender`.
    pub fn approve(&mut self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.allowances.insert((token, owner, spender), amount);
    }

    pub fn transfer(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), TokenError> {
        self.burn(token, from, amount)?;
        self.mint(token, to, amount)
    }

    /// Move `amount` from `from` to `to`, spending `spender`'s allowance.
    pub fn transfer_from(
        &mut self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), TokenError> {
        let allowance = self.allowance(token, from, spender);
        let remaining = allowance
            .checked_sub(amount)
            .ok_or(TokenError::InsufficientAllowance {
                token,
                owner: from,
                spender,
                available: allowance,
                required: amount,
            })?;
        self.transfer(token, from, to, amount)?;
        self.allowances.insert((token, from, spender), remaining);
        Ok(())
    }
}
