//! Ledger-facing data types: positions, swap legs, events.

use super::error::LedgerError;
use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// A user's stake in one vault.
///
/// Slots are never removed; closing a position zeroes `shares` and clears
/// `active` so indices referenced off-chain stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub vault: Address,
    pub asset: Address,
    pub shares: U256,
    /// Valuation of `shares` in `asset` at the last mutation
    pub assets: U256,
    pub active: bool,
}

/// A vault as seen through the whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultInfo {
    pub address: Address,
    pub asset: Address,
}

/// One swap step inside a reallocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub router: Address,
    pub calldata: Bytes,
    pub input_token: Address,
    pub output_token: Address,
    pub input_amount: U256,
}

/// Arguments of `reallocate`, laid out as the contract's parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReallocateParams {
    pub routers: Vec<Address>,
    pub calldatas: Vec<Bytes>,
    pub input_tokens: Vec<Address>,
    pub output_tokens: Vec<Address>,
    pub input_amounts: Vec<U256>,
    pub target_vault: Address,
    pub min_shares_out: U256,
}

impl ReallocateParams {
    pub fn new(target_vault: Address, legs: &[SwapLeg], min_shares_out: U256) -> Self {
        Self {
            routers: legs.iter().map(|l| l.router).collect(),
            calldatas: legs.iter().map(|l| l.calldata.clone()).collect(),
            input_tokens: legs.iter().map(|l| l.input_token).collect(),
            output_tokens: legs.iter().map(|l| l.output_token).collect(),
            input_amounts: legs.iter().map(|l| l.input_amount).collect(),
            target_vault,
            min_shares_out,
        }
    }

    /// Zip the parallel arrays back into legs, rejecting ragged input.
    pub fn legs(&self) -> Result<Vec<SwapLeg>, LedgerError> {
        let n = self.routers.len();
        if self.calldatas.len() != n
            || self.input_tokens.len() != n
            || self.output_tokens.len() != n
            || self.input_amounts.len() != n
        {
            return Err(LedgerError::MalformedSwapLegs);
        }

        Ok((0..n)
            .map(|i| SwapLeg {
                router: self.routers[i],
                calldata: self.calldatas[i].clone(),
                input_token: self.input_tokens[i],
                output_token: self.output_tokens[i],
                input_amount: self.input_amounts[i],
            })
            .collect())
    }
}

/// Events appended to the ledger log when a call commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum LedgerEvent {
    PositionOpened {
        user: Address,
        index: usize,
        vault: Address,
        assets: U256,
        shares: U256,
    },
    Withdrawn {
        user: Address,
        index: usize,
        shares: U256,
        assets: U256,
        fee: U256,
    },
    PositionClosed {
        user: Address,
        index: usize,
    },
    PositionOptimized {
        user: Address,
        index: usize,
        from_vault: Address,
        to_vault: Address,
        assets: U256,
        new_shares: U256,
    },
    VaultWhitelisted {
        vault: Address,
        allowed: bool,
    },
    RouterWhitelisted {
        router: Address,
        allowed: bool,
    },
    OperatorSet {
        operator: Address,
        allowed: bool,
    },
    PausedSet {
        paused: bool,
    },
    FeeUpdated {
        fee_bps: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_params_are_rejected() {
        let mut params = ReallocateParams::new(
            Address::repeat_byte(0x0b),
            &[SwapLeg {
                router: Address::repeat_byte(0x77),
                calldata: Bytes::new(),
                input_token: Address::repeat_byte(0x01),
                output_token: Address::repeat_byte(0x02),
                input_amount: U256::from(10),
            }],
            U256::ZERO,
        );
        assert_eq!(params.legs().unwrap().len(), 1);

        params.input_amounts.clear();
        assert_eq!(params.legs(), Err(LedgerError::MalformedSwapLegs));
    }
}
