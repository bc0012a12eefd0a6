//! Revert reasons raised by the position ledger and its gateways.

use alloy_primitives::{Address, U256};
use thiserror::Error;

/// Failures raised by a vault's share accounting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("vault {vault} has no shares outstanding")]
    EmptyVault { vault: Address },

    #[error("insufficient shares: owner {owner} holds {available}, requested {requested}")]
    InsufficientShares {
        owner: Address,
        available: U256,
        requested: U256,
    },

    #[error("deposit of {assets} would mint zero shares")]
    ZeroShares { assets: U256 },

    #[error("arithmetic overflow in share conversion")]
    Overflow,

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Failures raised by the token balance book.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("insufficient balance of {token} for {holder}: have {available}, need {required}")]
    InsufficientBalance {
        token: Address,
        holder: Address,
        available: U256,
        required: U256,
    },

    #[error("insufficient allowance of {token} from {owner} to {spender}: have {available}, need {required}")]
    InsufficientAllowance {
        token: Address,
        owner: Address,
        spender: Address,
        available: U256,
        required: U256,
    },

    #[error("balance overflow for {token}")]
    Overflow { token: Address },
}

/// Reasons a ledger call reverts. A reverted call leaves no observable change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger is paused")]
    Paused,

    #[error("caller {caller} is not authorized for this operation")]
    Unauthorized { caller: Address },

    #[error("vault {0} is not whitelisted")]
    VaultNotWhitelisted(Address),

    #[error("router {0} is not whitelisted")]
    RouterNotWhitelisted(Address),

    #[error("vault {0} is not registered")]
    UnknownVault(Address),

    #[error("router {0} is not registered")]
    UnknownRouter(Address),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("position index {index} out of range ({len} positions)")]
    InvalidPositionIndex { index: usize, len: usize },

    #[error("position {index} is inactive")]
    InactivePosition { index: usize },

    #[error("share amount {requested} outside (0, {available}]")]
    InvalidShareAmount { requested: U256, available: U256 },

    #[error("slippage: {kind} {actual} below minimum {minimum}")]
    SlippageExceeded {
        kind: &'static str,
        minimum: U256,
        actual: U256,
    },

    #[error("asset mismatch: expected {expected}, found {actual}")]
    AssetMismatch { expected: Address, actual: Address },

    #[error("target vault {0} is already the position's vault")]
    SameVault(Address),

    #[error("swap leg arrays have mismatched lengths")]
    MalformedSwapLegs,

    #[error("swap leg {leg} failed: {reason}")]
    SwapFailed { leg: usize, reason: String },

    #[error("fee {requested} bps exceeds cap {cap} bps")]
    FeeAboveCap { requested: u32, cap: u32 },

    #[error("nothing to deposit into target vault")]
    NothingToDeposit,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Token(#[from] TokenError),
}
