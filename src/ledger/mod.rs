//! Position ledger and the contracts it talks to.
//!
//! ## Ledger
//! Custodies user positions in whitelisted vaults and enforces:
//! - Vault and router whitelists checked at call time
//! - Slippage floors on deposit, withdraw and reallocate
//! - All-or-nothing reallocation (redeem → swap legs → deposit)
//!
//! ## Gateways
//! - Vaults: ERC-4626 style share accounting over the shared token book
//! - Routers: opaque swap instructions executed against an allowance
//!
//! ## Client
//! `LedgerClient` is the off-chain seam the executor submits through.

mod client;
mod error;
mod router;
mod state;
mod token;
mod types;
mod vault;

pub use client::{ClientError, LedgerClient, LocalLedgerClient, TxReceipt};
pub use error::{LedgerError, TokenError, VaultError};
pub use router::{SimulatedRouter, SwapRouter};
pub use state::{PositionLedger, MAX_FEE_BPS};
pub use token::TokenBook;
pub use types::*;
pub use vault::{ShareVault, VaultGateway};
