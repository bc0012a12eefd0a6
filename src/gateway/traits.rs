//! External collaborator interfaces consumed by the decision engine and executor.

use super::types::{SwapQuote, SwapRequest, YieldOpportunity};
use crate::ledger::VaultInfo;
use async_trait::async_trait;

/// Source of annualized yield estimates per vault.
///
/// `Ok(None)` means the oracle had no usable reading for the vault; that is
/// "no opportunity", not a failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait YieldOracle: Send + Sync {
    async fn get_yield(&self, vault: &VaultInfo) -> anyhow::Result<Option<YieldOpportunity>>;
}

/// Produces an executable swap instruction for converting one asset into another.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapGateway: Send + Sync {
    async fn quote(&self, request: &SwapRequest) -> anyhow::Result<SwapQuote>;
}
