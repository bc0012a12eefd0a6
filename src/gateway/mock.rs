//! In-process oracle and swap gateway for simulation and tests.

use super::traits::{SwapGateway, YieldOracle};
use super::types::{SwapQuote, SwapRequest, YieldOpportunity};
use crate::ledger::{SimulatedRouter, SwapRouter, VaultInfo};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Oracle serving fixed APY readings keyed by vault address.
#[derive(Debug, Default)]
pub struct StaticYieldOracle {
    readings: RwLock<HashMap<Address, Decimal>>,
    failing: RwLock<HashSet<Address>>,
}

impl StaticYieldOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_yields(readings: impl IntoIterator<Item = (Address, Decimal)>) -> Self {
        Self {
            readings: RwLock::new(readings.into_iter().collect()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub async fn set_yield(&self, vault: Address, apy: Decimal) {
        self.readings.write().await.insert(vault, apy);
    }

    /// Make every lookup for `vault` fail until cleared.
    pub async fn fail_for(&self, vault: Address, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(vault);
        } else {
            set.remove(&vault);
        }
    }
}

#[async_trait]
impl YieldOracle for StaticYieldOracle {
    async fn get_yield(&self, vault: &VaultInfo) -> Result<Option<YieldOpportunity>> {
        if self.failing.read().await.contains(&vault.address) {
            anyhow::bail!("Yield oracle unavailable for {}", vault.address);
        }

        let apy = self.readings.read().await.get(&vault.address).copied();
        Ok(apy.filter(|a| *a > Decimal::ZERO).map(|apy| YieldOpportunity {
            vault: vault.address,
            asset: vault.asset,
            apy,
            apr: apy,
            timestamp: Utc::now(),
        }))
    }
}

/// Quotes against a `SimulatedRouter`, encoding a slippage-adjusted minimum output.
#[derive(Debug, Clone)]
pub struct SimulatedSwapGateway {
    router: SimulatedRouter,
    slippage_bps: u32,
}

impl SimulatedSwapGateway {
    pub fn new(router: SimulatedRouter, slippage_bps: u32) -> Self {
        Self {
            router,
            slippage_bps,
        }
    }
}

#[async_trait]
impl SwapGateway for SimulatedSwapGateway {
    async fn quote(&self, request: &SwapRequest) -> Result<SwapQuote> {
        let amount_out = self
            .router
            .quote(request.input_token, request.output_token, request.input_amount)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No route {} -> {}",
                    request.input_token,
                    request.output_token
                )
            })?;

        let keep = U256::from(10_000u32.saturating_sub(self.slippage_bps));
        let min_out = amount_out.saturating_mul(keep) / U256::from(10_000u32);
        debug!(%amount_out, %min_out, "Simulated swap quote");

        Ok(SwapQuote {
            router: self.router.address(),
            calldata: SimulatedRouter::encode_calldata(min_out),
            amount_out: Some(amount_out),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const USDC: Address = Address::repeat_byte(0x01);
    const DAI: Address = Address::repeat_byte(0x02);

    fn vault(byte: u8) -> VaultInfo {
        VaultInfo {
            address: Address::repeat_byte(byte),
            asset: USDC,
        }
    }

    #[tokio::test]
    async fn test_static_oracle_readings_and_failures() {
        let oracle = StaticYieldOracle::with_yields([(vault(0x0a).address, dec!(3.0))]);

        let reading = oracle.get_yield(&vault(0x0a)).await.unwrap().unwrap();
        assert_eq!(reading.apy, dec!(3.0));
        assert!(oracle.get_yield(&vault(0x0b)).await.unwrap().is_none());

        oracle.fail_for(vault(0x0a).address, true).await;
        assert!(oracle.get_yield(&vault(0x0a)).await.is_err());

        oracle.fail_for(vault(0x0a).address, false).await;
        oracle.set_yield(vault(0x0a).address, Decimal::ZERO).await;
        assert!(oracle.get_yield(&vault(0x0a)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_simulated_quote_applies_slippage() {
        let router = SimulatedRouter::new(Address::repeat_byte(0x77)).with_rate(USDC, DAI, 10_000);
        let gateway = SimulatedSwapGateway::new(router, 50);

        let quote = gateway
            .quote(&SwapRequest {
                input_token: USDC,
                output_token: DAI,
                input_amount: U256::from(10_000u64),
                user_address: Address::repeat_byte(0x1e),
                output_receiver: Address::repeat_byte(0x1e),
            })
            .await
            .unwrap();

        assert_eq!(quote.amount_out, Some(U256::from(10_000u64)));
        assert_eq!(
            SimulatedRouter::decode_calldata(&quote.calldata),
            Some(U256::from(9_950u64))
        );
    }
}
