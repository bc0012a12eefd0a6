//! Configuration management for the vault reallocator.
//!
//! Loads settings from environment variables and config files.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chain and ledger identities
    #[serde(default)]
    pub chain: ChainConfig,
    /// Yield oracle endpoint
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Swap gateway endpoint
    #[serde(default)]
    pub swap: SwapConfig,
    /// Reallocation decision thresholds
    #[serde(default)]
    pub decision: DecisionConfig,
    /// Execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Optimization record storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Vaults seeded into the simulated ledger
    #[serde(default)]
    pub vaults: Vec<VaultSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain name sent to the oracle and swap gateway
    #[serde(default = "default_chain_name")]
    pub name: String,
    /// Address of the position ledger
    #[serde(default = "default_ledger_address")]
    pub ledger_address: Address,
    /// Governance owner of the ledger
    #[serde(default = "default_owner")]
    pub owner: Address,
    /// Principal the executor signs with
    #[serde(default = "default_signer")]
    pub signer: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base URL of the yield oracle; empty uses seeded static readings
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Base URL of the swap gateway; empty quotes against the simulated router
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Router deployed on the simulated ledger
    #[serde(default = "default_router")]
    pub router: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Minimum APY improvement to reallocate, in basis points (50 = 0.5pp)
    #[serde(default = "default_min_apy_improvement_bps")]
    pub min_apy_improvement_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Slippage tolerance applied to the deposit floor, in basis points
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Pause between positions in a batch
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,
    /// Timeout for oracle and quote requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for transaction submission and confirmation
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    /// Whitelist quoted routers through governance when missing
    #[serde(default = "default_true")]
    pub auto_whitelist_routers: bool,
    /// Interval between scheduled batch runs
    #[serde(default = "default_batch_interval")]
    pub batch_interval_secs: u64,
    /// Plan reallocations without submitting them
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// A vault registered with the simulated ledger at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSeed {
    pub address: Address,
    pub asset: Address,
    /// Static APY reading used when no oracle URL is configured
    #[serde(default)]
    pub apy: Option<Decimal>,
    /// Token decimals for display
    #[serde(default = "default_token_decimals")]
    pub decimals: u32,
    /// Positions opened in this vault at startup
    #[serde(default)]
    pub deposits: Vec<SeedDeposit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDeposit {
    pub user: Address,
    pub amount: u128,
}

// Default value functions
fn default_chain_name() -> String {
    "base".to_string()
}

fn default_ledger_address() -> Address {
    Address::repeat_byte(0x1e)
}

fn default_owner() -> Address {
    Address::repeat_byte(0x0e)
}

fn default_signer() -> Address {
    Address::repeat_byte(0x5e)
}

fn default_router() -> Address {
    Address::repeat_byte(0x77)
}

fn default_http_timeout() -> u64 {
    10
}

fn default_min_apy_improvement_bps() -> u32 {
    50 // 0.5 percentage points
}

fn default_slippage_bps() -> u32 {
    50 // 0.5%
}

fn default_inter_call_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout() -> u64 {
    15
}

fn default_confirmation_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_batch_interval() -> u64 {
    3_600
}

fn default_db_path() -> String {
    "data/optimizations.db".to_string()
}

fn default_token_decimals() -> u32 {
    6
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("VR"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.execution.slippage_bps < 10_000,
            "slippage_bps must be below 10000"
        );

        anyhow::ensure!(
            self.decision.min_apy_improvement_bps <= 10_000,
            "min_apy_improvement_bps must be at most 10000"
        );

        anyhow::ensure!(
            self.execution.request_timeout_secs > 0
                && self.execution.confirmation_timeout_secs > 0,
            "execution timeouts must be positive"
        );

        anyhow::ensure!(
            self.execution.batch_interval_secs > 0,
            "batch_interval_secs must be positive"
        );

        anyhow::ensure!(
            self.chain.ledger_address != Address::ZERO && self.chain.owner != Address::ZERO,
            "ledger_address and owner must be set"
        );

        for url in [&self.oracle.base_url, &self.swap.base_url] {
            anyhow::ensure!(
                url.is_empty() || url.starts_with("http://") || url.starts_with("https://"),
                "gateway base_url must be http(s): {}",
                url
            );
        }

        let mut seen = HashSet::new();
        for vault in &self.vaults {
            anyhow::ensure!(
                seen.insert(vault.address),
                "duplicate vault address {}",
                vault.address
            );
        }

        Ok(())
    }

    /// Minimum APY improvement as percentage points.
    pub fn min_apy_improvement(&self) -> Decimal {
        crate::utils::bps_to_percent(self.decision.min_apy_improvement_bps)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: default_chain_name(),
            ledger_address: default_ledger_address(),
            owner: default_owner(),
            signer: default_signer(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_http_timeout(),
            api_key: None,
            router: default_router(),
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_apy_improvement_bps: default_min_apy_improvement_bps(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: default_slippage_bps(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            auto_whitelist_routers: default_true(),
            batch_interval_secs: default_batch_interval(),
            dry_run: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_apy_improvement(), dec!(0.5));
    }

    #[test]
    fn test_rejects_full_slippage() {
        let mut config = Config::default();
        config.execution.slippage_bps = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_vaults() {
        let seed = VaultSeed {
            address: Address::repeat_byte(0x0a),
            asset: Address::repeat_byte(0x01),
            apy: Some(dec!(3.0)),
            decimals: 6,
            deposits: Vec::new(),
        };
        let config = Config {
            vaults: vec![seed.clone(), seed],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sections_deserialize_with_defaults() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "decision": {"min_apy_improvement_bps": 200},
            "vaults": [{
                "address": "0x0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a",
                "asset": "0x0101010101010101010101010101010101010101",
                "deposits": [{"user": "0x2222222222222222222222222222222222222222", "amount": 1000}]
            }]
        }))
        .unwrap();

        assert_eq!(config.decision.min_apy_improvement_bps, 200);
        assert_eq!(config.execution.slippage_bps, 50);
        assert_eq!(config.vaults[0].decimals, 6);
        assert_eq!(config.vaults[0].deposits[0].amount, 1_000);
        assert!(config.validate().is_ok());
    }
}
