//! Reallocation decision engine.
//!
//! Compares a position's current yield against the best yield available
//! across whitelisted vaults and decides whether moving is worth it.

use crate::gateway::{YieldOpportunity, YieldOracle};
use crate::ledger::{Position, VaultInfo};
use alloy_primitives::Address;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Go/no-go verdict for one position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub proceed: bool,
    pub target_vault: Option<Address>,
    pub target_asset: Option<Address>,
    pub target_yield: Option<Decimal>,
    pub current_yield: Option<Decimal>,
    pub reason: String,
    /// Oracle lookups that failed or timed out during evaluation
    pub oracle_errors: usize,
    /// The lookup for the position's own vault failed or timed out
    pub current_lookup_failed: bool,
}

impl Decision {
    fn skip(reason: impl Into<String>, current_yield: Option<Decimal>) -> Self {
        Self {
            proceed: false,
            target_vault: None,
            target_asset: None,
            target_yield: None,
            current_yield,
            reason: reason.into(),
            oracle_errors: 0,
            current_lookup_failed: false,
        }
    }

    /// The current vault could not be priced because its oracle lookup
    /// failed, as opposed to the oracle reporting nothing for it.
    pub fn oracle_unreachable(&self) -> bool {
        self.current_lookup_failed
    }

    /// APY gain of the target over the current vault, in percentage points.
    pub fn improvement(&self) -> Option<Decimal> {
        Some(self.target_yield? - self.current_yield?)
    }
}

/// Oracle readings from one pass over a vault list.
#[derive(Debug, Default)]
struct Scan {
    opportunities: Vec<YieldOpportunity>,
    /// Vaults whose lookup failed or timed out
    failed: Vec<Address>,
}

/// Evaluates positions against oracle yields.
pub struct DecisionEngine {
    oracle: Arc<dyn YieldOracle>,
    /// Minimum improvement in percentage points
    threshold: Decimal,
    request_timeout: Duration,
}

impl DecisionEngine {
    pub fn new(oracle: Arc<dyn YieldOracle>, threshold: Decimal, request_timeout: Duration) -> Self {
        Self {
            oracle,
            threshold,
            request_timeout,
        }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Query the oracle for every vault, in order.
    ///
    /// Vaults reporting no yield are left out; failures and timeouts are
    /// collected so one bad lookup never stops the others.
    async fn scan(&self, vaults: &[VaultInfo]) -> Scan {
        let mut scan = Scan {
            opportunities: Vec::with_capacity(vaults.len()),
            failed: Vec::new(),
        };

        for vault in vaults {
            match timeout(self.request_timeout, self.oracle.get_yield(vault)).await {
                Ok(Ok(Some(opportunity))) if opportunity.apy > Decimal::ZERO => {
                    debug!(vault = %vault.address, apy = %opportunity.apy, "Yield reading");
                    scan.opportunities.push(opportunity);
                }
                Ok(Ok(_)) => {
                    debug!(vault = %vault.address, "No yield reading");
                }
                Ok(Err(e)) => {
                    scan.failed.push(vault.address);
                    warn!(vault = %vault.address, error = %e, "Yield oracle lookup failed, skipping vault");
                }
                Err(_) => {
                    scan.failed.push(vault.address);
                    warn!(
                        vault = %vault.address,
                        timeout_secs = self.request_timeout.as_secs(),
                        "Yield oracle lookup timed out, skipping vault"
                    );
                }
            }
        }

        scan
    }

    /// Decide whether `position` should move to another of `vaults`.
    ///
    /// Vaults serving the position's asset are preferred; any vault is
    /// considered when no other vault of that asset has a reading. Ties go
    /// to the vault listed first. A current vault the oracle reports nothing
    /// for is treated as earning 0%.
    pub async fn evaluate(&self, position: &Position, vaults: &[VaultInfo]) -> Decision {
        if !position.active {
            return Decision::skip("position is inactive", None);
        }

        let mut scan = self.scan(vaults).await;
        if !vaults.iter().any(|v| v.address == position.vault) {
            let current = VaultInfo {
                address: position.vault,
                asset: position.asset,
            };
            let extra = self.scan(std::slice::from_ref(&current)).await;
            scan.opportunities.extend(extra.opportunities);
            scan.failed.extend(extra.failed);
        }

        let mut decision = self.decide(position, vaults, &scan);
        decision.oracle_errors = scan.failed.len();
        decision.current_lookup_failed = scan.failed.contains(&position.vault);
        decision
    }

    fn decide(&self, position: &Position, vaults: &[VaultInfo], scan: &Scan) -> Decision {
        if scan.failed.contains(&position.vault) {
            return Decision::skip("yield oracle lookup failed for current vault", None);
        }

        let current_yield = match scan.opportunities.iter().find(|o| o.vault == position.vault) {
            Some(reading) => reading.apy,
            None => {
                debug!(vault = %position.vault, "No yield reading for current vault, assuming 0%");
                Decimal::ZERO
            }
        };

        let whitelisted = |o: &&YieldOpportunity| vaults.iter().any(|v| v.address == o.vault);
        let same_asset: Vec<&YieldOpportunity> = scan
            .opportunities
            .iter()
            .filter(whitelisted)
            .filter(|o| o.asset == position.asset)
            .collect();
        let candidates = if same_asset.iter().any(|o| o.vault != position.vault) {
            same_asset
        } else {
            scan.opportunities.iter().filter(whitelisted).collect()
        };

        let mut best: Option<&YieldOpportunity> = None;
        for candidate in candidates {
            if best.map_or(true, |b| candidate.apy > b.apy) {
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            return Decision::skip("no yield opportunities available", Some(current_yield));
        };

        if best.vault == position.vault {
            return Decision::skip(
                "current vault already offers the best yield",
                Some(current_yield),
            );
        }

        let improvement = best.apy - current_yield;
        let proceed = improvement >= self.threshold;
        let reason = if proceed {
            format!(
                "{} offers {}% vs {}% (+{}pp)",
                best.vault, best.apy, current_yield, improvement
            )
        } else {
            format!(
                "improvement {}pp below threshold {}pp",
                improvement, self.threshold
            )
        };

        info!(
            vault = %position.vault,
            target = %best.vault,
            current = %current_yield,
            best = %best.apy,
            proceed,
            "Position evaluated"
        );

        Decision {
            proceed,
            target_vault: Some(best.vault),
            target_asset: Some(best.asset),
            target_yield: Some(best.apy),
            current_yield: Some(current_yield),
            reason,
            oracle_errors: 0,
            current_lookup_failed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockYieldOracle, StaticYieldOracle};
    use alloy_primitives::U256;
    use rust_decimal_macros::dec;

    const USDC: Address = Address::repeat_byte(0x01);
    const DAI: Address = Address::repeat_byte(0x02);
    const VAULT_A: Address = Address::repeat_byte(0x0a);
    const VAULT_B: Address = Address::repeat_byte(0x0b);
    const VAULT_C: Address = Address::repeat_byte(0x0c);
    const VAULT_DAI: Address = Address::repeat_byte(0x0d);

    fn vault(address: Address, asset: Address) -> VaultInfo {
        VaultInfo { address, asset }
    }

    fn position_in(vault: Address, asset: Address) -> Position {
        Position {
            vault,
            asset,
            shares: U256::from(1_000u64),
            assets: U256::from(1_000u64),
            active: true,
        }
    }

    fn engine(oracle: impl YieldOracle + 'static, threshold: Decimal) -> DecisionEngine {
        DecisionEngine::new(Arc::new(oracle), threshold, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_proceeds_when_improvement_meets_threshold() {
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(3.0)), (VAULT_B, dec!(4.2))]);
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(decision.proceed);
        assert_eq!(decision.target_vault, Some(VAULT_B));
        assert_eq!(decision.improvement(), Some(dec!(1.2)));
    }

    #[tokio::test]
    async fn test_holds_when_improvement_below_threshold() {
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(3.0)), (VAULT_B, dec!(4.2))]);
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, dec!(2))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(!decision.proceed);
        assert_eq!(decision.target_vault, Some(VAULT_B));
        assert!(decision.reason.contains("below threshold"));
    }

    #[tokio::test]
    async fn test_never_targets_current_vault() {
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(9.0)), (VAULT_B, dec!(4.2))]);
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, Decimal::ZERO)
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(!decision.proceed);
        assert_eq!(decision.target_vault, None);
    }

    #[tokio::test]
    async fn test_ties_go_to_first_listed_vault() {
        let oracle = StaticYieldOracle::with_yields([
            (VAULT_A, dec!(3.0)),
            (VAULT_C, dec!(5.0)),
            (VAULT_B, dec!(5.0)),
        ]);
        let vaults = [
            vault(VAULT_A, USDC),
            vault(VAULT_C, USDC),
            vault(VAULT_B, USDC),
        ];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert_eq!(decision.target_vault, Some(VAULT_C));
    }

    #[tokio::test]
    async fn test_prefers_same_asset_then_falls_back() {
        let vaults = [
            vault(VAULT_A, USDC),
            vault(VAULT_B, USDC),
            vault(VAULT_DAI, DAI),
        ];

        let oracle = StaticYieldOracle::with_yields([
            (VAULT_A, dec!(3.0)),
            (VAULT_B, dec!(4.0)),
            (VAULT_DAI, dec!(8.0)),
        ]);
        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;
        assert_eq!(decision.target_vault, Some(VAULT_B));

        // The only other USDC vault has no reading
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(3.0)), (VAULT_DAI, dec!(8.0))]);
        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;
        assert!(decision.proceed);
        assert_eq!(decision.target_vault, Some(VAULT_DAI));
        assert_eq!(decision.target_asset, Some(DAI));
    }

    #[tokio::test]
    async fn test_oracle_failure_skips_only_that_vault() {
        let mut oracle = MockYieldOracle::new();
        oracle.expect_get_yield().times(3).returning(|v| {
            let apy = match v.address {
                a if a == VAULT_A => dec!(3.0),
                a if a == VAULT_B => anyhow::bail!("oracle down"),
                _ => dec!(4.0),
            };
            Ok(Some(YieldOpportunity {
                vault: v.address,
                asset: v.asset,
                apy,
                apr: apy,
                timestamp: chrono::Utc::now(),
            }))
        });
        let vaults = [
            vault(VAULT_A, USDC),
            vault(VAULT_B, USDC),
            vault(VAULT_C, USDC),
        ];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(decision.proceed);
        assert_eq!(decision.target_vault, Some(VAULT_C));
        assert_eq!(decision.oracle_errors, 1);
    }

    #[tokio::test]
    async fn test_no_opportunities() {
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(StaticYieldOracle::new(), dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(!decision.proceed);
        assert!(decision.reason.contains("no yield opportunities"));
        assert!(!decision.oracle_unreachable());

        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(3.0))]);
        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;
        assert!(!decision.proceed);
    }

    #[tokio::test]
    async fn test_unpriced_current_vault_counts_as_zero_yield() {
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, Decimal::ZERO), (VAULT_B, dec!(6.0))]);
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(decision.proceed);
        assert_eq!(decision.target_vault, Some(VAULT_B));
        assert_eq!(decision.current_yield, Some(Decimal::ZERO));
        assert_eq!(decision.improvement(), Some(dec!(6.0)));
    }

    #[tokio::test]
    async fn test_current_vault_lookup_failure_blocks_move() {
        let oracle = StaticYieldOracle::with_yields([(VAULT_A, dec!(3.0)), (VAULT_B, dec!(6.0))]);
        oracle.fail_for(VAULT_A, true).await;
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(!decision.proceed);
        assert!(decision.oracle_unreachable());
        assert_eq!(decision.current_yield, None);
        assert_eq!(decision.oracle_errors, 1);
    }

    #[tokio::test]
    async fn test_candidate_lookup_failure_is_not_unreachable() {
        // Nothing for the current vault, and the only candidate errors
        let oracle = StaticYieldOracle::new();
        oracle.fail_for(VAULT_B, true).await;
        let vaults = [vault(VAULT_A, USDC), vault(VAULT_B, USDC)];

        let decision = engine(oracle, dec!(0.5))
            .evaluate(&position_in(VAULT_A, USDC), &vaults)
            .await;

        assert!(!decision.proceed);
        assert!(!decision.oracle_unreachable());
        assert_eq!(decision.oracle_errors, 1);
        assert!(decision.reason.contains("no yield opportunities"));
    }
}
