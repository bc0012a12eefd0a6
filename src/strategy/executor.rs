//! Reallocation execution: single positions and scheduled batches.

use crate::config::ExecutionConfig;
use crate::gateway::{SwapGateway, SwapRequest};
use crate::ledger::{ClientError, LedgerClient, LedgerError, Position, ReallocateParams, SwapLeg};
use crate::persistence::{OptimizationRecord, OptimizationStore};
use crate::strategy::decision::DecisionEngine;
use crate::utils::apply_slippage;
use alloy_primitives::{Address, B256, U256};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Why an execution attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("yield oracle unavailable: {0}")]
    Oracle(String),

    #[error("swap quote failed: {0}")]
    Quote(String),

    /// Needs operator intervention; never retried automatically
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: B256, reason: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to persist optimization: {0}")]
    Persistence(String),
}

impl ExecutionError {
    /// Transient failures worth another try on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Oracle(_)
                | ExecutionError::Quote(_)
                | ExecutionError::Timeout { .. }
                | ExecutionError::Transport(_)
        )
    }
}

impl From<ClientError> for ExecutionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(msg) => ExecutionError::Transport(msg),
            ClientError::Call(LedgerError::Unauthorized { caller }) => {
                ExecutionError::Unauthorized(format!("{caller} may not perform this call"))
            }
            ClientError::Call(e) => ExecutionError::Validation(e.to_string()),
            ClientError::UnknownTransaction(hash) => {
                ExecutionError::Transport(format!("receipt for {hash} not found"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Executed,
    Skipped,
    Failed,
    /// Computed in dry-run mode, not submitted
    Planned,
}

/// A fully computed reallocation that has not been submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReallocationPlan {
    pub user: Address,
    pub position_index: usize,
    pub from_vault: Address,
    pub to_vault: Address,
    pub source_asset: Address,
    pub target_asset: Address,
    /// Position valuation at planning time
    pub assets: U256,
    /// Target-asset amount expected to reach the target vault
    pub expected_assets: Option<U256>,
    pub legs: Vec<SwapLeg>,
    /// Routers that would be whitelisted through governance first
    pub routers_to_whitelist: Vec<Address>,
    pub params: ReallocateParams,
}

/// Result of evaluating and possibly executing one position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub user: Address,
    pub position_index: usize,
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub error: Option<ExecutionError>,
    pub from_vault: Option<Address>,
    pub to_vault: Option<Address>,
    pub previous_apy: Option<Decimal>,
    pub new_apy: Option<Decimal>,
    pub assets: Option<U256>,
    pub tx_hash: Option<B256>,
    pub plan: Option<ReallocationPlan>,
}

impl ExecutionOutcome {
    fn new(user: Address, position_index: usize) -> Self {
        Self {
            user,
            position_index,
            status: ExecutionStatus::Failed,
            reason: None,
            error: None,
            from_vault: None,
            to_vault: None,
            previous_apy: None,
            new_apy: None,
            assets: None,
            tx_hash: None,
            plan: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Executed
    }
}

/// Tally of one `execute_all` run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub evaluated: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub planned: usize,
    pub outcomes: Vec<ExecutionOutcome>,
}

impl BatchSummary {
    fn push(&mut self, outcome: ExecutionOutcome) {
        self.evaluated += 1;
        match outcome.status {
            ExecutionStatus::Executed => self.executed += 1,
            ExecutionStatus::Skipped => self.skipped += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Planned => self.planned += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Drives go-decisions through quote, router whitelisting, submission and
/// confirmation, then records the result.
pub struct ReallocationExecutor {
    ledger: Arc<dyn LedgerClient>,
    engine: DecisionEngine,
    swaps: Arc<dyn SwapGateway>,
    store: Arc<Mutex<OptimizationStore>>,
    config: ExecutionConfig,
    shutdown: Arc<AtomicBool>,
}

impl ReallocationExecutor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        engine: DecisionEngine,
        swaps: Arc<dyn SwapGateway>,
        store: Arc<Mutex<OptimizationStore>>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            ledger,
            engine,
            swaps,
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag checked between positions of a batch.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &Arc<Mutex<OptimizationStore>> {
        &self.store
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_timeout_secs)
    }

    /// Evaluate and, on a go-decision, reallocate one position.
    ///
    /// Honors the configured dry-run setting.
    pub async fn execute(&self, user: Address, position_index: usize) -> ExecutionOutcome {
        self.execute_with(user, position_index, self.config.dry_run)
            .await
    }

    /// Compute the reallocation for one position without submitting anything.
    pub async fn plan(&self, user: Address, position_index: usize) -> ExecutionOutcome {
        self.execute_with(user, position_index, true).await
    }

    async fn execute_with(
        &self,
        user: Address,
        position_index: usize,
        dry_run: bool,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::new(user, position_index);

        if let Err(e) = self.try_execute(&mut outcome, dry_run).await {
            if e.is_retryable() {
                warn!(%user, position_index, error = %e, "Reallocation failed, will retry next cycle");
            } else {
                error!(%user, position_index, error = %e, "Reallocation failed");
            }
            outcome.status = ExecutionStatus::Failed;
            outcome.error = Some(e);
        }

        if matches!(
            outcome.status,
            ExecutionStatus::Executed | ExecutionStatus::Failed
        ) {
            let error = outcome.error.as_ref().map(|e| e.to_string());
            let store = self.store.lock().await;
            if let Err(e) =
                store.record_attempt(user, position_index, outcome.success(), error.as_deref())
            {
                warn!(error = %e, "Failed to log execution attempt");
            }
        }

        outcome
    }

    async fn try_execute(
        &self,
        outcome: &mut ExecutionOutcome,
        dry_run: bool,
    ) -> Result<(), ExecutionError> {
        let user = outcome.user;
        let index = outcome.position_index;

        // 1. Fresh position and decision
        let positions = bounded(
            self.request_timeout(),
            "position lookup",
            self.ledger.get_user_positions(user),
        )
        .await??;
        let position = positions.get(index).cloned().ok_or_else(|| {
            ExecutionError::Validation(format!(
                "position index {index} out of range ({} positions)",
                positions.len()
            ))
        })?;
        outcome.from_vault = Some(position.vault);
        outcome.assets = Some(position.assets);

        if !position.active {
            outcome.status = ExecutionStatus::Skipped;
            outcome.reason = Some("position is inactive".to_string());
            return Ok(());
        }

        let vaults = bounded(
            self.request_timeout(),
            "whitelist lookup",
            self.ledger.whitelisted_vaults(),
        )
        .await??;
        // Redeeming from a de-whitelisted vault always reverts
        if !vaults.iter().any(|v| v.address == position.vault) {
            return Err(ExecutionError::Validation(format!(
                "source vault {} is not whitelisted",
                position.vault
            )));
        }

        let decision = self.engine.evaluate(&position, &vaults).await;
        outcome.previous_apy = decision.current_yield;
        outcome.reason = Some(decision.reason.clone());

        if decision.oracle_unreachable() {
            return Err(ExecutionError::Oracle(decision.reason));
        }
        let (true, Some(target_vault), Some(target_asset)) = (
            decision.proceed,
            decision.target_vault,
            decision.target_asset,
        ) else {
            debug!(%user, index, reason = %decision.reason, "Reallocation not warranted");
            outcome.status = ExecutionStatus::Skipped;
            return Ok(());
        };
        outcome.to_vault = Some(target_vault);
        outcome.new_apy = decision.target_yield;

        // 2-3. Swap legs and router whitelist status
        let plan = self
            .build_plan(user, index, &position, target_vault, target_asset)
            .await?;

        if dry_run {
            info!(
                %user,
                index,
                from = %plan.from_vault,
                to = %plan.to_vault,
                legs = plan.legs.len(),
                min_shares_out = %plan.params.min_shares_out,
                "Dry run: reallocation planned"
            );
            outcome.status = ExecutionStatus::Planned;
            outcome.plan = Some(plan);
            return Ok(());
        }

        for router in &plan.routers_to_whitelist {
            self.whitelist_router(*router).await?;
        }

        // 4. Submit and confirm
        let tx_hash = bounded(
            self.confirmation_timeout(),
            "reallocate submission",
            self.ledger.submit_reallocate(user, index, plan.params.clone()),
        )
        .await??;
        outcome.tx_hash = Some(tx_hash);

        let receipt = bounded(
            self.confirmation_timeout(),
            "reallocate confirmation",
            self.ledger.wait_for_receipt(tx_hash),
        )
        .await??;

        if !receipt.success {
            return Err(revert_error(tx_hash, receipt.revert_reason));
        }
        let assets = receipt.reallocated_assets().unwrap_or_else(|| {
            warn!(%tx_hash, "Receipt has no reallocation event, recording planned amount");
            position.assets
        });
        outcome.assets = Some(assets);

        info!(
            %user,
            index,
            from = %position.vault,
            to = %target_vault,
            %assets,
            new_shares = ?receipt.output,
            %tx_hash,
            "Reallocation confirmed"
        );
        outcome.status = ExecutionStatus::Executed;
        outcome.plan = Some(plan);

        // 5. Audit trail
        let record = OptimizationRecord {
            user,
            position_index: index,
            from_vault: position.vault,
            to_vault: target_vault,
            assets_reallocated: assets,
            previous_apy: decision.current_yield.unwrap_or_default(),
            new_apy: decision.target_yield.unwrap_or_default(),
            tx_hash: Some(tx_hash),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.lock().await.record_optimization(&record) {
            error!(%tx_hash, error = %e, "Reallocation confirmed but record not stored");
            outcome.error = Some(ExecutionError::Persistence(e.to_string()));
        }

        Ok(())
    }

    async fn build_plan(
        &self,
        user: Address,
        index: usize,
        position: &Position,
        target_vault: Address,
        target_asset: Address,
    ) -> Result<ReallocationPlan, ExecutionError> {
        let mut legs = Vec::new();
        let mut routers_to_whitelist = Vec::new();

        let expected_assets = if target_asset == position.asset {
            Some(position.assets)
        } else {
            let ledger = self.ledger.address();
            let request = SwapRequest {
                input_token: position.asset,
                output_token: target_asset,
                input_amount: position.assets,
                user_address: ledger,
                output_receiver: ledger,
            };
            let quote = bounded(
                self.request_timeout(),
                "swap quote",
                self.swaps.quote(&request),
            )
            .await?
            .map_err(|e| ExecutionError::Quote(format!("{e:#}")))?;

            let whitelisted = bounded(
                self.request_timeout(),
                "router lookup",
                self.ledger.is_router_whitelisted(quote.router),
            )
            .await??;
            if !whitelisted {
                routers_to_whitelist.push(quote.router);
            }

            legs.push(SwapLeg {
                router: quote.router,
                calldata: quote.calldata,
                input_token: position.asset,
                output_token: target_asset,
                input_amount: position.assets,
            });

            if quote.amount_out.is_none() {
                warn!(%user, index, "Swap quote has no expected output, deposit floor is one share");
            }
            quote.amount_out
        };

        let min_shares_out = match expected_assets {
            Some(expected) => {
                let preview = bounded(
                    self.request_timeout(),
                    "deposit preview",
                    self.ledger.preview_deposit(target_vault, expected),
                )
                .await??;
                apply_slippage(preview, self.config.slippage_bps)
            }
            None => U256::from(1u8),
        };

        let params = ReallocateParams::new(target_vault, &legs, min_shares_out);

        Ok(ReallocationPlan {
            user,
            position_index: index,
            from_vault: position.vault,
            to_vault: target_vault,
            source_asset: position.asset,
            target_asset,
            assets: position.assets,
            expected_assets,
            legs,
            routers_to_whitelist,
            params,
        })
    }

    /// Whitelist `router` through governance and wait for confirmation.
    async fn whitelist_router(&self, router: Address) -> Result<(), ExecutionError> {
        if !self.config.auto_whitelist_routers {
            return Err(ExecutionError::Unauthorized(format!(
                "router {router} is not whitelisted and auto-whitelisting is disabled"
            )));
        }

        info!(%router, "Whitelisting swap router");
        let tx_hash = bounded(
            self.confirmation_timeout(),
            "router whitelist submission",
            self.ledger.submit_router_whitelist(router, true),
        )
        .await??;
        let receipt = bounded(
            self.confirmation_timeout(),
            "router whitelist confirmation",
            self.ledger.wait_for_receipt(tx_hash),
        )
        .await??;

        if receipt.success {
            Ok(())
        } else {
            match revert_error(tx_hash, receipt.revert_reason) {
                ExecutionError::Unauthorized(_) => Err(ExecutionError::Unauthorized(format!(
                    "signer {} cannot whitelist router {router}; whitelist it manually",
                    self.ledger.signer()
                ))),
                other => Err(other),
            }
        }
    }

    /// Evaluate every active position of every user, one at a time.
    ///
    /// Individual failures are counted, never propagated. Stops early when
    /// the shutdown flag is raised.
    pub async fn execute_all(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let delay = Duration::from_millis(self.config.inter_call_delay_ms);

        let users = match bounded(
            self.request_timeout(),
            "user lookup",
            self.ledger.users_with_active_positions(),
        )
        .await
        {
            Ok(Ok(users)) => users,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to list users with active positions");
                return summary;
            }
            Err(e) => {
                error!(error = %e, "Failed to list users with active positions");
                return summary;
            }
        };

        info!(users = users.len(), "Starting reallocation batch");
        let mut first = true;

        'users: for user in users {
            let positions = match bounded(
                self.request_timeout(),
                "position lookup",
                self.ledger.get_user_positions(user),
            )
            .await
            {
                Ok(Ok(positions)) => positions,
                Ok(Err(e)) => {
                    warn!(%user, error = %e, "Failed to load positions, skipping user");
                    continue;
                }
                Err(e) => {
                    warn!(%user, error = %e, "Failed to load positions, skipping user");
                    continue;
                }
            };

            for (index, position) in positions.iter().enumerate() {
                if !position.active {
                    continue;
                }
                if self.shutdown.load(Ordering::SeqCst) {
                    info!("Shutdown requested, stopping batch");
                    break 'users;
                }
                if !first && !delay.is_zero() {
                    sleep(delay).await;
                }
                first = false;

                let outcome = self.execute(user, index).await;
                summary.push(outcome);
            }
        }

        info!(
            evaluated = summary.evaluated,
            executed = summary.executed,
            skipped = summary.skipped,
            failed = summary.failed,
            planned = summary.planned,
            "Reallocation batch complete"
        );
        summary
    }
}

/// Run `fut` under `limit`, mapping elapsed time to `ExecutionError::Timeout`.
async fn bounded<F: Future>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<F::Output, ExecutionError> {
    timeout(limit, fut)
        .await
        .map_err(|_| ExecutionError::Timeout {
            operation,
            secs: limit.as_secs(),
        })
}

fn revert_error(tx_hash: B256, reason: Option<LedgerError>) -> ExecutionError {
    match reason {
        Some(LedgerError::Unauthorized { caller }) => {
            ExecutionError::Unauthorized(format!("{caller} is not authorized (tx {tx_hash})"))
        }
        Some(reason) => ExecutionError::Reverted {
            tx_hash,
            reason: reason.to_string(),
        },
        None => ExecutionError::Reverted {
            tx_hash,
            reason: "unknown".to_string(),
        },
    }
}
