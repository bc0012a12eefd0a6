//! Vault Reallocator - Main Entry Point
//!
//! Runs the reallocation pipeline against an in-process ledger seeded from
//! configuration, with HTTP or simulated yield and swap gateways.

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use vault_reallocator::config::Config;
use vault_reallocator::gateway::{
    HttpSwapGateway, HttpYieldOracle, SimulatedSwapGateway, StaticYieldOracle, SwapGateway,
    YieldOracle,
};
use vault_reallocator::ledger::{LocalLedgerClient, PositionLedger, ShareVault, SimulatedRouter};
use vault_reallocator::persistence::OptimizationStore;
use vault_reallocator::strategy::{
    BatchSummary, DecisionEngine, ExecutionOutcome, ExecutionStatus, ReallocationExecutor,
};
use vault_reallocator::utils::{round_to_precision, to_display_units};

/// Vault Reallocator CLI
#[derive(Parser)]
#[command(name = "vault-reallocator")]
#[command(version, about = "Yield-driven reallocation of vault positions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic reallocation batch (default)
    Run {
        /// Run a single batch and exit
        #[arg(long)]
        once: bool,

        /// Plan reallocations without submitting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Evaluate and reallocate a single position
    Execute {
        /// Position owner address
        #[arg(short, long)]
        user: String,

        /// Position index
        #[arg(short, long, default_value = "0")]
        index: usize,

        /// Print the computed plan instead of submitting it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show optimization history from the record store
    Status {
        /// Path to SQLite database (default: data/optimizations.db)
        #[arg(short, long, default_value = "data/optimizations.db")]
        db: String,

        /// Show individual optimization records
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Ledger and executor wired from configuration.
struct Pipeline {
    ledger: Arc<PositionLedger>,
    executor: ReallocationExecutor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let command = cli.command.unwrap_or(Commands::Run {
        once: false,
        dry_run: false,
    });

    if let Commands::Status { db, verbose } = &command {
        return show_status(db, *verbose);
    }

    let mut config = Config::load()?;
    config.validate()?;

    match command {
        Commands::Run { once, dry_run } => {
            config.execution.dry_run |= dry_run;
            run_batches(config, once).await
        }
        Commands::Execute {
            user,
            index,
            dry_run,
        } => {
            let user = Address::from_str(&user)
                .with_context(|| format!("Invalid user address: {user}"))?;
            config.execution.dry_run |= dry_run;
            execute_single(config, user, index).await
        }
        Commands::Status { .. } => Ok(()),
    }
}

/// Scheduled loop: one batch per interval until shutdown.
async fn run_batches(config: Config, once: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║           Vault Reallocator v{} - Batch Mode             ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let executor = build_pipeline(&config)
        .await?
        .executor
        .with_shutdown(shutdown.clone());
    let interval = Duration::from_secs(config.execution.batch_interval_secs);

    info!("🚀 Starting reallocation loop...");

    while !shutdown.load(Ordering::SeqCst) {
        // Dropping the batch abandons any in-flight confirmation wait
        let summary = tokio::select! {
            summary = executor.execute_all() => summary,
            _ = wait_for_shutdown(&shutdown) => {
                warn!("Batch interrupted by shutdown");
                break;
            }
        };
        log_summary(&summary);

        if once {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_for_shutdown(&shutdown) => {}
        }
    }

    let stats = executor.store().lock().await.stats()?;
    info!(
        optimizations = stats.total_optimizations,
        attempts = stats.total_attempts,
        success_rate = %stats.success_rate,
        "👋 Vault Reallocator shutdown complete"
    );
    Ok(())
}

/// Manual trigger for one position.
async fn execute_single(config: Config, user: Address, index: usize) -> Result<()> {
    let pipeline = build_pipeline(&config).await?;
    let outcome = pipeline.executor.execute(user, index).await;
    print_outcome(&outcome)?;

    if outcome.success() {
        let decimals = decimals_by_asset(&config);
        for (i, position) in pipeline
            .ledger
            .get_user_positions(user)
            .await
            .iter()
            .enumerate()
        {
            let units = decimals.get(&position.asset).copied().unwrap_or(18);
            println!(
                "   [{}] vault {} | {} assets | active: {}",
                i,
                position.vault,
                display_amount(position.assets, units),
                position.active
            );
        }
    }
    Ok(())
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Build the simulated ledger from configured vault seeds and wire the executor.
async fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let chain = &config.chain;
    let ledger = Arc::new(PositionLedger::new(chain.ledger_address, chain.owner));

    let mut router = SimulatedRouter::new(config.swap.router);
    let assets: Vec<Address> = config.vaults.iter().map(|v| v.asset).collect();
    for input in &assets {
        for output in &assets {
            if input != output {
                router = router.with_rate(*input, *output, 10_000);
            }
        }
    }
    ledger.register_router(Box::new(router.clone())).await;
    ledger
        .set_router_whitelist(chain.owner, config.swap.router, true)
        .await?;
    ledger.set_operator(chain.owner, chain.signer, true).await?;

    for seed in &config.vaults {
        ledger
            .register_vault(Box::new(ShareVault::new(seed.address, seed.asset)))
            .await;
        ledger
            .set_vault_whitelist(chain.owner, seed.address, true)
            .await?;

        for deposit in &seed.deposits {
            let amount = U256::from(deposit.amount);
            ledger.mint(seed.asset, deposit.user, amount).await?;
            ledger
                .approve(deposit.user, seed.asset, chain.ledger_address, amount)
                .await;
            let shares = ledger
                .deposit(deposit.user, seed.address, amount, U256::ZERO)
                .await?;
            info!(
                user = %deposit.user,
                vault = %seed.address,
                amount = %display_amount(amount, seed.decimals),
                %shares,
                "Seeded position"
            );
        }
    }

    info!(
        ledger = %ledger.address(),
        owner = %ledger.owner().await,
        fee_bps = ledger.fee_bps().await,
        vaults = ledger.whitelisted_vaults().await.len(),
        "Simulated ledger ready"
    );

    let request_timeout = Duration::from_secs(config.execution.request_timeout_secs);
    let oracle: Arc<dyn YieldOracle> = if config.oracle.base_url.is_empty() {
        info!("Using static yield readings from vault seeds");
        Arc::new(StaticYieldOracle::with_yields(
            config
                .vaults
                .iter()
                .filter_map(|v| v.apy.map(|apy| (v.address, apy))),
        ))
    } else {
        let oracle = HttpYieldOracle::new(&config.oracle, &chain.name)?;
        info!(base_url = oracle.base_url(), "Using HTTP yield oracle");
        Arc::new(oracle)
    };

    let swaps: Arc<dyn SwapGateway> = if config.swap.base_url.is_empty() {
        info!(router = %config.swap.router, "Quoting swaps against the simulated router");
        Arc::new(SimulatedSwapGateway::new(
            router,
            config.execution.slippage_bps,
        ))
    } else {
        Arc::new(HttpSwapGateway::new(&config.swap, &chain.name)?)
    };

    if let Some(parent) = Path::new(&config.persistence.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(Mutex::new(OptimizationStore::new(
        &config.persistence.db_path,
    )?));

    let client = Arc::new(LocalLedgerClient::new(ledger.clone(), chain.signer));
    let engine = DecisionEngine::new(oracle, config.min_apy_improvement(), request_timeout);
    let executor = ReallocationExecutor::new(
        client,
        engine,
        swaps,
        store,
        config.execution.clone(),
    );

    Ok(Pipeline { ledger, executor })
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "vault-reallocator.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vault_reallocator=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Chain: {}", config.chain.name);
    info!("   Ledger: {}", config.chain.ledger_address);
    info!("   Signer: {}", config.chain.signer);
    info!(
        "   Min APY Improvement: {}pp",
        config.min_apy_improvement()
    );
    info!(
        "   Slippage: {} bps",
        config.execution.slippage_bps
    );
    info!(
        "   Batch Interval: {}s",
        config.execution.batch_interval_secs
    );
    info!(
        "   Oracle: {}",
        if config.oracle.base_url.is_empty() {
            "static"
        } else {
            config.oracle.base_url.as_str()
        }
    );
    info!(
        "   Swap Gateway: {}",
        if config.swap.base_url.is_empty() {
            "simulated"
        } else {
            config.swap.base_url.as_str()
        }
    );
    info!("   Vaults: {}", config.vaults.len());
    if config.execution.dry_run {
        warn!("   DRY RUN - reallocations are planned, not submitted");
    }
}

fn log_summary(summary: &BatchSummary) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "📊 Batch: {} evaluated | {} executed | {} skipped | {} failed | {} planned",
        summary.evaluated, summary.executed, summary.skipped, summary.failed, summary.planned
    );
    for outcome in &summary.outcomes {
        match outcome.status {
            ExecutionStatus::Executed => info!(
                "   ✅ {} #{}: {} → {}",
                outcome.user,
                outcome.position_index,
                fmt_opt(outcome.from_vault),
                fmt_opt(outcome.to_vault)
            ),
            ExecutionStatus::Failed => warn!(
                "   ❌ {} #{}: {}",
                outcome.user,
                outcome.position_index,
                outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            ),
            _ => {}
        }
    }
}

fn print_outcome(outcome: &ExecutionOutcome) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REALLOCATION OUTCOME                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    println!("\n📍 Position");
    println!("   ├─ User:     {}", outcome.user);
    println!("   ├─ Index:    {}", outcome.position_index);
    println!("   └─ Status:   {:?}", outcome.status);

    println!("\n📈 Yield");
    println!("   ├─ From:     {} @ {}%", fmt_opt(outcome.from_vault), fmt_opt(outcome.previous_apy));
    println!("   └─ To:       {} @ {}%", fmt_opt(outcome.to_vault), fmt_opt(outcome.new_apy));

    if let Some(reason) = &outcome.reason {
        println!("\n💬 {}", reason);
    }
    if let Some(error) = &outcome.error {
        println!("\n❌ {} (retryable: {})", error, error.is_retryable());
    }
    if let Some(tx_hash) = outcome.tx_hash {
        println!("\n🔗 Transaction: {}", tx_hash);
    }
    if outcome.status == ExecutionStatus::Planned {
        if let Some(plan) = &outcome.plan {
            println!("\n📝 Plan");
            println!("{}", serde_json::to_string_pretty(plan)?);
        }
    }
    Ok(())
}

fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              VAULT REALLOCATOR STATUS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The reallocator has not run yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = OptimizationStore::new(db_path)?;
    let stats = store.stats()?;

    println!("\n📊 Optimization Summary");
    println!("   ├─ Optimizations:    {}", stats.total_optimizations);
    println!("   ├─ Attempts:         {}", stats.total_attempts);
    println!(
        "   ├─ Success Rate:     {:.1}%",
        stats.success_rate * Decimal::ONE_HUNDRED
    );
    println!("   ├─ Total Reallocated: {}", stats.total_assets_reallocated);
    println!(
        "   └─ Avg Improvement:  {}pp",
        round_to_precision(stats.average_apy_improvement, 4)
    );

    let limit = if verbose { 50 } else { 5 };
    let records = store.recent_records(limit)?;
    if !records.is_empty() {
        println!("\n🔄 Recent Optimizations");
        for record in records {
            println!(
                "   ┌─ {} #{} @ {}",
                record.user,
                record.position_index,
                record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("   ├─ {} → {}", record.from_vault, record.to_vault);
            println!(
                "   ├─ APY: {}% → {}% ({:+}pp)",
                record.previous_apy,
                record.new_apy,
                record.apy_improvement()
            );
            if verbose {
                if let Some(tx_hash) = record.tx_hash {
                    println!("   ├─ Tx: {}", tx_hash);
                }
            }
            println!("   └─ Assets: {}", record.assets_reallocated);
        }
    }

    Ok(())
}

fn decimals_by_asset(config: &Config) -> HashMap<Address, u32> {
    config
        .vaults
        .iter()
        .map(|v| (v.asset, v.decimals))
        .collect()
}

fn display_amount(amount: U256, decimals: u32) -> String {
    to_display_units(amount, decimals)
        .map(|d| d.to_string())
        .unwrap_or_else(|| amount.to_string())
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
