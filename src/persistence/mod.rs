//! SQLite persistence for optimization records.
//!
//! Keeps the off-chain audit trail of reallocations:
//! - Confirmed optimizations (append-only)
//! - Every execution attempt, for success-rate statistics

use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::utils::{safe_div, u256_to_decimal};

/// A confirmed reallocation. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecord {
    pub user: Address,
    pub position_index: usize,
    pub from_vault: Address,
    pub to_vault: Address,
    pub assets_reallocated: U256,
    pub previous_apy: Decimal,
    pub new_apy: Decimal,
    pub tx_hash: Option<B256>,
    pub timestamp: DateTime<Utc>,
}

impl OptimizationRecord {
    pub fn apy_improvement(&self) -> Decimal {
        self.new_apy - self.previous_apy
    }
}

/// Aggregate statistics over the stored history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationStats {
    pub total_optimizations: u64,
    pub total_attempts: u64,
    /// Fraction of attempts that succeeded (0.0-1.0)
    pub success_rate: Decimal,
    pub total_assets_reallocated: U256,
    /// Mean APY gain in percentage points
    pub average_apy_improvement: Decimal,
}

type RawRecord = (String, i64, String, String, String, String, String, Option<String>, String);

/// SQLite-backed optimization record store.
pub struct OptimizationStore {
    conn: Connection,
}

impl OptimizationStore {
    /// Open the store, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Optimization store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS optimizations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                position_index INTEGER NOT NULL,
                from_vault TEXT NOT NULL,
                to_vault TEXT NOT NULL,
                assets_reallocated TEXT NOT NULL,
                previous_apy TEXT NOT NULL,
                new_apy TEXT NOT NULL,
                tx_hash TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_optimizations_user ON optimizations(user);
            CREATE INDEX IF NOT EXISTS idx_optimizations_timestamp ON optimizations(timestamp);

            CREATE TABLE IF NOT EXISTS execution_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                user TEXT NOT NULL,
                position_index INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Append a confirmed optimization.
    pub fn record_optimization(&self, record: &OptimizationRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO optimizations (user, position_index, from_vault, to_vault,
                                       assets_reallocated, previous_apy, new_apy, tx_hash, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.user.to_string(),
                record.position_index as i64,
                record.from_vault.to_string(),
                record.to_vault.to_string(),
                record.assets_reallocated.to_string(),
                record.previous_apy.to_string(),
                record.new_apy.to_string(),
                record.tx_hash.map(|h| h.to_string()),
                record.timestamp.to_rfc3339(),
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!(id, user = %record.user, to = %record.to_vault, "Optimization recorded");
        Ok(id)
    }

    /// Log one execution attempt, successful or not.
    pub fn record_attempt(
        &self,
        user: Address,
        position_index: usize,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO execution_attempts (timestamp, user, position_index, success, error)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                Utc::now().to_rfc3339(),
                user.to_string(),
                position_index as i64,
                success as i32,
                error,
            ],
        )?;
        Ok(())
    }

    /// Optimizations for one user, oldest first.
    pub fn records_for_user(&self, user: Address) -> Result<Vec<OptimizationRecord>> {
        self.query_records(
            r#"
            SELECT user, position_index, from_vault, to_vault, assets_reallocated,
                   previous_apy, new_apy, tx_hash, timestamp
            FROM optimizations
            WHERE user = ?1
            ORDER BY id ASC
            "#,
            params![user.to_string()],
        )
    }

    /// Most recent optimizations, newest first.
    pub fn recent_records(&self, limit: usize) -> Result<Vec<OptimizationRecord>> {
        self.query_records(
            r#"
            SELECT user, position_index, from_vault, to_vault, assets_reallocated,
                   previous_apy, new_apy, tx_hash, timestamp
            FROM optimizations
            ORDER BY id DESC
            LIMIT ?1
            "#,
            params![limit as i64],
        )
    }

    pub fn stats(&self) -> Result<OptimizationStats> {
        let records = self.query_records(
            r#"
            SELECT user, position_index, from_vault, to_vault, assets_reallocated,
                   previous_apy, new_apy, tx_hash, timestamp
            FROM optimizations
            "#,
            [],
        )?;

        let (total_attempts, successes): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM execution_attempts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let total_assets_reallocated = records
            .iter()
            .fold(U256::ZERO, |acc, r| acc.saturating_add(r.assets_reallocated));
        let improvement_sum: Decimal = records.iter().map(|r| r.apy_improvement()).sum();

        Ok(OptimizationStats {
            total_optimizations: records.len() as u64,
            total_attempts: total_attempts as u64,
            success_rate: safe_div(Decimal::from(successes), Decimal::from(total_attempts)),
            total_assets_reallocated,
            average_apy_improvement: safe_div(improvement_sum, Decimal::from(records.len())),
        })
    }

    /// Total reallocated assets as a `Decimal`, for display.
    pub fn total_reallocated_display(&self) -> Result<Decimal> {
        Ok(u256_to_decimal(self.stats()?.total_assets_reallocated))
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<OptimizationRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows: Vec<RawRecord> = stmt
            .query_map(params, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter().map(decode_record).collect()
    }
}

fn decode_record(raw: RawRecord) -> Result<OptimizationRecord> {
    let (user, index, from_vault, to_vault, assets, previous_apy, new_apy, tx_hash, ts) = raw;

    Ok(OptimizationRecord {
        user: Address::from_str(&user).context("Invalid user address")?,
        position_index: usize::try_from(index).context("Invalid position index")?,
        from_vault: Address::from_str(&from_vault).context("Invalid from_vault")?,
        to_vault: Address::from_str(&to_vault).context("Invalid to_vault")?,
        assets_reallocated: U256::from_str(&assets).context("Invalid assets amount")?,
        previous_apy: Decimal::from_str(&previous_apy).unwrap_or_default(),
        new_apy: Decimal::from_str(&new_apy).unwrap_or_default(),
        tx_hash: tx_hash
            .map(|h| B256::from_str(&h))
            .transpose()
            .context("Invalid tx hash")?,
        timestamp: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
