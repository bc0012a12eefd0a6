//! # Vault Reallocator
//!
//! Moves user positions between whitelisted yield vaults when a better
//! yield is available, through an atomic redeem, swap and deposit.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `ledger`: Position ledger, token custody, vaults, routers and the ledger client
//! - `gateway`: Yield oracle and swap gateway clients
//! - `strategy`: Decision engine and reallocation executor
//! - `persistence`: SQLite-based optimization record store
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
