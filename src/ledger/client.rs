//! Off-chain view of the ledger: reads, transaction submission and receipts.

use super::error::LedgerError;
use super::state::PositionLedger;
use super::types::{LedgerEvent, Position, ReallocateParams, VaultInfo};
use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Node unreachable or request dropped; safe to retry
    #[error("transport error: {0}")]
    Transport(String),

    /// A read call reverted
    #[error("call reverted: {0}")]
    Call(#[from] LedgerError),

    #[error("no receipt for transaction {0}")]
    UnknownTransaction(B256),
}

/// Outcome of a mined ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub nonce: u64,
    pub success: bool,
    /// Return value of the call when it produced one (new shares for `reallocate`)
    pub output: Option<U256>,
    pub revert_reason: Option<LedgerError>,
    /// Events the transaction raised; empty when it reverted
    pub logs: Vec<LedgerEvent>,
}

impl TxReceipt {
    /// Assets redeemed from the source vault by a `reallocate` call.
    pub fn reallocated_assets(&self) -> Option<U256> {
        self.logs.iter().find_map(|event| match event {
            LedgerEvent::PositionOptimized { assets, .. } => Some(*assets),
            _ => None,
        })
    }
}

/// What the executor needs from the ledger contract.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Ledger contract address (custodian of swapped funds).
    fn address(&self) -> Address;

    /// Address transactions are signed with.
    fn signer(&self) -> Address;

    async fn get_user_positions(&self, user: Address) -> Result<Vec<Position>, ClientError>;

    async fn users_with_active_positions(&self) -> Result<Vec<Address>, ClientError>;

    async fn whitelisted_vaults(&self) -> Result<Vec<VaultInfo>, ClientError>;

    async fn is_router_whitelisted(&self, router: Address) -> Result<bool, ClientError>;

    async fn preview_deposit(&self, vault: Address, assets: U256) -> Result<U256, ClientError>;

    /// Submit the governance call whitelisting `router`.
    async fn submit_router_whitelist(&self, router: Address, allowed: bool)
        -> Result<B256, ClientError>;

    async fn submit_reallocate(
        &self,
        user: Address,
        index: usize,
        params: ReallocateParams,
    ) -> Result<B256, ClientError>;

    /// Block until `tx_hash` is mined.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ClientError>;
}

/// [`LedgerClient`] bound to an in-process [`PositionLedger`] with one signer.
///
/// Submissions hold the signer lock from nonce assignment until the call is
/// mined, so transactions from this signer never overlap.
pub struct LocalLedgerClient {
    ledger: Arc<PositionLedger>,
    signer: Address,
    nonce: Mutex<u64>,
    receipts: RwLock<HashMap<B256, TxReceipt>>,
}

impl LocalLedgerClient {
    pub fn new(ledger: Arc<PositionLedger>, signer: Address) -> Self {
        Self {
            ledger,
            signer,
            nonce: Mutex::new(0),
            receipts: RwLock::new(HashMap::new()),
        }
    }

    /// Next nonce this signer will use.
    pub async fn nonce(&self) -> u64 {
        *self.nonce.lock().await
    }

    fn tx_hash(&self, nonce: u64) -> B256 {
        let mut preimage = self.signer.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        keccak256(preimage)
    }

    async fn record(
        &self,
        nonce: u64,
        result: Result<(Option<U256>, Vec<LedgerEvent>), LedgerError>,
    ) -> B256 {
        let tx_hash = self.tx_hash(nonce);
        let receipt = match result {
            Ok((output, logs)) => TxReceipt {
                tx_hash,
                nonce,
                success: true,
                output,
                revert_reason: None,
                logs,
            },
            Err(reason) => {
                warn!(%tx_hash, nonce, error = %reason, "Transaction reverted");
                TxReceipt {
                    tx_hash,
                    nonce,
                    success: false,
                    output: None,
                    revert_reason: Some(reason),
                    logs: Vec::new(),
                }
            }
        };
        self.receipts.write().await.insert(tx_hash, receipt);
        tx_hash
    }
}

#[async_trait]
impl LedgerClient for LocalLedgerClient {
    fn address(&self) -> Address {
        self.ledger.address()
    }

    fn signer(&self) -> Address {
        self.signer
    }

    async fn get_user_positions(&self, user: Address) -> Result<Vec<Position>, ClientError> {
        Ok(self.ledger.get_user_positions(user).await)
    }

    async fn users_with_active_positions(&self) -> Result<Vec<Address>, ClientError> {
        Ok(self.ledger.users_with_active_positions().await)
    }

    async fn whitelisted_vaults(&self) -> Result<Vec<VaultInfo>, ClientError> {
        Ok(self.ledger.whitelisted_vaults().await)
    }

    async fn is_router_whitelisted(&self, router: Address) -> Result<bool, ClientError> {
        Ok(self.ledger.is_router_whitelisted(router).await)
    }

    async fn preview_deposit(&self, vault: Address, assets: U256) -> Result<U256, ClientError> {
        Ok(self.ledger.preview_deposit(vault, assets).await?)
    }

    async fn submit_router_whitelist(
        &self,
        router: Address,
        allowed: bool,
    ) -> Result<B256, ClientError> {
        let mut nonce = self.nonce.lock().await;
        let result = self
            .ledger
            .set_router_whitelist_with_events(self.signer, router, allowed)
            .await
            .map(|logs| (None, logs));
        let tx_hash = self.record(*nonce, result).await;
        debug!(%tx_hash, nonce = *nonce, %router, allowed, "Submitted router whitelist");
        *nonce += 1;
        Ok(tx_hash)
    }

    async fn submit_reallocate(
        &self,
        user: Address,
        index: usize,
        params: ReallocateParams,
    ) -> Result<B256, ClientError> {
        let mut nonce = self.nonce.lock().await;
        let result = self
            .ledger
            .reallocate_with_events(self.signer, user, index, &params)
            .await
            .map(|(new_shares, logs)| (Some(new_shares), logs));
        let tx_hash = self.record(*nonce, result).await;
        debug!(%tx_hash, nonce = *nonce, %user, index, "Submitted reallocate");
        *nonce += 1;
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ClientError> {
        self.receipts
            .read()
            .await
            .get(&tx_hash)
            .cloned()
            .ok_or(ClientError::UnknownTransaction(tx_hash))
    }
}
