//! Domain traits defining contracts for external systems.

use std::time::Duration;

use async_trait::async_trait;

use super::error::{AppError, ChainError};
use super::types::{
    ChainTransaction, FailureNotice, GasAllocation, NewTransactionRecord, PreparedCall,
    SubmittedTransaction, TransactionReceipt, TransactionRecord, TransactionType,
    TransactionUpdate, TxStatus,
};

/// How long `ChainClient::check_transaction` waits for a confirmation
/// before failing with a distinct timeout error. The underlying
/// transaction stays outstanding; it can only be replaced, not canceled.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Key/value store with TTL used for locks and short-lived caches.
///
/// The engine relies on exactly one atomic primitive: set-if-absent with
/// expiry. Everything else is plain get/set/del.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `SET key value EX ttl NX`; returns `false` when the key already exists
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Unconditional set without expiry (nonce cache entries)
    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// Unconditional set with expiry (gas price cache)
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn del(&self, key: &str) -> Result<(), AppError>;
}

/// Persistence for transaction records
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// All records for `(chain_id, tx_type, source_id)`, newest first
    /// (ordered by `updated_at` descending)
    async fn find_all(
        &self,
        chain_id: u64,
        tx_type: TransactionType,
        source_id: &str,
    ) -> Result<Vec<TransactionRecord>, AppError>;

    /// Insert a new record in state `Created`
    async fn create(&self, new: &NewTransactionRecord) -> Result<TransactionRecord, AppError>;

    /// Apply a partial update by id and return the updated record
    async fn update(
        &self,
        id: i64,
        update: &TransactionUpdate,
    ) -> Result<TransactionRecord, AppError>;
}

/// Thin capability over one chain RPC endpoint.
///
/// Contract-call construction, ABI encoding and signing live in operation
/// handlers; the engine only reads chain state and classifies outcomes.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Address of the wallet this client submits for
    fn address(&self) -> &str;

    /// Check RPC connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Native token balance in wei
    async fn get_balance(&self, address: &str) -> Result<u128, AppError>;

    /// Authoritative on-chain transaction count, i.e. the next usable nonce
    async fn get_transaction_count(&self, address: &str) -> Result<u64, AppError>;

    /// Current network gas price in wei
    async fn get_gas_price(&self) -> Result<u64, AppError>;

    /// Transaction by hash; `None` when the chain no longer knows it
    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, AppError>;

    /// Receipt by hash; `None` while unmined
    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError>;

    /// Poll for a receipt with at least `confirmations` confirmations,
    /// returning `None` once `timeout` elapses
    async fn wait_for_transaction(
        &self,
        hash: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>, AppError>;

    /// Classify a previously sent transaction.
    ///
    /// A binary mined/unmined check is not enough: only `Canceled` means
    /// the transaction may be safely replaced.
    async fn check_transaction_status(&self, hash: &str) -> Result<TxStatus, AppError> {
        if let Some(receipt) = self.get_transaction_receipt(hash).await? {
            if receipt.status {
                return Ok(TxStatus::Success);
            }
            return Ok(TxStatus::Failed);
        }
        match self.get_transaction(hash).await? {
            Some(_) => Ok(TxStatus::Waiting),
            None => Ok(TxStatus::Canceled),
        }
    }

    /// Wait for a confirmation and fail with a typed error on revert or
    /// timeout. The record stays `Sent` on timeout; it may confirm later.
    async fn check_transaction(&self, hash: &str) -> Result<TransactionReceipt, AppError> {
        let receipt = self
            .wait_for_transaction(hash, 1, CONFIRMATION_TIMEOUT)
            .await?
            .ok_or_else(|| ChainError::ConfirmationTimeout {
                hash: hash.to_string(),
            })?;
        if !receipt.status {
            return Err(ChainError::Reverted {
                hash: hash.to_string(),
            }
            .into());
        }
        Ok(receipt)
    }
}

/// Per-operation submission logic injected by the business layer.
///
/// The executor calls `prepare` once to obtain the auditable call shape,
/// persists a `Created` record, then calls `send` once. Handlers resolve a
/// fresh nonce through the allocator when `allocation.nonce` is `None` and
/// must reuse the forced nonce otherwise.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn prepare(&self, allocation: &GasAllocation) -> Result<PreparedCall, AppError>;

    async fn send(&self, allocation: &GasAllocation) -> Result<SubmittedTransaction, AppError>;
}

/// Optional pre-filter over the valid history records, applied before the
/// executor decides between short-circuit, replacement and fresh submit.
///
/// Batch payments use this to veto a pay-address change mid-operation.
pub trait HistoryPolicy: Send + Sync {
    fn filter(
        &self,
        records: Vec<TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>, AppError>;
}

/// Best-effort failure reporting. Never blocks an execution outcome;
/// delivery errors are logged and swallowed by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<(), AppError>;
}
