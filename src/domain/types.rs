//! Domain types for transaction records and the execution protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a submission attempt.
///
/// `Created -> Sent -> {Success | Failed}`, with `SendFailed` as the exit
/// for submissions rejected before a hash existed. `Success`, `Failed` and
/// `SendFailed` are terminal for the record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Row persisted, raw transaction not yet handed to the chain
    #[default]
    Created,
    /// Chain accepted the raw transaction, nonce and hash known
    Sent,
    /// Receipt confirmed with success status
    Success,
    /// Submission rejected before any hash existed
    SendFailed,
    /// Receipt confirmed with failure status
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Success => "success",
            Self::SendFailed => "send_failed",
            Self::Failed => "failed",
        }
    }

    /// Terminal failures are ignored when deciding what to do with a
    /// source id; the operation may be retried under a new record.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::SendFailed | Self::Failed)
    }
}

impl std::str::FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "sent" => Ok(Self::Sent),
            "success" => Ok(Self::Success),
            "send_failed" => Ok(Self::SendFailed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction state: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business operation category a record belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    MintAndTransferNft,
    ClaimNft,
    UpdateNft,
    BatchPayment,
    ClaimToken,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MintAndTransferNft => "mint_and_transfer_nft",
            Self::ClaimNft => "claim_nft",
            Self::UpdateNft => "update_nft",
            Self::BatchPayment => "batch_payment",
            Self::ClaimToken => "claim_token",
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mint_and_transfer_nft" => Ok(Self::MintAndTransferNft),
            "claim_nft" => Ok(Self::ClaimNft),
            "update_nft" => Ok(Self::UpdateNft),
            "batch_payment" => Ok(Self::BatchPayment),
            "claim_token" => Ok(Self::ClaimToken),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One submission attempt for a business operation. Never deleted.
///
/// For a fixed `(chain_id, tx_type, source_id)` at most one record ever
/// reaches `Success`; the idempotency lock, not the store, enforces that at
/// most one record is concurrently non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    /// Store-assigned stable identity
    pub id: i64,
    pub chain_id: u64,
    pub tx_type: TransactionType,
    /// Caller-supplied idempotency key
    pub source_id: String,
    /// Wallet address that signs the transaction
    pub trader: String,
    /// Serialized call arguments, kept for audit
    pub params: String,
    pub nonce: Option<u64>,
    pub hash: Option<String>,
    pub gas_price: Option<u64>,
    pub state: TransactionState,
    /// Serialized raw submission response
    pub detail: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a new record; the store assigns id and timestamps
/// and the state starts at `Created`.
#[derive(Debug, Clone)]
pub struct NewTransactionRecord {
    pub chain_id: u64,
    pub tx_type: TransactionType,
    pub source_id: String,
    pub trader: String,
    pub params: String,
}

/// Partial update applied to a record by id. `state` is always written;
/// optional fields are written only when present.
#[derive(Debug, Clone, Default)]
pub struct TransactionUpdate {
    pub state: TransactionState,
    pub nonce: Option<u64>,
    pub hash: Option<String>,
    pub gas_price: Option<u64>,
    pub detail: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl TransactionUpdate {
    pub fn state(state: TransactionState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn failure(
        state: TransactionState,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            state,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }
}

/// Chain-side status of a previously sent transaction.
///
/// The four-way split decides whether a sent transaction may be replaced
/// (`Canceled`), must be awaited (`Waiting`), or is already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// No receipt yet, transaction still visible as pending
    Waiting,
    /// No receipt and no longer visible: replaced or dropped
    Canceled,
    /// Receipt with success status
    Success,
    /// Receipt with failure status
    Failed,
}

/// Nonce cache entry per (chain, address). Ephemeral: eviction forces a
/// resync from the chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonceCacheEntry {
    pub nonce: u64,
    /// Milliseconds since the epoch at the last resync
    pub sync_time: i64,
}

/// Gas price and optional forced nonce handed to an operation handler.
///
/// `nonce` is `Some` only when replacing a stalled transaction; otherwise
/// the handler resolves a fresh one through the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasAllocation {
    pub gas_price: u64,
    pub nonce: Option<u64>,
}

/// Output of `OperationHandler::prepare`, persisted before sending
#[derive(Debug, Clone)]
pub struct PreparedCall {
    /// Wallet address that will sign
    pub trader: String,
    /// Call arguments, serialized for the audit trail
    pub params: serde_json::Value,
}

/// Raw submission response after the chain accepted the transaction
#[derive(Debug, Clone)]
pub struct SubmittedTransaction {
    pub nonce: u64,
    pub hash: String,
    /// Raw response body, persisted in the record's `detail` column
    pub detail: serde_json::Value,
}

/// Chain view of a transaction, as returned by `eth_getTransactionByHash`.
/// `block_number` is `None` while the transaction is still pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainTransaction {
    pub hash: String,
    pub nonce: u64,
    pub block_number: Option<u64>,
}

/// Chain receipt for a mined transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    /// Execution status: `true` on success, `false` on revert
    pub status: bool,
}

/// Human-readable failure summary handed to the notifier
#[derive(Debug, Clone)]
pub struct FailureNotice {
    pub title: String,
    pub message: String,
    /// Record snapshot with `detail` blanked, serialized for the message body
    pub record: Option<String>,
    /// Explorer link for the transaction, when a hash is known
    pub transaction_url: Option<String>,
}
