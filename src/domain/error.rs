//! Error types for the engine and its infrastructure adapters.

use thiserror::Error;

use super::types::{TransactionRecord, TransactionType};

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AppError {
    /// Stable code persisted in `error_code` columns and matched on by callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "STORE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Chain(e) => e.code(),
            Self::Execution(e) => e.code(),
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// True when the chain rejected a submission for a nonce-related reason.
    /// These invalidate the cached nonce so the next allocation resyncs.
    pub fn is_nonce_expired(&self) -> bool {
        matches!(self, Self::Chain(ChainError::NonceExpired(_)))
    }
}

/// Errors from the shared key/value store (locks, nonce cache, gas cache)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("corrupt cache entry at {key}: {message}")]
    CorruptEntry { key: String, message: String },
}

/// Errors from the transaction record store
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Errors from chain RPC interaction
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc connection failed: {0}")]
    Connection(String),

    #[error("rpc call failed: {0}")]
    Rpc(String),

    #[error("malformed rpc response: {0}")]
    InvalidResponse(String),

    #[error("nonce expired: {0}")]
    NonceExpired(String),

    #[error("contract transaction error")]
    Reverted { hash: String },

    #[error("query timeout: the transaction was sent, but the on-chain status could not be confirmed")]
    ConfirmationTimeout { hash: String },

    #[error("transaction send failed: {0}")]
    SendFailed(String),
}

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) | Self::Rpc(_) | Self::InvalidResponse(_) => "RPC_ERROR",
            Self::NonceExpired(_) => "NONCE_EXPIRED",
            Self::Reverted { .. } => "CONTRACT_TRANSACTION_ERROR",
            Self::ConfirmationTimeout { .. } => "TIMEOUT",
            Self::SendFailed(_) => "SEND_FAILED",
        }
    }
}

/// Errors raised by the executor protocol itself
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The idempotency lock is held by another in-flight execution.
    /// Terminal: the caller must not retry while the first request runs.
    #[error(
        "detected that the same request is being executed (chain {chain_id}, {tx_type}, source {source_id}), do not repeat the operation"
    )]
    DuplicateInFlight {
        chain_id: u64,
        tx_type: TransactionType,
        source_id: String,
    },

    /// A record exists in `Created` with no hash: it is unknown whether the
    /// transaction ever reached the chain. Requires manual review; guessing
    /// risks a double spend.
    #[error("a previous attempt for source {source_id} is in an unknown state, manual review required")]
    InconsistentHistory { source_id: String },

    /// A history policy hook vetoed the execution.
    #[error("history policy rejected execution: {0}")]
    PolicyRejected(String),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateInFlight { .. } => "DUPLICATE_EXECUTION",
            Self::InconsistentHistory { .. } => "INCONSISTENT_HISTORY",
            Self::PolicyRejected(_) => "POLICY_REJECTED",
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// An execution failure together with the best-known record snapshot,
/// attached for operator diagnosis.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecuteError {
    #[source]
    pub error: AppError,
    pub record: Option<TransactionRecord>,
}

impl ExecuteError {
    pub fn new(error: impl Into<AppError>) -> Self {
        Self {
            error: error.into(),
            record: None,
        }
    }

    pub fn with_record(error: impl Into<AppError>, record: TransactionRecord) -> Self {
        Self {
            error: error.into(),
            record: Some(record),
        }
    }
}

impl From<AppError> for ExecuteError {
    fn from(error: AppError) -> Self {
        Self::new(error)
    }
}
