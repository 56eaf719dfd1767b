//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    AppError, ChainError, ConfigError, DatabaseError, ExecuteError, ExecutionError, StoreError,
};
pub use traits::{
    CONFIRMATION_TIMEOUT, ChainClient, HistoryPolicy, KeyValueStore, Notifier, OperationHandler,
    TransactionStore,
};
pub use types::{
    ChainTransaction, FailureNotice, GasAllocation, NewTransactionRecord, NonceCacheEntry,
    PreparedCall, SubmittedTransaction, TransactionReceipt, TransactionRecord, TransactionState,
    TransactionType, TransactionUpdate, TxStatus,
};
