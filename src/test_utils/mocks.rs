//! In-memory implementations of the domain ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::domain::{
    AppError, ChainClient, ChainTransaction, DatabaseError, FailureNotice, GasAllocation,
    NewTransactionRecord, Notifier, OperationHandler, PreparedCall, SubmittedTransaction,
    TransactionReceipt, TransactionRecord, TransactionState, TransactionStore, TransactionType,
    TransactionUpdate,
};
use crate::domain::KeyValueStore;
use crate::engine::NonceAllocator;

/// Key/value store over a `HashMap`, honoring TTLs lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.entries.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.live_value(key))
    }

    async fn del(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Scripted chain-side view of one transaction hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTxState {
    /// Known to the chain, no receipt yet
    Pending,
    /// No longer known to the chain: replaced or evicted
    Dropped,
    /// Mined with the given execution status
    Mined { status: bool },
}

#[derive(Default)]
struct ChainState {
    gas_price: u64,
    transaction_count: u64,
    transactions: HashMap<String, MockTxState>,
}

/// Scripted chain client. Waiting never blocks: `wait_for_transaction`
/// returns immediately with whatever the scripted state yields.
pub struct MockChainClient {
    chain_id: u64,
    address: String,
    state: Mutex<ChainState>,
    gas_price_calls: AtomicUsize,
    transaction_count_calls: AtomicUsize,
}

impl MockChainClient {
    pub fn new(chain_id: u64, address: &str) -> Self {
        Self {
            chain_id,
            address: address.to_string(),
            state: Mutex::new(ChainState::default()),
            gas_price_calls: AtomicUsize::new(0),
            transaction_count_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_gas_price(&self, price: u64) {
        self.state.lock().unwrap().gas_price = price;
    }

    pub fn gas_price_calls(&self) -> usize {
        self.gas_price_calls.load(Ordering::SeqCst)
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.state.lock().unwrap().transaction_count = count;
    }

    pub fn transaction_count_calls(&self) -> usize {
        self.transaction_count_calls.load(Ordering::SeqCst)
    }

    pub fn set_transaction_state(&self, hash: &str, tx_state: MockTxState) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(hash.to_string(), tx_state);
    }

    fn transaction_state(&self, hash: &str) -> Option<MockTxState> {
        self.state.lock().unwrap().transactions.get(hash).copied()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_balance(&self, _address: &str) -> Result<u128, AppError> {
        Ok(u128::from(10u64.pow(18)))
    }

    async fn get_transaction_count(&self, _address: &str) -> Result<u64, AppError> {
        self.transaction_count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().transaction_count)
    }

    async fn get_gas_price(&self) -> Result<u64, AppError> {
        self.gas_price_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, AppError> {
        Ok(match self.transaction_state(hash) {
            Some(MockTxState::Pending) => Some(ChainTransaction {
                hash: hash.to_string(),
                nonce: 0,
                block_number: None,
            }),
            Some(MockTxState::Mined { .. }) => Some(ChainTransaction {
                hash: hash.to_string(),
                nonce: 0,
                block_number: Some(1),
            }),
            Some(MockTxState::Dropped) | None => None,
        })
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        Ok(match self.transaction_state(hash) {
            Some(MockTxState::Mined { status }) => Some(TransactionReceipt {
                transaction_hash: hash.to_string(),
                block_number: 1,
                status,
            }),
            _ => None,
        })
    }

    async fn wait_for_transaction(
        &self,
        hash: &str,
        _confirmations: u64,
        _timeout: Duration,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        self.get_transaction_receipt(hash).await
    }
}

/// Transaction store over a `Vec`, with `find_all` ordered like the real
/// store: `updated_at` descending, id descending as the tiebreak.
#[derive(Default)]
pub struct MockTransactionStore {
    records: Mutex<Vec<TransactionRecord>>,
    next_id: AtomicI64,
}

impl MockTransactionStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Seed a pre-existing record, e.g. a Sent row left by an earlier run
    pub fn insert(&self, record: TransactionRecord) {
        let floor = record.id + 1;
        self.next_id.fetch_max(floor, Ordering::SeqCst);
        self.records.lock().unwrap().push(record);
    }

    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn record(&self, id: i64) -> Option<TransactionRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl TransactionStore for MockTransactionStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn find_all(
        &self,
        chain_id: u64,
        tx_type: TransactionType,
        source_id: &str,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        let mut matched: Vec<TransactionRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.chain_id == chain_id && r.tx_type == tx_type && r.source_id == source_id
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(matched)
    }

    async fn create(&self, new: &NewTransactionRecord) -> Result<TransactionRecord, AppError> {
        let now = Utc::now();
        let record = TransactionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            chain_id: new.chain_id,
            tx_type: new.tx_type,
            source_id: new.source_id.clone(),
            trader: new.trader.clone(),
            params: new.params.clone(),
            nonce: None,
            hash: None,
            gas_price: None,
            state: TransactionState::Created,
            detail: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        id: i64,
        update: &TransactionUpdate,
    ) -> Result<TransactionRecord, AppError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DatabaseError::NotFound(format!("transaction record {}", id)))?;

        record.state = update.state;
        if update.nonce.is_some() {
            record.nonce = update.nonce;
        }
        if update.hash.is_some() {
            record.hash = update.hash.clone();
        }
        if update.gas_price.is_some() {
            record.gas_price = update.gas_price;
        }
        if update.detail.is_some() {
            record.detail = update.detail.clone();
        }
        if update.error_code.is_some() {
            record.error_code = update.error_code.clone();
        }
        if update.error_message.is_some() {
            record.error_message = update.error_message.clone();
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

/// Operation handler that submits through the real nonce allocator, so
/// executor tests exercise the forced-versus-fresh nonce paths.
pub struct MockOperationHandler {
    trader: String,
    chain: Arc<MockChainClient>,
    nonces: Arc<NonceAllocator>,
    hash: Mutex<String>,
    send_failure: Mutex<Option<AppError>>,
    sent: Mutex<Vec<GasAllocation>>,
    prepare_calls: AtomicUsize,
}

impl MockOperationHandler {
    pub fn new(trader: &str, chain: Arc<MockChainClient>, nonces: Arc<NonceAllocator>) -> Self {
        Self {
            trader: trader.to_string(),
            chain,
            nonces,
            hash: Mutex::new("0xhash1".to_string()),
            send_failure: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            prepare_calls: AtomicUsize::new(0),
        }
    }

    /// Hash returned by the next accepted send
    pub fn set_hash(&self, hash: &str) {
        *self.hash.lock().unwrap() = hash.to_string();
    }

    /// Reject the next send with the given error, consuming it
    pub fn fail_next_send(&self, error: impl Into<AppError>) {
        *self.send_failure.lock().unwrap() = Some(error.into());
    }

    /// Allocations observed by `send`, in call order
    pub fn sent_allocations(&self) -> Vec<GasAllocation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl OperationHandler for MockOperationHandler {
    async fn prepare(&self, _allocation: &GasAllocation) -> Result<PreparedCall, AppError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PreparedCall {
            trader: self.trader.clone(),
            params: json!({ "to": "0xrecipient", "amount": "1000" }),
        })
    }

    async fn send(&self, allocation: &GasAllocation) -> Result<SubmittedTransaction, AppError> {
        self.sent.lock().unwrap().push(*allocation);
        if let Some(error) = self.send_failure.lock().unwrap().take() {
            return Err(error);
        }
        let nonce = self
            .nonces
            .resolve_for_submission(&*self.chain, allocation.nonce)
            .await?;
        let hash = self.hash.lock().unwrap().clone();
        Ok(SubmittedTransaction {
            nonce,
            hash: hash.clone(),
            detail: json!({ "transactionHash": hash, "nonce": nonce }),
        })
    }
}

/// Captures failure notices instead of delivering them
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<(), AppError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}
