//! End-to-end orchestration of one business operation: locking, history
//! reconciliation, gas/nonce resolution, state transitions, and the
//! idempotent-retry/replace protocol.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::domain::{
    AppError, ChainClient, ChainError, ExecuteError, ExecutionError, FailureNotice, GasAllocation,
    HistoryPolicy, KeyValueStore, NewTransactionRecord, Notifier, OperationHandler,
    TransactionRecord, TransactionState, TransactionStore, TransactionType, TransactionUpdate,
    TxStatus,
};

use super::gas::GasPriceCache;
use super::keys::{TRANSACTION_LOCK_TTL, transaction_lock_key};
use super::lock::KeyedLock;
use super::nonce::NonceAllocator;

/// Executes business operations against one chain with at-most-once
/// semantics per `(chain_id, tx_type, source_id)`.
pub struct TransactionExecutor {
    chain: Arc<dyn ChainClient>,
    records: Arc<dyn TransactionStore>,
    locks: KeyedLock,
    gas: GasPriceCache,
    nonces: Arc<NonceAllocator>,
    notifier: Arc<dyn Notifier>,
    /// Block explorer base URL for failure notifications
    explorer_url: Option<String>,
}

impl TransactionExecutor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        records: Arc<dyn TransactionStore>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let locks = KeyedLock::new(Arc::clone(&store));
        let gas = GasPriceCache::new(Arc::clone(&store));
        let nonces = Arc::new(NonceAllocator::new(store));
        Self {
            chain,
            records,
            locks,
            gas,
            nonces,
            notifier,
            explorer_url: None,
        }
    }

    #[must_use]
    pub fn with_explorer_url(mut self, url: impl Into<String>) -> Self {
        self.explorer_url = Some(url.into());
        self
    }

    /// Shared allocator for wiring operation handlers
    pub fn nonce_allocator(&self) -> Arc<NonceAllocator> {
        Arc::clone(&self.nonces)
    }

    pub fn gas_cache(&self) -> &GasPriceCache {
        &self.gas
    }

    /// Execute one business operation, at most once per source id.
    pub async fn execute(
        &self,
        tx_type: TransactionType,
        source_id: &str,
        handler: &dyn OperationHandler,
    ) -> Result<TransactionRecord, ExecuteError> {
        self.execute_with_policy(tx_type, source_id, handler, None)
            .await
    }

    /// Like `execute`, with a pre-filter over the valid history records.
    /// Used by operations keyed on more than the source id, such as batch
    /// payments keyed by pay address.
    #[instrument(skip(self, handler, policy), fields(chain_id = self.chain.chain_id()))]
    pub async fn execute_with_policy(
        &self,
        tx_type: TransactionType,
        source_id: &str,
        handler: &dyn OperationHandler,
        policy: Option<&dyn HistoryPolicy>,
    ) -> Result<TransactionRecord, ExecuteError> {
        let chain_id = self.chain.chain_id();
        let lock_key = transaction_lock_key(chain_id, tx_type, source_id);

        // Acquisition failure signals a duplicate in-flight request and is
        // terminal; waiting here would defeat the duplicate detection.
        let lease = self
            .locks
            .try_acquire(&lock_key, TRANSACTION_LOCK_TTL)
            .await
            .map_err(ExecuteError::new)?
            .ok_or_else(|| {
                warn!(source_id, %tx_type, "rejected duplicate in-flight execution");
                ExecuteError::new(ExecutionError::DuplicateInFlight {
                    chain_id,
                    tx_type,
                    source_id: source_id.to_string(),
                })
            })?;

        let outcome = self
            .run_locked(chain_id, tx_type, source_id, handler, policy)
            .await;

        if let Err(e) = lease.release().await {
            warn!(error = %e, source_id, "failed to release idempotency lock");
        }

        match outcome {
            Ok(record) => Ok(record),
            Err(failure) => {
                self.report_failure(tx_type, source_id, &failure).await;
                Err(failure)
            }
        }
    }

    async fn run_locked(
        &self,
        chain_id: u64,
        tx_type: TransactionType,
        source_id: &str,
        handler: &dyn OperationHandler,
        policy: Option<&dyn HistoryPolicy>,
    ) -> Result<TransactionRecord, ExecuteError> {
        let history = self
            .records
            .find_all(chain_id, tx_type, source_id)
            .await
            .map_err(ExecuteError::new)?;

        // Terminal failures are spent attempts; they carry no decision weight.
        let mut valid: Vec<TransactionRecord> = history
            .into_iter()
            .filter(|r| !r.state.is_terminal_failure())
            .collect();

        let mut replace_target: Option<TransactionRecord> = None;

        if !valid.is_empty() {
            if let Some(policy) = policy {
                valid = policy.filter(valid).map_err(ExecuteError::new)?;
            }

            // Idempotent short-circuit: the operation already succeeded.
            if let Some(success) = valid
                .iter()
                .find(|r| r.state == TransactionState::Success)
            {
                info!(source_id, record_id = success.id, "returning existing successful record");
                return Ok(success.clone());
            }

            // A Created record never got a hash: neither confirmed sent nor
            // confirmed failed. Guessing risks a double spend.
            if valid.iter().any(|r| r.state == TransactionState::Created) {
                return Err(ExecuteError::new(ExecutionError::InconsistentHistory {
                    source_id: source_id.to_string(),
                }));
            }

            let sent: Vec<TransactionRecord> = valid
                .iter()
                .filter(|r| r.state == TransactionState::Sent)
                .cloned()
                .collect();
            if !sent.is_empty() {
                let (confirmed, target) = self.reconcile_sent(&sent).await?;
                if let Some(record) = confirmed {
                    return Ok(record);
                }
                replace_target = target;
            }
        }

        let current_gas = self
            .gas
            .get(&*self.chain)
            .await
            .map_err(ExecuteError::new)?;

        // Replacement floor: never below the network price, never below the
        // escalated price of the transaction being replaced.
        let gas_price = match &replace_target {
            Some(target) => current_gas.max(self.gas.escalate(target.gas_price.unwrap_or(0))),
            None => current_gas,
        };
        let nonce = replace_target.as_ref().and_then(|t| t.nonce);
        let allocation = GasAllocation { gas_price, nonce };

        if let Some(target) = &replace_target {
            info!(
                source_id,
                replaced_id = target.id,
                ?nonce,
                gas_price,
                "replacing stalled transaction"
            );
        }

        let prepared = handler
            .prepare(&allocation)
            .await
            .map_err(ExecuteError::new)?;

        // Persist before sending so a crash mid-send leaves an auditable row.
        let record = self
            .records
            .create(&NewTransactionRecord {
                chain_id,
                tx_type,
                source_id: source_id.to_string(),
                trader: prepared.trader.clone(),
                params: prepared.params.to_string(),
            })
            .await
            .map_err(ExecuteError::new)?;

        let submitted = match handler.send(&allocation).await {
            Ok(submitted) => submitted,
            Err(e) => {
                if e.is_nonce_expired() {
                    if let Err(inv) = self
                        .nonces
                        .invalidate(chain_id, &prepared.trader, allocation.nonce)
                        .await
                    {
                        warn!(error = %inv, "nonce invalidation after rejected send failed");
                    }
                }
                let mut update =
                    TransactionUpdate::failure(TransactionState::SendFailed, e.code(), e.to_string());
                update.gas_price = Some(gas_price);
                // Keep the forced nonce for the audit trail; a fresh
                // allocation was consumed inside the handler and is unknown.
                update.nonce = allocation.nonce;
                let record = self
                    .records
                    .update(record.id, &update)
                    .await
                    .map_err(ExecuteError::new)?;
                return Err(ExecuteError::with_record(e, record));
            }
        };

        let record = self
            .records
            .update(
                record.id,
                &TransactionUpdate {
                    state: TransactionState::Sent,
                    nonce: Some(submitted.nonce),
                    hash: Some(submitted.hash.clone()),
                    gas_price: Some(gas_price),
                    detail: Some(submitted.detail.to_string()),
                    ..TransactionUpdate::default()
                },
            )
            .await
            .map_err(ExecuteError::new)?;

        match self.chain.check_transaction(&submitted.hash).await {
            Ok(_receipt) => {
                let record = self
                    .records
                    .update(record.id, &TransactionUpdate::state(TransactionState::Success))
                    .await
                    .map_err(ExecuteError::new)?;
                info!(source_id, record_id = record.id, hash = %submitted.hash, "transaction confirmed");
                Ok(record)
            }
            Err(e) => match &e {
                AppError::Chain(ChainError::Reverted { .. }) => {
                    let record = self
                        .records
                        .update(
                            record.id,
                            &TransactionUpdate::failure(
                                TransactionState::Failed,
                                e.code(),
                                e.to_string(),
                            ),
                        )
                        .await
                        .map_err(ExecuteError::new)?;
                    Err(ExecuteError::with_record(e, record))
                }
                AppError::Chain(ChainError::ConfirmationTimeout { .. }) => {
                    // The record stays Sent: the transaction may still
                    // confirm, and a later run reconciles it. The cached
                    // nonce is dropped so the next fresh submission resyncs.
                    if let Err(inv) = self
                        .nonces
                        .invalidate(chain_id, &prepared.trader, Some(submitted.nonce))
                        .await
                    {
                        warn!(error = %inv, "nonce invalidation after confirmation timeout failed");
                    }
                    Err(ExecuteError::with_record(e, record))
                }
                _ => Err(ExecuteError::with_record(e, record)),
            },
        }
    }

    /// Query the chain status of every Sent record concurrently and apply
    /// the resulting transitions. Returns the confirmed record, if any, and
    /// otherwise the newest still-pending record as the replacement target.
    async fn reconcile_sent(
        &self,
        sent: &[TransactionRecord],
    ) -> Result<(Option<TransactionRecord>, Option<TransactionRecord>), ExecuteError> {
        let mut checks = Vec::with_capacity(sent.len());
        for record in sent {
            let Some(hash) = record.hash.clone() else {
                continue;
            };
            let chain = Arc::clone(&self.chain);
            checks.push((
                record.clone(),
                tokio::spawn(async move { chain.check_transaction_status(&hash).await }),
            ));
        }

        let mut confirmed: Option<TransactionRecord> = None;
        let mut target: Option<TransactionRecord> = None;

        for (record, check) in checks {
            let status = check
                .await
                .map_err(|e| ExecuteError::new(ChainError::Rpc(format!("status check task failed: {}", e))))?
                .map_err(ExecuteError::new)?;

            match status {
                TxStatus::Success => {
                    let updated = self
                        .records
                        .update(record.id, &TransactionUpdate::state(TransactionState::Success))
                        .await
                        .map_err(ExecuteError::new)?;
                    info!(record_id = updated.id, "sent transaction resolved as success");
                    // Only the first observed success is honored; a second
                    // one here would mean the idempotency lock was violated.
                    if confirmed.is_none() {
                        confirmed = Some(updated);
                    }
                }
                TxStatus::Failed => {
                    let e = ChainError::Reverted {
                        hash: record.hash.clone().unwrap_or_default(),
                    };
                    self.records
                        .update(
                            record.id,
                            &TransactionUpdate::failure(
                                TransactionState::Failed,
                                e.code(),
                                e.to_string(),
                            ),
                        )
                        .await
                        .map_err(ExecuteError::new)?;
                }
                TxStatus::Canceled => {
                    self.records
                        .update(
                            record.id,
                            &TransactionUpdate::failure(
                                TransactionState::SendFailed,
                                "TRANSACTION_CANCELED",
                                "",
                            ),
                        )
                        .await
                        .map_err(ExecuteError::new)?;
                    info!(record_id = record.id, "sent transaction was dropped or replaced");
                }
                TxStatus::Waiting => {
                    // Records arrive newest first; keep the first pending one.
                    if target.is_none() {
                        target = Some(record);
                    }
                }
            }
        }

        Ok((confirmed, target))
    }

    /// Log and best-effort notify; delivery failures never change the outcome.
    async fn report_failure(
        &self,
        tx_type: TransactionType,
        source_id: &str,
        failure: &ExecuteError,
    ) {
        error!(
            %tx_type,
            source_id,
            error = %failure.error,
            code = failure.error.code(),
            record = ?failure.record,
            "transaction execution failed"
        );

        let record_snapshot = failure.record.as_ref().map(|r| {
            let mut snapshot = r.clone();
            snapshot.detail = None;
            serde_json::to_string_pretty(&snapshot).unwrap_or_default()
        });
        let transaction_url = failure
            .record
            .as_ref()
            .and_then(|r| r.hash.as_deref())
            .and_then(|hash| {
                self.explorer_url
                    .as_deref()
                    .map(|base| format!("{}/tx/{}", base, hash))
            });

        let notice = FailureNotice {
            title: format!("Transaction execution failed - {}", tx_type),
            message: failure.error.to_string(),
            record: record_snapshot,
            transaction_url,
        };
        if let Err(e) = self.notifier.notify_failure(&notice).await {
            warn!(error = %e, "failure notification could not be delivered");
        }
    }
}
