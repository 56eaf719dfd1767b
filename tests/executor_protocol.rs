//! End-to-end tests for the transaction execution protocol.
//!
//! Drives a `TransactionExecutor` wired to in-memory mocks through the
//! retry/replace decision tree: idempotent short-circuits, duplicate
//! rejection, stalled-transaction replacement, send rejection, and
//! confirmation timeout.

use std::sync::Arc;

use chrono::{Duration, Utc};

use evm_transaction_engine::domain::{
    AppError, ChainError, ExecutionError, GasAllocation, HistoryPolicy, KeyValueStore,
    TransactionRecord, TransactionState, TransactionType,
};
use evm_transaction_engine::engine::{MAX_GAS_PRICE, TransactionExecutor};
use evm_transaction_engine::test_utils::{
    MemoryStore, MockChainClient, MockOperationHandler, MockTransactionStore, MockTxState,
    RecordingNotifier,
};

const GWEI: u64 = 1_000_000_000;
const SOURCE: &str = "order-1";

struct Harness {
    executor: TransactionExecutor,
    chain: Arc<MockChainClient>,
    records: Arc<MockTransactionStore>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    handler: MockOperationHandler,
}

fn harness() -> Harness {
    let chain = Arc::new(MockChainClient::new(137, "0xwallet"));
    chain.set_gas_price(30 * GWEI);
    chain.set_transaction_count(7);

    let records = Arc::new(MockTransactionStore::new());
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let executor = TransactionExecutor::new(
        Arc::clone(&chain) as _,
        Arc::clone(&records) as _,
        Arc::clone(&store) as _,
        Arc::clone(&notifier) as _,
    )
    .with_explorer_url("https://polygonscan.com");

    let handler =
        MockOperationHandler::new("0xwallet", Arc::clone(&chain), executor.nonce_allocator());

    Harness {
        executor,
        chain,
        records,
        store,
        notifier,
        handler,
    }
}

/// A record left behind by an earlier run, aged by `age_secs`
fn seeded_record(
    id: i64,
    state: TransactionState,
    nonce: Option<u64>,
    hash: Option<&str>,
    gas_price: Option<u64>,
    age_secs: i64,
) -> TransactionRecord {
    let at = Utc::now() - Duration::seconds(age_secs);
    TransactionRecord {
        id,
        chain_id: 137,
        tx_type: TransactionType::ClaimToken,
        source_id: SOURCE.to_string(),
        trader: "0xwallet".to_string(),
        params: "{}".to_string(),
        nonce,
        hash: hash.map(str::to_string),
        gas_price,
        state,
        detail: None,
        error_code: None,
        error_message: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn first_execution_submits_and_confirms() {
    let h = harness();
    h.chain
        .set_transaction_state("0xhash1", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(record.nonce, Some(7));
    assert_eq!(record.hash.as_deref(), Some("0xhash1"));
    assert_eq!(record.gas_price, Some(30 * GWEI));

    // Fresh submission: no forced nonce, network gas price as-is
    assert_eq!(
        h.handler.sent_allocations(),
        vec![GasAllocation {
            gas_price: 30 * GWEI,
            nonce: None,
        }]
    );
    assert_eq!(h.records.records().len(), 1);
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test]
async fn existing_success_short_circuits() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Success,
        Some(5),
        Some("0xdone"),
        Some(20 * GWEI),
        600,
    ));

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.id, 1);
    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(h.handler.prepare_calls(), 0);
    assert_eq!(h.handler.send_calls(), 0);
}

#[tokio::test]
async fn duplicate_in_flight_is_rejected_without_waiting() {
    let h = harness();
    // Another process holds the idempotency lock
    h.store
        .set("transaction_lock_137_claim_token_order-1", "someone-else")
        .await
        .unwrap();

    let failure = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "DUPLICATE_EXECUTION");
    assert!(failure.record.is_none());
    assert_eq!(h.handler.send_calls(), 0);
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn created_record_requires_manual_review() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Created,
        None,
        None,
        None,
        60,
    ));

    let failure = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "INCONSISTENT_HISTORY");
    assert_eq!(h.handler.send_calls(), 0);
}

#[tokio::test]
async fn sent_record_confirmed_on_chain_is_reconciled() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xmine"),
        Some(20 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xmine", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.id, 1);
    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(h.handler.send_calls(), 0);
    assert_eq!(
        h.records.record(1).unwrap().state,
        TransactionState::Success
    );
}

#[tokio::test]
async fn dropped_sent_record_is_closed_and_retried_fresh() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xold"),
        Some(20 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xold", MockTxState::Dropped);
    h.handler.set_hash("0xnew");
    h.chain
        .set_transaction_state("0xnew", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(record.hash.as_deref(), Some("0xnew"));

    // The dropped transaction may not be re-targeted: its record is closed
    // and the retry uses a freshly allocated nonce.
    let old = h.records.record(1).unwrap();
    assert_eq!(old.state, TransactionState::SendFailed);
    assert_eq!(old.error_code.as_deref(), Some("TRANSACTION_CANCELED"));
    assert_eq!(
        h.handler.sent_allocations(),
        vec![GasAllocation {
            gas_price: 30 * GWEI,
            nonce: None,
        }]
    );
}

#[tokio::test]
async fn pending_sent_record_is_replaced_with_escalated_gas() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xstuck"),
        Some(40 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xstuck", MockTxState::Pending);
    h.handler.set_hash("0xreplace");
    h.chain
        .set_transaction_state("0xreplace", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(record.nonce, Some(5));
    // 40 gwei escalated by 20% beats the 30 gwei network price
    assert_eq!(
        h.handler.sent_allocations(),
        vec![GasAllocation {
            gas_price: 48 * GWEI,
            nonce: Some(5),
        }]
    );
    // The replaced record stays Sent; the chain resolves which one lands
    assert_eq!(h.records.record(1).unwrap().state, TransactionState::Sent);
}

#[tokio::test]
async fn replacement_gas_is_capped() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xstuck"),
        Some(45 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xstuck", MockTxState::Pending);
    h.handler.set_hash("0xreplace");
    h.chain
        .set_transaction_state("0xreplace", MockTxState::Mined { status: true });

    h.executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(h.handler.sent_allocations()[0].gas_price, MAX_GAS_PRICE);
}

#[tokio::test]
async fn replacement_gas_never_drops_below_network_price() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xstuck"),
        Some(10 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xstuck", MockTxState::Pending);
    h.handler.set_hash("0xreplace");
    h.chain
        .set_transaction_state("0xreplace", MockTxState::Mined { status: true });

    h.executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    // 10 gwei escalated is 12 gwei; the 30 gwei network price wins
    assert_eq!(
        h.handler.sent_allocations(),
        vec![GasAllocation {
            gas_price: 30 * GWEI,
            nonce: Some(5),
        }]
    );
}

#[tokio::test]
async fn reverted_sent_record_is_marked_failed_before_retry() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xrev"),
        Some(20 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xrev", MockTxState::Mined { status: false });
    h.handler.set_hash("0xnew");
    h.chain
        .set_transaction_state("0xnew", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.state, TransactionState::Success);
    let old = h.records.record(1).unwrap();
    assert_eq!(old.state, TransactionState::Failed);
    assert_eq!(
        old.error_code.as_deref(),
        Some("CONTRACT_TRANSACTION_ERROR")
    );
}

#[tokio::test]
async fn nonce_rejection_invalidates_cache_and_marks_send_failed() {
    let h = harness();
    // Simulate a stale cached nonce from an earlier run
    h.store
        .set("nonce@137#0xwallet", r#"{"nonce":9,"sync_time":0}"#)
        .await
        .unwrap();
    h.handler
        .fail_next_send(ChainError::NonceExpired("nonce too low".into()));

    let failure = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "NONCE_EXPIRED");
    let record = failure.record.unwrap();
    assert_eq!(record.state, TransactionState::SendFailed);
    assert_eq!(record.error_code.as_deref(), Some("NONCE_EXPIRED"));
    assert_eq!(record.gas_price, Some(30 * GWEI));
    // A freshly allocated nonce was consumed inside the handler; the
    // record cannot attribute one
    assert_eq!(record.nonce, None);

    // The next allocation must resync from the chain
    assert!(h.store.get("nonce@137#0xwallet").await.unwrap().is_none());
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn send_failure_preserves_forced_nonce() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xstuck"),
        Some(40 * GWEI),
        60,
    ));
    h.chain
        .set_transaction_state("0xstuck", MockTxState::Pending);
    h.handler
        .fail_next_send(ChainError::SendFailed("replacement underpriced".into()));

    let failure = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "SEND_FAILED");
    let record = failure.record.unwrap();
    assert_eq!(record.state, TransactionState::SendFailed);
    assert_eq!(record.nonce, Some(5));
    assert_eq!(record.gas_price, Some(48 * GWEI));
}

#[tokio::test]
async fn confirmation_timeout_leaves_record_sent() {
    let h = harness();
    // The submitted hash never appears on the chain within the wait
    h.handler.set_hash("0xslow");

    let failure = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "TIMEOUT");
    let record = failure.record.unwrap();
    assert_eq!(record.state, TransactionState::Sent);
    assert_eq!(record.hash.as_deref(), Some("0xslow"));
    assert_eq!(
        h.records.record(record.id).unwrap().state,
        TransactionState::Sent
    );

    // The cached nonce was consumed by a transaction of unknown fate
    assert!(h.store.get("nonce@137#0xwallet").await.unwrap().is_none());

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "Transaction execution failed - claim_token");
    assert_eq!(
        notices[0].transaction_url.as_deref(),
        Some("https://polygonscan.com/tx/0xslow")
    );
}

#[tokio::test]
async fn timed_out_transaction_is_recovered_by_the_next_run() {
    let h = harness();
    h.handler.set_hash("0xslow");

    h.executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap_err();

    // The transaction confirms after the first run gave up
    h.chain
        .set_transaction_state("0xslow", MockTxState::Mined { status: true });

    let record = h
        .executor
        .execute(TransactionType::ClaimToken, SOURCE, &h.handler)
        .await
        .unwrap();

    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(record.hash.as_deref(), Some("0xslow"));
    // Reconciled, not resubmitted
    assert_eq!(h.handler.send_calls(), 1);
}

struct RejectingPolicy;

impl HistoryPolicy for RejectingPolicy {
    fn filter(
        &self,
        _records: Vec<TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        Err(ExecutionError::PolicyRejected("pay address changed".into()).into())
    }
}

struct DiscardingPolicy;

impl HistoryPolicy for DiscardingPolicy {
    fn filter(
        &self,
        _records: Vec<TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn history_policy_can_veto_execution() {
    let h = harness();
    let mut record = seeded_record(
        1,
        TransactionState::Sent,
        Some(5),
        Some("0xold"),
        Some(20 * GWEI),
        60,
    );
    record.tx_type = TransactionType::BatchPayment;
    h.records.insert(record);

    let failure = h
        .executor
        .execute_with_policy(
            TransactionType::BatchPayment,
            SOURCE,
            &h.handler,
            Some(&RejectingPolicy),
        )
        .await
        .unwrap_err();

    // Veto applies before any chain access or submission
    assert_eq!(failure.error.code(), "POLICY_REJECTED");
    assert_eq!(h.handler.send_calls(), 0);
}

#[tokio::test]
async fn history_policy_can_discard_superseded_records() {
    let h = harness();
    h.records.insert(seeded_record(
        1,
        TransactionState::Success,
        Some(5),
        Some("0xdone"),
        Some(20 * GWEI),
        600,
    ));
    h.chain
        .set_transaction_state("0xhash1", MockTxState::Mined { status: true });

    // With the old success filtered out, the operation runs fresh
    let record = h
        .executor
        .execute_with_policy(
            TransactionType::ClaimToken,
            SOURCE,
            &h.handler,
            Some(&DiscardingPolicy),
        )
        .await
        .unwrap();

    assert_ne!(record.id, 1);
    assert_eq!(record.state, TransactionState::Success);
    assert_eq!(h.handler.send_calls(), 1);
}
