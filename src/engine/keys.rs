//! Key layout and TTLs for the shared key/value store.
//!
//! Scoped keys follow `{prefix}@{chain_id}#{address}` with the address part
//! optional, e.g. `nonce@80001#0xabcd...`. Idempotency locks use their own
//! flat layout, `transaction_lock_{chain}_{type}_{source_id}`.

use std::time::Duration;

use crate::domain::TransactionType;

pub(crate) const NONCE_PREFIX: &str = "nonce";
pub(crate) const TX_LOCK_PREFIX: &str = "tx_lock";
pub(crate) const SYNC_LOCK_PREFIX: &str = "sync_lock";
pub(crate) const GAS_PRICE_PREFIX: &str = "gas_price";

/// Submission lock: serializes the nonce-read phase per (chain, address)
pub(crate) const TX_LOCK_TTL: Duration = Duration::from_secs(1);

/// Nonce-sync lock: serializes resynchronization from the chain
pub(crate) const SYNC_LOCK_TTL: Duration = Duration::from_secs(5);

/// Idempotency lock: covers a whole execution including the confirmation wait
pub(crate) const TRANSACTION_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Gas price cache TTL
pub(crate) const GAS_PRICE_TTL: Duration = Duration::from_secs(3);

pub(crate) fn scoped_key(prefix: &str, chain_id: u64, address: Option<&str>) -> String {
    match address {
        Some(address) => format!("{}@{}#{}", prefix, chain_id, address),
        None => format!("{}@{}", prefix, chain_id),
    }
}

pub(crate) fn nonce_key(chain_id: u64, address: &str) -> String {
    scoped_key(NONCE_PREFIX, chain_id, Some(address))
}

pub(crate) fn tx_lock_key(chain_id: u64, address: &str) -> String {
    scoped_key(TX_LOCK_PREFIX, chain_id, Some(address))
}

pub(crate) fn sync_lock_key(chain_id: u64, address: &str) -> String {
    scoped_key(SYNC_LOCK_PREFIX, chain_id, Some(address))
}

pub(crate) fn gas_price_key(chain_id: u64) -> String {
    scoped_key(GAS_PRICE_PREFIX, chain_id, None)
}

pub(crate) fn transaction_lock_key(
    chain_id: u64,
    tx_type: TransactionType,
    source_id: &str,
) -> String {
    format!("transaction_lock_{}_{}_{}", chain_id, tx_type, source_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_key_layout() {
        assert_eq!(nonce_key(80001, "0xabcd"), "nonce@80001#0xabcd");
        assert_eq!(tx_lock_key(1, "0xfeed"), "tx_lock@1#0xfeed");
        assert_eq!(sync_lock_key(1, "0xfeed"), "sync_lock@1#0xfeed");
        assert_eq!(gas_price_key(137), "gas_price@137");
    }

    #[test]
    fn transaction_lock_key_layout() {
        assert_eq!(
            transaction_lock_key(137, TransactionType::ClaimToken, "order-9"),
            "transaction_lock_137_claim_token_order-9"
        );
    }
}
