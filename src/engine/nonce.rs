//! Per-(chain, address) nonce allocation backed by the shared cache.
//!
//! The cache entry holds the last allocated nonce. Allocation is a plain
//! read-increment-write: it is correct only because every submission path
//! holds the per-address submission lock across the whole nonce-read phase
//! (`resolve_for_submission`). That invariant is documented here, not
//! enforced by the data structure.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::domain::{AppError, ChainClient, KeyValueStore, NonceCacheEntry, StoreError};

use super::keys::{SYNC_LOCK_TTL, TX_LOCK_TTL, nonce_key, sync_lock_key, tx_lock_key};
use super::lock::KeyedLock;

#[derive(Clone)]
pub struct NonceAllocator {
    store: Arc<dyn KeyValueStore>,
    locks: KeyedLock,
}

impl NonceAllocator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let locks = KeyedLock::new(Arc::clone(&store));
        Self { store, locks }
    }

    /// Overwrite the cache with the authoritative on-chain transaction
    /// count, under the nonce-sync lock. Baseline when no cache exists.
    #[instrument(skip(self, chain), fields(chain_id = chain.chain_id()))]
    pub async fn sync_nonce(&self, chain: &dyn ChainClient, address: &str) -> Result<u64, AppError> {
        let lease = self
            .locks
            .acquire(&sync_lock_key(chain.chain_id(), address), SYNC_LOCK_TTL)
            .await?;

        let nonce = chain.get_transaction_count(address).await?;
        let entry = NonceCacheEntry {
            nonce,
            sync_time: Utc::now().timestamp_millis(),
        };
        self.store
            .set(&nonce_key(chain.chain_id(), address), &encode(&entry)?)
            .await?;

        lease.release().await?;
        info!(address, nonce, "nonce resynchronized from chain");
        Ok(nonce)
    }

    /// Increment and return the next nonce, resyncing when no cache entry
    /// exists. Waits for any in-progress sync to finish first (polls the
    /// sync-lock key; does not acquire it).
    pub async fn allocate_next(
        &self,
        chain: &dyn ChainClient,
        address: &str,
    ) -> Result<u64, AppError> {
        self.locks
            .wait_unlocked(&sync_lock_key(chain.chain_id(), address))
            .await?;

        let key = nonce_key(chain.chain_id(), address);
        match self.store.get(&key).await? {
            Some(raw) => {
                let mut entry = decode(&key, &raw)?;
                entry.nonce += 1;
                self.store.set(&key, &encode(&entry)?).await?;
                debug!(address, nonce = entry.nonce, "allocated nonce from cache");
                Ok(entry.nonce)
            }
            None => self.sync_nonce(chain, address).await,
        }
    }

    /// Resolve the nonce for one submission under the submission lock.
    ///
    /// The lock is held across the whole read phase so two concurrent
    /// submissions never observe the same value; it is released before the
    /// actual send, which the chain orders by nonce.
    pub async fn resolve_for_submission(
        &self,
        chain: &dyn ChainClient,
        forced: Option<u64>,
    ) -> Result<u64, AppError> {
        let address = chain.address().to_string();
        let lease = self
            .locks
            .acquire(&tx_lock_key(chain.chain_id(), &address), TX_LOCK_TTL)
            .await?;

        let result = match forced {
            Some(nonce) => Ok(nonce),
            None => self.allocate_next(chain, &address).await,
        };

        lease.release().await?;
        result
    }

    /// Drop the cache entry so the next allocation resyncs from the chain.
    ///
    /// When the rejected nonce is known, the deletion is skipped if the
    /// cached value has since moved on to a newer allocation.
    #[instrument(skip(self))]
    pub async fn invalidate(
        &self,
        chain_id: u64,
        address: &str,
        nonce: Option<u64>,
    ) -> Result<(), AppError> {
        let key = nonce_key(chain_id, address);
        if let Some(nonce) = nonce {
            if let Some(raw) = self.store.get(&key).await? {
                let entry = decode(&key, &raw)?;
                if entry.nonce != nonce {
                    debug!(address, cached = entry.nonce, stale = nonce, "skipping nonce invalidation");
                    return Ok(());
                }
            }
        }
        info!(chain_id, address, "invalidating nonce cache");
        self.store.del(&key).await
    }
}

fn encode(entry: &NonceCacheEntry) -> Result<String, AppError> {
    serde_json::to_string(entry).map_err(|e| {
        StoreError::Command(format!("failed to encode nonce entry: {}", e)).into()
    })
}

fn decode(key: &str, raw: &str) -> Result<NonceCacheEntry, AppError> {
    serde_json::from_str(raw).map_err(|e| {
        StoreError::CorruptEntry {
            key: key.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStore, MockChainClient};

    fn setup() -> (NonceAllocator, Arc<MemoryStore>, MockChainClient) {
        let store = Arc::new(MemoryStore::new());
        let allocator = NonceAllocator::new(Arc::clone(&store) as _);
        let chain = MockChainClient::new(80001, "0xabcd");
        (allocator, store, chain)
    }

    #[tokio::test]
    async fn sync_returns_chain_count_and_seeds_cache() {
        let (allocator, store, chain) = setup();
        chain.set_transaction_count(7);

        assert_eq!(allocator.sync_nonce(&chain, "0xabcd").await.unwrap(), 7);

        let raw = store.get("nonce@80001#0xabcd").await.unwrap().unwrap();
        let entry: NonceCacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.nonce, 7);
    }

    #[tokio::test]
    async fn allocate_increments_from_cache() {
        let (allocator, _, chain) = setup();
        chain.set_transaction_count(7);

        assert_eq!(allocator.sync_nonce(&chain, "0xabcd").await.unwrap(), 7);
        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 8);
        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 9);
        // Chain only queried by the initial sync
        assert_eq!(chain.transaction_count_calls(), 1);
    }

    #[tokio::test]
    async fn allocate_resyncs_when_cache_missing() {
        let (allocator, _, chain) = setup();
        chain.set_transaction_count(3);

        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 3);
        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn invalidate_forces_resync() {
        let (allocator, _, chain) = setup();
        chain.set_transaction_count(3);

        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 3);
        allocator.invalidate(80001, "0xabcd", None).await.unwrap();

        chain.set_transaction_count(10);
        assert_eq!(allocator.allocate_next(&chain, "0xabcd").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn invalidate_skips_newer_allocation() {
        let (allocator, store, chain) = setup();
        chain.set_transaction_count(3);

        allocator.sync_nonce(&chain, "0xabcd").await.unwrap();
        allocator.allocate_next(&chain, "0xabcd").await.unwrap(); // cache now 4

        // An invalidation for the superseded nonce 3 must not clear 4
        allocator.invalidate(80001, "0xabcd", Some(3)).await.unwrap();
        assert!(store.get("nonce@80001#0xabcd").await.unwrap().is_some());

        allocator.invalidate(80001, "0xabcd", Some(4)).await.unwrap();
        assert!(store.get("nonce@80001#0xabcd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_distinct_consecutive_nonces() {
        let (allocator, _, chain) = setup();
        chain.set_transaction_count(100);
        allocator.sync_nonce(&chain, "0xabcd").await.unwrap();

        let chain = Arc::new(chain);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                allocator.resolve_for_submission(&*chain, None).await
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (101..=108).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn forced_nonce_bypasses_allocation() {
        let (allocator, store, chain) = setup();
        chain.set_transaction_count(5);
        allocator.sync_nonce(&chain, "0xabcd").await.unwrap();

        let nonce = allocator
            .resolve_for_submission(&chain, Some(42))
            .await
            .unwrap();
        assert_eq!(nonce, 42);

        // Cache untouched by the forced path
        let raw = store.get("nonce@80001#0xabcd").await.unwrap().unwrap();
        let entry: NonceCacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.nonce, 5);
    }
}
