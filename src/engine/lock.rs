//! Named mutual-exclusion leases over the shared key/value store.
//!
//! Acquisition is a single `SET key token EX ttl NX`; the random owner
//! token guards release so an expired lease can never delete a key that a
//! later holder re-acquired. Waiting callers retry cooperatively with a
//! small jittered backoff; there is no fairness guarantee and no maximum
//! wait.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{AppError, KeyValueStore};

const RETRY_JITTER_MS: std::ops::Range<u64> = 5..25;

/// Lock factory bound to one key/value store
#[derive(Clone)]
pub struct KeyedLock {
    store: Arc<dyn KeyValueStore>,
}

/// An owned lease. Dropping without `release` leaves the key to expire
/// with its TTL.
pub struct Lease {
    key: String,
    token: String,
    store: Arc<dyn KeyValueStore>,
}

impl KeyedLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Single acquisition attempt; `None` when the key is held
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, AppError> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx_ex(key, &token, ttl).await? {
            return Ok(Some(Lease {
                key: key.to_string(),
                token,
                store: Arc::clone(&self.store),
            }));
        }
        Ok(None)
    }

    /// Acquire, retrying until the key frees up. Callers needing a bounded
    /// wait must impose their own timeout.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, AppError> {
        loop {
            if let Some(lease) = self.try_acquire(key, ttl).await? {
                return Ok(lease);
            }
            yield_with_jitter().await;
        }
    }

    /// True while the key is held by anyone
    pub async fn is_locked(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Wait until the key is absent, without acquiring it
    pub async fn wait_unlocked(&self, key: &str) -> Result<(), AppError> {
        while self.is_locked(key).await? {
            yield_with_jitter().await;
        }
        Ok(())
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the key only if we still own it
    pub async fn release(self) -> Result<(), AppError> {
        match self.store.get(&self.key).await? {
            Some(current) if current == self.token => self.store.del(&self.key).await,
            Some(_) => {
                warn!(key = %self.key, "lease expired and was re-acquired, skipping release");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Cooperative backoff: yield to the scheduler, then sleep a few jittered
/// milliseconds to spread contending callers over the store.
async fn yield_with_jitter() {
    tokio::task::yield_now().await;
    let jitter = rand::thread_rng().gen_range(RETRY_JITTER_MS);
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}
