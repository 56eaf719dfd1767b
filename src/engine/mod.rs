//! The transaction execution engine: distributed locks, nonce allocation,
//! gas-price policy, and the lifecycle state machine.

pub mod executor;
pub mod gas;
pub(crate) mod keys;
pub mod lock;
pub mod nonce;

pub use executor::TransactionExecutor;
pub use gas::{ESCALATION_RATE, GasPriceCache, MAX_GAS_PRICE, escalate_with_rate};
pub use lock::{KeyedLock, Lease};
pub use nonce::NonceAllocator;
