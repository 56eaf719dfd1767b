//! Infrastructure layer implementations.

pub mod chain;
pub mod database;
pub mod notify;
pub mod store;

pub use chain::{EvmChainClient, EvmClientConfig};
pub use database::{PostgresConfig, PostgresTransactionStore};
pub use notify::LarkNotifier;
pub use store::RedisStore;
