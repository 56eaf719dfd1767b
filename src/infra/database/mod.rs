//! Transaction record persistence.

pub mod postgres;

pub use postgres::{PostgresConfig, PostgresTransactionStore};
