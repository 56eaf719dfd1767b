//! At-most-once transaction execution engine for server-held EVM wallets.
//!
//! Business services hand the [`engine::TransactionExecutor`] a chain,
//! an operation type, a source id (the idempotency key) and an
//! [`domain::OperationHandler`] that builds and submits the actual
//! contract call. The engine guarantees the operation executes at most
//! once across concurrent requests and process restarts, coordinating
//! solely through a shared key/value store and the chain RPC endpoint,
//! and replaces stuck transactions with higher gas instead of
//! duplicating them.

pub mod config;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
