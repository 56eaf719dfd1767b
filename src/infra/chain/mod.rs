//! Chain RPC client implementations.

pub mod evm;

pub use evm::{EvmChainClient, EvmClientConfig};
