//! Shared test doubles. Compiled for unit tests and, behind the
//! `test-utils` feature, for integration tests.

pub mod mocks;

pub use mocks::{
    MemoryStore, MockChainClient, MockOperationHandler, MockTransactionStore, MockTxState,
    RecordingNotifier,
};
