//! Shared key/value store implementation.

pub mod redis_store;

pub use redis_store::RedisStore;
