//! Failure notification delivery.

pub mod lark;

pub use lark::LarkNotifier;
