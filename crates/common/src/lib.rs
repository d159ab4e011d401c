//! Shared types used across the saga coordination crates.

pub mod types;

pub use types::TransactionId;
