//! Key/value state store with TTL.
//!
//! Used by the saga coordinator to persist serialized transaction state and
//! to enumerate in-flight transactions by key pattern. Set-valued entries
//! back secondary indexes (cache invalidation and similar bookkeeping).

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use store::{StateStore, StateStoreExt, matches_pattern, pattern_to_like};
