//! Lookup Index
//!
//! Fast `(input_hash, pair, timeframe)` cache in front of a record store.
//! Entries expire after a mode-dependent TTL: short while trading live,
//! long during backtests where the underlying store is immutable.

mod config;
mod memory;
mod redis_index;

pub use config::{IndexConfig, IndexMode};
pub use memory::MemoryIndex;
pub use redis_index::RedisIndex;
