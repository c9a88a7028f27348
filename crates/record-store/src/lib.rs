//! Record Store
//!
//! Append-only storage for captured inference records and the replay log:
//! a partitioned in-memory backend, a SQL backend over `sqlx::AnyPool`, and
//! the newline-delimited JSON persisted format.

pub mod memory;
pub mod ndjson;
pub mod replay_log;
pub mod sql;

#[cfg(test)]
mod tests;

pub use memory::MemoryRecordStore;
pub use ndjson::{export_range, import_records, read_records, write_record, ImportSummary};
pub use replay_log::MemoryReplayLog;
pub use sql::{SqlRecordStore, SqlReplayLog};
