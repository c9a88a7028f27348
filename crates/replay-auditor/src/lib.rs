//! Reproducibility Auditor
//!
//! Post-hoc comparison of replayed decisions against the live captures that
//! share their `request_id`, plus run-level coverage reports. Everything
//! here is read-side; nothing touches the resolution hot path.

pub mod auditor;
pub mod join;
pub mod report;

pub use auditor::{AuditOutcome, ReproducibilityAuditor};
pub use join::{compare, join_logs};
pub use report::{summarize, ProvenanceCounts, ReplaySummary};
