use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    CaptureAuditEvent, DecisionContext, DecisionPayload, Fingerprint, IndexKey, InferenceRecord,
    LoggedReplay, PartitionKey, PutOutcome, ReplayLogEntry, ReplayResult,
};

/// Durable append-only store of inference records.
///
/// Lookups report genuine absence as `Ok(None)`; an unreachable backend is
/// always `Err(ReplayError::StorageUnavailable)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append a record. Re-putting an identical record under the same
    /// `request_id` is a no-op; a differing payload is a `DuplicateKey`.
    async fn put(&self, record: InferenceRecord) -> ReplayResult<PutOutcome>;

    async fn get_by_request_id(&self, request_id: &str) -> ReplayResult<Option<InferenceRecord>>;

    /// Most recent record (by timestamp, then insertion order) sharing the
    /// fingerprint within the partition.
    async fn get_by_fingerprint(
        &self,
        input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
    ) -> ReplayResult<Option<InferenceRecord>>;

    /// Temporally closest usable (`ok`) record in the partition, ties broken
    /// by most recently inserted. Fingerprint equality is not required.
    async fn find_nearest(
        &self,
        input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
        timestamp: i64,
    ) -> ReplayResult<Option<InferenceRecord>>;

    /// Records with `from_ts <= timestamp <= to_ts`, ascending. Each call
    /// starts a fresh, finite pass.
    fn range_query<'a>(
        &'a self,
        pair: &'a str,
        timeframe: &'a str,
        from_ts: i64,
        to_ts: i64,
    ) -> BoxStream<'a, ReplayResult<InferenceRecord>>;

    async fn partitions(&self) -> ReplayResult<Vec<PartitionKey>>;

    /// Capture audit trail of a partition in sequence order.
    async fn capture_trail(&self, partition: &PartitionKey) -> ReplayResult<Vec<CaptureAuditEvent>>;

    fn backend_name(&self) -> &'static str;
}

/// Low-latency, eventually-consistent cache in front of a `RecordStore`.
/// Never the system of record.
#[async_trait]
pub trait LookupIndex: Send + Sync {
    async fn get(&self, key: &IndexKey) -> ReplayResult<Option<InferenceRecord>>;

    async fn put(&self, key: IndexKey, record: InferenceRecord) -> ReplayResult<()>;

    async fn invalidate(&self, key: &IndexKey) -> ReplayResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Gap-filling model consulted only when no recorded decision applies.
#[async_trait]
pub trait SurrogatePredictor: Send + Sync {
    /// Must be deterministic for a fixed model snapshot.
    async fn predict(&self, context: &DecisionContext) -> ReplayResult<DecisionPayload>;

    /// Identifies the model snapshot; recorded with every surrogate decision.
    fn model_version(&self) -> String;
}

/// Append-only log of completed resolutions, chained per run.
#[async_trait]
pub trait ReplayLog: Send + Sync {
    /// Identical re-append of `(run_id, request_id)` is a no-op; a differing
    /// resolution is a `DuplicateKey`.
    async fn append(&self, entry: ReplayLogEntry) -> ReplayResult<PutOutcome>;

    /// Entries of a run in sequence order.
    async fn run_entries(&self, run_id: &str) -> ReplayResult<Vec<LoggedReplay>>;

    async fn entry_for_request(
        &self,
        run_id: &str,
        request_id: &str,
    ) -> ReplayResult<Option<LoggedReplay>>;

    async fn runs(&self) -> ReplayResult<Vec<String>>;
}
