//! Partitioned in-memory record store.
//!
//! Each `(pair, timeframe)` partition sits behind its own lock, so captures
//! and lookups on unrelated partitions never serialize against each other.
//! Within a partition a monotonic insertion sequence gives "most recent"
//! a total order even when wall-clock timestamps collide.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};

use replay_core::{
    CaptureAuditEvent, ChainLink, Chained, Fingerprint, InferenceRecord, PartitionKey,
    PutOutcome, RecordStore, ReplayError, ReplayResult,
};

struct StoredRecord {
    seq: u64,
    record: Arc<InferenceRecord>,
}

#[derive(Default)]
struct Partition {
    records: Vec<StoredRecord>,
    by_hash: HashMap<Fingerprint, Vec<usize>>,
    by_time: BTreeMap<(i64, u64), usize>,
    next_seq: u64,
    trail: Vec<CaptureAuditEvent>,
}

impl Partition {
    fn append(&mut self, record: Arc<InferenceRecord>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let idx = self.records.len();
        self.by_hash
            .entry(record.input_hash.clone())
            .or_default()
            .push(idx);
        self.by_time.insert((record.timestamp, seq), idx);

        let prev_hash = self
            .trail
            .last()
            .map(|e| e.link.entry_hash.clone())
            .unwrap_or_default();
        let mut event = CaptureAuditEvent {
            sequence_number: self.trail.len() as i64 + 1,
            event_type: "capture".to_string(),
            request_id: record.request_id.clone(),
            pair: record.pair.clone(),
            timeframe: record.timeframe.clone(),
            input_hash: record.input_hash.to_string(),
            details: capture_details(&record),
            created_at: Utc::now().to_rfc3339(),
            link: ChainLink::default(),
        };
        event.link = ChainLink::extend(&prev_hash, &event.chain_fields());
        self.trail.push(event);

        self.records.push(StoredRecord { seq, record });
    }

    fn most_recent(&self, input_hash: &Fingerprint) -> Option<&StoredRecord> {
        self.by_hash
            .get(input_hash)?
            .iter()
            .map(|&i| &self.records[i])
            .max_by_key(|s| (s.record.timestamp, s.seq))
    }

    fn usable(&self, idx: usize) -> bool {
        self.records[idx].record.usable_response().is_some()
    }

    fn nearest(&self, timestamp: i64) -> Option<&StoredRecord> {
        // At or before the query: reverse order yields the highest sequence
        // first among equal timestamps.
        let below = self
            .by_time
            .range(..=(timestamp, u64::MAX))
            .rev()
            .map(|(_, &i)| i)
            .find(|&i| self.usable(i))
            .map(|i| &self.records[i]);

        // Strictly after: keep the last usable entry sharing the first
        // usable timestamp, i.e. the most recently inserted one.
        let mut above: Option<&StoredRecord> = None;
        let after = (Bound::Excluded((timestamp, u64::MAX)), Bound::Unbounded);
        for (&(ts, _), &i) in self.by_time.range(after) {
            if let Some(found) = above {
                if found.record.timestamp != ts {
                    break;
                }
            }
            if self.usable(i) {
                above = Some(&self.records[i]);
            }
        }

        match (below, above) {
            (Some(b), Some(a)) => {
                let db = timestamp.abs_diff(b.record.timestamp);
                let da = a.record.timestamp.abs_diff(timestamp);
                if db < da || (db == da && b.seq > a.seq) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        }
    }

    fn range(&self, from_ts: i64, to_ts: i64) -> Vec<InferenceRecord> {
        if from_ts > to_ts {
            return Vec::new();
        }
        self.by_time
            .range((from_ts, 0)..=(to_ts, u64::MAX))
            .map(|(_, &i)| self.records[i].record.as_ref().clone())
            .collect()
    }
}

fn capture_details(record: &InferenceRecord) -> String {
    format!(
        "status={} model={} response_hash={}",
        record.status,
        record.model_name,
        record.response_hash.as_deref().unwrap_or("-")
    )
}

fn poisoned<T>(_: PoisonError<T>) -> ReplayError {
    ReplayError::StorageUnavailable("partition lock poisoned".to_string())
}

/// In-memory `RecordStore`, used for tests and single-process backtests.
#[derive(Default)]
pub struct MemoryRecordStore {
    partitions: DashMap<PartitionKey, Arc<RwLock<Partition>>>,
    by_request: DashMap<String, Arc<InferenceRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }

    fn partition(&self, key: &PartitionKey) -> Arc<RwLock<Partition>> {
        if let Some(existing) = self.partitions.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.partitions.entry(key.clone()).or_default().value())
    }

    fn existing_partition(&self, pair: &str, timeframe: &str) -> Option<Arc<RwLock<Partition>>> {
        self.partitions
            .get(&PartitionKey::new(pair, timeframe))
            .map(|p| Arc::clone(p.value()))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: InferenceRecord) -> ReplayResult<PutOutcome> {
        let partition = self.partition(&record.partition());
        let record = Arc::new(record);

        match self.by_request.entry(record.request_id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().as_ref() == record.as_ref() {
                    tracing::debug!("Re-capture of {} ignored (identical)", record.request_id);
                    Ok(PutOutcome::AlreadyPresent)
                } else {
                    Err(ReplayError::DuplicateKey(format!(
                        "request_id {} already captured with a different payload",
                        record.request_id
                    )))
                }
            }
            Entry::Vacant(slot) => {
                partition
                    .write()
                    .map_err(poisoned)?
                    .append(Arc::clone(&record));
                slot.insert(record);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    async fn get_by_request_id(&self, request_id: &str) -> ReplayResult<Option<InferenceRecord>> {
        Ok(self
            .by_request
            .get(request_id)
            .map(|r| r.value().as_ref().clone()))
    }

    async fn get_by_fingerprint(
        &self,
        input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
    ) -> ReplayResult<Option<InferenceRecord>> {
        let Some(partition) = self.existing_partition(pair, timeframe) else {
            return Ok(None);
        };
        let guard = partition.read().map_err(poisoned)?;
        Ok(guard
            .most_recent(input_hash)
            .map(|s| s.record.as_ref().clone()))
    }

    async fn find_nearest(
        &self,
        _input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
        timestamp: i64,
    ) -> ReplayResult<Option<InferenceRecord>> {
        let Some(partition) = self.existing_partition(pair, timeframe) else {
            return Ok(None);
        };
        let guard = partition.read().map_err(poisoned)?;
        Ok(guard.nearest(timestamp).map(|s| s.record.as_ref().clone()))
    }

    fn range_query<'a>(
        &'a self,
        pair: &'a str,
        timeframe: &'a str,
        from_ts: i64,
        to_ts: i64,
    ) -> BoxStream<'a, ReplayResult<InferenceRecord>> {
        let snapshot = match self.existing_partition(pair, timeframe) {
            None => Ok(Vec::new()),
            Some(partition) => partition
                .read()
                .map(|guard| guard.range(from_ts, to_ts))
                .map_err(poisoned),
        };

        match snapshot {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn partitions(&self) -> ReplayResult<Vec<PartitionKey>> {
        let mut keys: Vec<PartitionKey> = self.partitions.iter().map(|p| p.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn capture_trail(&self, partition: &PartitionKey) -> ReplayResult<Vec<CaptureAuditEvent>> {
        let Some(p) = self.existing_partition(&partition.pair, &partition.timeframe) else {
            return Ok(Vec::new());
        };
        let guard = p.read().map_err(poisoned)?;
        Ok(guard.trail.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
