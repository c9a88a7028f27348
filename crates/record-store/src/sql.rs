//! SQL backend over `sqlx::AnyPool` (SQLite in practice).
//!
//! Insertion order is the `seq` autoincrement column, which breaks
//! timestamp ties for "most recent wins" regardless of writer clock skew.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::{any::AnyPoolOptions, AnyPool, FromRow};
use tokio::sync::{Mutex, OwnedMutexGuard};

use replay_core::{
    Action, CaptureAuditEvent, ChainLink, Chained, Decision, Fingerprint, InferenceRecord,
    LoggedReplay, PartitionKey, PutOutcome, RecordStatus, RecordStore, ReplayError, ReplayLog,
    ReplayLogEntry, ReplayResult,
};

use crate::replay_log::{check_duplicate, link_entry};

const RECORD_COLUMNS: &str = "seq, request_id, timestamp, input_hash, pair, timeframe, prompt, \
     response, model_name, temperature, response_hash, status, error, tokens_in, tokens_out, \
     latency_ms, meta";

const REPLAY_COLUMNS: &str = "sequence_number, run_id, request_id, pair, timeframe, input_hash, \
     timestamp, decision, matched_request_id, distance_secs, surrogate_version, resolved_at, \
     prev_hash, entry_hash";

/// Map a driver error onto the replay taxonomy. Decode problems mean a bad
/// row; everything else means the backend could not serve the request.
pub(crate) fn storage_err(e: sqlx::Error) -> ReplayError {
    match e {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => ReplayError::CorruptRecord(e.to_string()),
        other => ReplayError::StorageUnavailable(other.to_string()),
    }
}

/// Open a pool for `database_url`, installing the `Any` drivers.
/// In-memory SQLite is pinned to one connection so all callers share it.
pub async fn connect(database_url: &str) -> ReplayResult<AnyPool> {
    sqlx::any::install_default_drivers();
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(storage_err)
}

/// Create tables and indexes if missing.
pub async fn init_schema(pool: &AnyPool) -> ReplayResult<()> {
    let schema = include_str!("../schema.sql");

    // Execute schema (split by statement since sqlx doesn't support multiple statements)
    for statement in schema.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(storage_err)?;
        }
    }
    Ok(())
}

#[derive(Debug, FromRow)]
struct RecordRow {
    #[allow(dead_code)]
    seq: i64,
    request_id: String,
    timestamp: i64,
    input_hash: String,
    pair: String,
    timeframe: String,
    prompt: String,
    response: Option<String>,
    model_name: String,
    temperature: f64,
    response_hash: Option<String>,
    status: String,
    error: Option<String>,
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    latency_ms: Option<i64>,
    meta: Option<String>,
}

impl RecordRow {
    fn into_record(self) -> ReplayResult<InferenceRecord> {
        let corrupt = |what: &str, detail: String| {
            ReplayError::CorruptRecord(format!("{} {}: {}", self.request_id, what, detail))
        };

        let input_hash: Fingerprint = self
            .input_hash
            .parse()
            .map_err(|e: ReplayError| corrupt("input_hash", e.to_string()))?;
        let status: RecordStatus = self
            .status
            .parse()
            .map_err(|e: ReplayError| corrupt("status", e.to_string()))?;
        let response = match &self.response {
            Some(json) => Some(
                serde_json::from_str(json).map_err(|e| corrupt("response", e.to_string()))?,
            ),
            None => None,
        };
        let meta: BTreeMap<String, serde_json::Value> = match &self.meta {
            Some(json) => serde_json::from_str(json).map_err(|e| corrupt("meta", e.to_string()))?,
            None => BTreeMap::new(),
        };

        Ok(InferenceRecord {
            request_id: self.request_id,
            timestamp: self.timestamp,
            input_hash,
            pair: self.pair,
            timeframe: self.timeframe,
            prompt: self.prompt,
            response,
            model_name: self.model_name,
            temperature: self.temperature,
            response_hash: self.response_hash,
            status,
            error: self.error,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            latency_ms: self.latency_ms,
            meta,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    sequence_number: i64,
    event_type: String,
    request_id: String,
    pair: String,
    timeframe: String,
    input_hash: String,
    details: String,
    created_at: String,
    prev_hash: String,
    entry_hash: String,
}

impl From<AuditRow> for CaptureAuditEvent {
    fn from(row: AuditRow) -> Self {
        CaptureAuditEvent {
            sequence_number: row.sequence_number,
            event_type: row.event_type,
            request_id: row.request_id,
            pair: row.pair,
            timeframe: row.timeframe,
            input_hash: row.input_hash,
            details: row.details,
            created_at: row.created_at,
            link: ChainLink {
                prev_hash: row.prev_hash,
                entry_hash: row.entry_hash,
            },
        }
    }
}

/// One async mutex per key, created on first use.
struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is released before awaiting
        let lock = self.locks.entry(key).or_default().value().clone();
        lock.lock_owned().await
    }
}

/// SQL-backed `RecordStore`.
pub struct SqlRecordStore {
    pool: AnyPool,
    /// Serializes capture writes within a partition so its audit chain is
    /// read and extended atomically. Other partitions proceed in parallel.
    partition_locks: KeyedLocks<PartitionKey>,
}

impl SqlRecordStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str) -> ReplayResult<Self> {
        let pool = connect(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: AnyPool) -> ReplayResult<Self> {
        init_schema(&pool).await?;
        Ok(Self {
            pool,
            partition_locks: KeyedLocks::new(),
        })
    }

    /// Get the database pool
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn fetch_one_record(
        &self,
        sql: &str,
        binds: (&str, &str, &str),
    ) -> ReplayResult<Option<InferenceRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(sql)
            .bind(binds.0)
            .bind(binds.1)
            .bind(binds.2)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(RecordRow::into_record).transpose()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ReplayResult<String> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn put(&self, record: InferenceRecord) -> ReplayResult<PutOutcome> {
        let _guard = self.partition_locks.lock(record.partition()).await;

        if let Some(existing) = self.get_by_request_id(&record.request_id).await? {
            if existing == record {
                tracing::debug!("Re-capture of {} ignored (identical)", record.request_id);
                return Ok(PutOutcome::AlreadyPresent);
            }
            return Err(ReplayError::DuplicateKey(format!(
                "request_id {} already captured with a different payload",
                record.request_id
            )));
        }

        let response = record.response.as_ref().map(to_json).transpose()?;
        let meta = if record.meta.is_empty() {
            None
        } else {
            Some(to_json(&record.meta)?)
        };

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO inference_records (
                request_id, timestamp, input_hash, pair, timeframe, prompt, response,
                model_name, temperature, response_hash, status, error,
                tokens_in, tokens_out, latency_ms, meta
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_id)
        .bind(record.timestamp)
        .bind(record.input_hash.as_str())
        .bind(&record.pair)
        .bind(&record.timeframe)
        .bind(&record.prompt)
        .bind(response)
        .bind(&record.model_name)
        .bind(record.temperature)
        .bind(record.response_hash.clone())
        .bind(record.status.as_str())
        .bind(record.error.clone())
        .bind(record.tokens_in)
        .bind(record.tokens_out)
        .bind(record.latency_ms)
        .bind(meta)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ReplayError::DuplicateKey(format!(
                        "request_id {} captured concurrently",
                        record.request_id
                    ))
                }
                other => storage_err(other),
            });
        }

        // Fetch the partition's previous chain link within the transaction
        let (prev_hash, prev_seq): (String, i64) = sqlx::query_as(
            "SELECT entry_hash, sequence_number FROM capture_audit
             WHERE pair = ? AND timeframe = ?
             ORDER BY sequence_number DESC LIMIT 1",
        )
        .bind(&record.pair)
        .bind(&record.timeframe)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .unwrap_or_default();

        let mut event = CaptureAuditEvent {
            sequence_number: prev_seq + 1,
            event_type: "capture".to_string(),
            request_id: record.request_id.clone(),
            pair: record.pair.clone(),
            timeframe: record.timeframe.clone(),
            input_hash: record.input_hash.to_string(),
            details: format!(
                "status={} model={} response_hash={}",
                record.status,
                record.model_name,
                record.response_hash.as_deref().unwrap_or("-")
            ),
            created_at: Utc::now().to_rfc3339(),
            link: ChainLink::default(),
        };
        event.link = ChainLink::extend(&prev_hash, &event.chain_fields());

        sqlx::query(
            "INSERT INTO capture_audit (sequence_number, event_type, request_id, pair, timeframe,
                input_hash, details, created_at, prev_hash, entry_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.sequence_number)
        .bind(&event.event_type)
        .bind(&event.request_id)
        .bind(&event.pair)
        .bind(&event.timeframe)
        .bind(&event.input_hash)
        .bind(&event.details)
        .bind(&event.created_at)
        .bind(&event.link.prev_hash)
        .bind(&event.link.entry_hash)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(PutOutcome::Inserted)
    }

    async fn get_by_request_id(&self, request_id: &str) -> ReplayResult<Option<InferenceRecord>> {
        let sql = format!(
            "SELECT {} FROM inference_records WHERE request_id = ?",
            RECORD_COLUMNS
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn get_by_fingerprint(
        &self,
        input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
    ) -> ReplayResult<Option<InferenceRecord>> {
        let sql = format!(
            "SELECT {} FROM inference_records
             WHERE input_hash = ? AND pair = ? AND timeframe = ?
             ORDER BY timestamp DESC, seq DESC
             LIMIT 1",
            RECORD_COLUMNS
        );
        self.fetch_one_record(&sql, (input_hash.as_str(), pair, timeframe))
            .await
    }

    async fn find_nearest(
        &self,
        _input_hash: &Fingerprint,
        pair: &str,
        timeframe: &str,
        timestamp: i64,
    ) -> ReplayResult<Option<InferenceRecord>> {
        let sql = format!(
            "SELECT {} FROM inference_records
             WHERE pair = ? AND timeframe = ? AND status = 'ok' AND response IS NOT NULL
             ORDER BY ABS(timestamp - ?) ASC, seq DESC
             LIMIT 1",
            RECORD_COLUMNS
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(pair)
            .bind(timeframe)
            .bind(timestamp)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(RecordRow::into_record).transpose()
    }

    fn range_query<'a>(
        &'a self,
        pair: &'a str,
        timeframe: &'a str,
        from_ts: i64,
        to_ts: i64,
    ) -> BoxStream<'a, ReplayResult<InferenceRecord>> {
        const RANGE_SQL: &str = "SELECT seq, request_id, timestamp, input_hash, pair, timeframe, \
             prompt, response, model_name, temperature, response_hash, status, error, tokens_in, \
             tokens_out, latency_ms, meta
             FROM inference_records
             WHERE pair = ? AND timeframe = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC, seq ASC";

        sqlx::query_as::<_, RecordRow>(RANGE_SQL)
            .bind(pair)
            .bind(timeframe)
            .bind(from_ts)
            .bind(to_ts)
            .fetch(&self.pool)
            .map(|row| row.map_err(storage_err).and_then(RecordRow::into_record))
            .boxed()
    }

    async fn partitions(&self) -> ReplayResult<Vec<PartitionKey>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT pair, timeframe FROM inference_records ORDER BY pair, timeframe",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .map(|(pair, timeframe)| PartitionKey { pair, timeframe })
            .collect())
    }

    async fn capture_trail(&self, partition: &PartitionKey) -> ReplayResult<Vec<CaptureAuditEvent>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT sequence_number, event_type, request_id, pair, timeframe, input_hash,
                    details, created_at, prev_hash, entry_hash
             FROM capture_audit
             WHERE pair = ? AND timeframe = ?
             ORDER BY sequence_number ASC",
        )
        .bind(&partition.pair)
        .bind(&partition.timeframe)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(CaptureAuditEvent::from).collect())
    }

    fn backend_name(&self) -> &'static str {
        "sql"
    }
}

#[derive(Debug, FromRow)]
struct ReplayRow {
    sequence_number: i64,
    run_id: String,
    request_id: String,
    pair: String,
    timeframe: String,
    input_hash: String,
    timestamp: i64,
    decision: String,
    matched_request_id: Option<String>,
    distance_secs: Option<i64>,
    surrogate_version: Option<String>,
    resolved_at: String,
    prev_hash: String,
    entry_hash: String,
}

impl ReplayRow {
    fn into_logged(self) -> ReplayResult<LoggedReplay> {
        let input_hash: Fingerprint = self.input_hash.parse().map_err(|e: ReplayError| {
            ReplayError::CorruptRecord(format!("replay {}: {}", self.request_id, e))
        })?;
        let decision: Decision = serde_json::from_str(&self.decision).map_err(|e| {
            ReplayError::CorruptRecord(format!("replay {} decision: {}", self.request_id, e))
        })?;

        Ok(LoggedReplay {
            sequence_number: self.sequence_number,
            entry: ReplayLogEntry {
                run_id: self.run_id,
                request_id: self.request_id,
                pair: self.pair,
                timeframe: self.timeframe,
                input_hash,
                timestamp: self.timestamp,
                decision,
                matched_request_id: self.matched_request_id,
                distance_secs: self.distance_secs,
                surrogate_version: self.surrogate_version,
                resolved_at: self.resolved_at,
            },
            link: ChainLink {
                prev_hash: self.prev_hash,
                entry_hash: self.entry_hash,
            },
        })
    }
}

/// SQL-backed `ReplayLog`, sharing the record store's database.
pub struct SqlReplayLog {
    pool: AnyPool,
    /// Chains are per run, so appends only serialize within a run
    run_locks: KeyedLocks<String>,
}

impl SqlReplayLog {
    pub async fn from_pool(pool: AnyPool) -> ReplayResult<Self> {
        init_schema(&pool).await?;
        Ok(Self {
            pool,
            run_locks: KeyedLocks::new(),
        })
    }

    /// Count of logged decisions per action for a run (reporting helper).
    pub async fn action_counts(&self, run_id: &str) -> ReplayResult<Vec<(Action, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT action, COUNT(*) FROM replay_log WHERE run_id = ? GROUP BY action ORDER BY action",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter()
            .map(|(action, count)| {
                action
                    .parse::<Action>()
                    .map(|a| (a, count))
                    .map_err(|e| ReplayError::CorruptRecord(e.to_string()))
            })
            .collect()
    }

    async fn last_in_run(&self, run_id: &str) -> ReplayResult<Option<LoggedReplay>> {
        let sql = format!(
            "SELECT {} FROM replay_log WHERE run_id = ? ORDER BY sequence_number DESC LIMIT 1",
            REPLAY_COLUMNS
        );
        let row: Option<ReplayRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(ReplayRow::into_logged).transpose()
    }
}

#[async_trait]
impl ReplayLog for SqlReplayLog {
    async fn append(&self, entry: ReplayLogEntry) -> ReplayResult<PutOutcome> {
        let _guard = self.run_locks.lock(entry.run_id.clone()).await;

        if let Some(existing) = self
            .entry_for_request(&entry.run_id, &entry.request_id)
            .await?
        {
            return check_duplicate(&existing, &entry);
        }

        let prev = self.last_in_run(&entry.run_id).await?;
        let logged = link_entry(entry, prev.as_ref());
        let e = &logged.entry;

        sqlx::query(
            r#"
            INSERT INTO replay_log (
                run_id, request_id, sequence_number, pair, timeframe, input_hash, timestamp,
                provenance, action, decision, matched_request_id, distance_secs,
                surrogate_version, resolved_at, prev_hash, entry_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.run_id)
        .bind(&e.request_id)
        .bind(logged.sequence_number)
        .bind(&e.pair)
        .bind(&e.timeframe)
        .bind(e.input_hash.as_str())
        .bind(e.timestamp)
        .bind(e.decision.provenance.as_str())
        .bind(e.decision.action.to_string())
        .bind(to_json(&e.decision)?)
        .bind(e.matched_request_id.clone())
        .bind(e.distance_secs)
        .bind(e.surrogate_version.clone())
        .bind(&e.resolved_at)
        .bind(&logged.link.prev_hash)
        .bind(&logged.link.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(PutOutcome::Inserted)
    }

    async fn run_entries(&self, run_id: &str) -> ReplayResult<Vec<LoggedReplay>> {
        let sql = format!(
            "SELECT {} FROM replay_log WHERE run_id = ? ORDER BY sequence_number ASC",
            REPLAY_COLUMNS
        );
        let rows: Vec<ReplayRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(ReplayRow::into_logged).collect()
    }

    async fn entry_for_request(
        &self,
        run_id: &str,
        request_id: &str,
    ) -> ReplayResult<Option<LoggedReplay>> {
        let sql = format!(
            "SELECT {} FROM replay_log WHERE run_id = ? AND request_id = ?",
            REPLAY_COLUMNS
        );
        let row: Option<ReplayRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(ReplayRow::into_logged).transpose()
    }

    async fn runs(&self) -> ReplayResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT run_id FROM replay_log ORDER BY run_id")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }
}
