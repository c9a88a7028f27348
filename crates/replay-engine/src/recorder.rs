//! Capture path: turns a live model invocation into an immutable
//! `InferenceRecord`.

use std::collections::BTreeMap;
use std::sync::Arc;

use replay_core::{
    DecisionContext, DecisionPayload, InferenceRecord, LookupIndex, PutOutcome, RecordStatus,
    RecordStore, ReplayError, ReplayResult,
};

/// How the live invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Ok(DecisionPayload),
    Error(String),
    Timeout(String),
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Generated (UUID v4) when absent
    pub request_id: Option<String>,
    pub context: DecisionContext,
    pub prompt: String,
    pub model_name: String,
    pub temperature: f64,
    pub outcome: CaptureOutcome,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub latency_ms: Option<i64>,
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl CaptureRequest {
    pub fn new(
        context: DecisionContext,
        prompt: impl Into<String>,
        model_name: impl Into<String>,
        outcome: CaptureOutcome,
    ) -> Self {
        Self {
            request_id: None,
            context,
            prompt: prompt.into(),
            model_name: model_name.into(),
            temperature: 0.0,
            outcome,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

pub struct Recorder {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn LookupIndex>,
}

impl Recorder {
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<dyn LookupIndex>) -> Self {
        Self { store, index }
    }

    /// Fingerprint, validate and append one invocation. Invalid input is
    /// rejected before anything is written. Re-capturing an identical
    /// request is a no-op that returns the stored record.
    pub async fn capture(&self, request: CaptureRequest) -> ReplayResult<InferenceRecord> {
        let input_hash = request.context.fingerprint()?;
        if !request.temperature.is_finite() {
            return Err(ReplayError::InvalidInput(format!(
                "temperature must be finite, got {}",
                request.temperature
            )));
        }

        let (status, response, error) = match request.outcome {
            CaptureOutcome::Ok(payload) => {
                payload.validate()?;
                (RecordStatus::Ok, Some(payload), None)
            }
            CaptureOutcome::Error(msg) => (RecordStatus::Error, None, Some(msg)),
            CaptureOutcome::Timeout(msg) => (RecordStatus::Timeout, None, Some(msg)),
        };
        let response_hash = response.as_ref().map(|p| p.response_hash()).transpose()?;

        let record = InferenceRecord {
            request_id: request
                .request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            timestamp: request.context.last_observed_time,
            input_hash,
            pair: request.context.pair,
            timeframe: request.context.timeframe,
            prompt: request.prompt,
            response,
            model_name: request.model_name,
            temperature: request.temperature,
            response_hash,
            status,
            error,
            tokens_in: request.tokens_in,
            tokens_out: request.tokens_out,
            latency_ms: request.latency_ms,
            meta: request.meta,
        };

        let outcome = self.store.put(record.clone()).await?;
        // A newer record may now win "most recent" for this key. The store has
        // the record, so a failed invalidation only leaves a TTL-bounded stale
        // cache entry.
        let key = record.index_key();
        if let Err(e) = self.index.invalidate(&key).await {
            tracing::warn!(
                "Captured {} but failed to invalidate lookup index for {}: {}",
                record.request_id,
                key,
                e
            );
        }

        match outcome {
            PutOutcome::Inserted => tracing::info!(
                "Captured {} {} {} fp={} status={}",
                record.request_id,
                record.pair,
                record.timeframe,
                record.input_hash.short(),
                record.status
            ),
            PutOutcome::AlreadyPresent => {
                tracing::debug!("Capture {} already present", record.request_id)
            }
        }
        Ok(record)
    }
}
