//! Replay Resolver: exact -> nearest -> surrogate -> default.
//!
//! Genuine absence drives the chain forward. Storage failures and an
//! expired deadline abort the resolution; they never select a fallback.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use replay_core::{
    Decision, DecisionContext, Fingerprint, IndexKey, InferenceRecord, LookupIndex, Provenance,
    RecordStore, ReplayError, ReplayLog, ReplayLogEntry, ReplayResult, SurrogatePredictor,
};

use crate::config::ResolverConfig;
use crate::stats::ResolverStats;

/// One decision point of a backtest.
///
/// Either `input_hash` or `context` must be given. Without a context the
/// surrogate stage is skipped, since a fingerprint cannot be inverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub pair: String,
    pub timeframe: String,
    /// Query time (epoch seconds)
    pub timestamp: i64,
    #[serde(default)]
    pub input_hash: Option<Fingerprint>,
    #[serde(default)]
    pub context: Option<DecisionContext>,
}

impl ResolveRequest {
    pub fn from_context(context: DecisionContext) -> Self {
        Self {
            request_id: None,
            pair: context.pair.clone(),
            timeframe: context.timeframe.clone(),
            timestamp: context.last_observed_time,
            input_hash: None,
            context: Some(context),
        }
    }

    pub fn from_fingerprint(
        input_hash: Fingerprint,
        pair: &str,
        timeframe: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            request_id: None,
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            timestamp,
            input_hash: Some(input_hash),
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// The lookup fingerprint, checking that hash and context agree when
    /// both are present.
    pub fn fingerprint(&self) -> ReplayResult<Fingerprint> {
        let from_context = match &self.context {
            Some(ctx) => {
                if ctx.pair != self.pair || ctx.timeframe != self.timeframe {
                    return Err(ReplayError::InvalidInput(format!(
                        "context partition {}@{} does not match request {}@{}",
                        ctx.pair, ctx.timeframe, self.pair, self.timeframe
                    )));
                }
                Some(ctx.fingerprint()?)
            }
            None => None,
        };

        match (from_context, &self.input_hash) {
            (Some(computed), Some(given)) if &computed != given => {
                Err(ReplayError::InvalidInput(format!(
                    "input_hash {} does not match context fingerprint {}",
                    given.short(),
                    computed.short()
                )))
            }
            (Some(computed), _) => Ok(computed),
            (None, Some(given)) => Ok(given.clone()),
            (None, None) => Err(ReplayError::InvalidInput(
                "request needs an input_hash or a context".to_string(),
            )),
        }
    }
}

/// A resolved decision plus how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    pub input_hash: Fingerprint,
    /// Record that satisfied an exact or nearest stage
    pub matched_request_id: Option<String>,
    pub distance_secs: Option<i64>,
    pub surrogate_version: Option<String>,
}

impl Resolution {
    pub fn provenance(&self) -> Provenance {
        self.decision.provenance
    }

    fn from_record(
        record: &InferenceRecord,
        provenance: Provenance,
        input_hash: &Fingerprint,
        distance_secs: Option<i64>,
    ) -> Option<Self> {
        let payload = record.usable_response()?.clone();
        Some(Self {
            decision: Decision::from_payload(payload, provenance),
            input_hash: input_hash.clone(),
            matched_request_id: Some(record.request_id.clone()),
            distance_secs,
            surrogate_version: None,
        })
    }

    fn fallback(input_hash: &Fingerprint) -> Self {
        Self {
            decision: Decision::default_hold(),
            input_hash: input_hash.clone(),
            matched_request_id: None,
            distance_secs: None,
            surrogate_version: None,
        }
    }
}

pub struct ReplayResolver {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn LookupIndex>,
    surrogate: Option<Arc<dyn SurrogatePredictor>>,
    replay_log: Option<(Arc<dyn ReplayLog>, String)>,
    config: ResolverConfig,
    stats: Arc<ResolverStats>,
}

impl ReplayResolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn LookupIndex>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            index,
            surrogate: None,
            replay_log: None,
            config,
            stats: Arc::new(ResolverStats::new()),
        }
    }

    pub fn with_surrogate(mut self, surrogate: Arc<dyn SurrogatePredictor>) -> Self {
        self.surrogate = Some(surrogate);
        self
    }

    /// Log every completed resolution under `run_id`.
    pub fn with_replay_log(mut self, log: Arc<dyn ReplayLog>, run_id: impl Into<String>) -> Self {
        self.replay_log = Some((log, run_id.into()));
        self
    }

    pub fn stats(&self) -> Arc<ResolverStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn run_id(&self) -> Option<&str> {
        self.replay_log.as_ref().map(|(_, run_id)| run_id.as_str())
    }

    /// Resolve one decision point within the configured deadline, then
    /// commit it to the replay log (if configured).
    pub async fn resolve(&self, request: &ResolveRequest) -> ReplayResult<Resolution> {
        let input_hash = request.fingerprint()?;
        let deadline = self.config.timeout;

        let resolution =
            match tokio::time::timeout(deadline, self.run_chain(request, &input_hash)).await {
                Ok(Ok(resolution)) => resolution,
                Ok(Err(e)) => {
                    if matches!(e, ReplayError::StorageUnavailable(_)) {
                        self.stats.record_storage_failure();
                    }
                    tracing::error!(
                        "Resolution failed for {} {} fp={}: {}",
                        request.pair,
                        request.timeframe,
                        input_hash.short(),
                        e
                    );
                    return Err(e);
                }
                Err(_) => {
                    self.stats.record_timeout();
                    tracing::error!(
                        "Resolution for {} {} fp={} exceeded {:?}",
                        request.pair,
                        request.timeframe,
                        input_hash.short(),
                        deadline
                    );
                    return Err(ReplayError::Timeout(deadline));
                }
            };

        self.stats.record(resolution.provenance());

        if let Some((log, run_id)) = &self.replay_log {
            let entry = ReplayLogEntry {
                run_id: run_id.clone(),
                request_id: request
                    .request_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                pair: request.pair.clone(),
                timeframe: request.timeframe.clone(),
                input_hash: input_hash.clone(),
                timestamp: request.timestamp,
                decision: resolution.decision.clone(),
                matched_request_id: resolution.matched_request_id.clone(),
                distance_secs: resolution.distance_secs,
                surrogate_version: resolution.surrogate_version.clone(),
                resolved_at: Utc::now().to_rfc3339(),
            };
            self.with_storage_retry("replay_log.append", || log.append(entry.clone()))
                .await?;
        }

        tracing::info!(
            "Resolved {} {} @{} fp={} -> {} ({}, conf {:.3})",
            request.pair,
            request.timeframe,
            request.timestamp,
            input_hash.short(),
            resolution.decision.action,
            resolution.provenance(),
            resolution.decision.confidence
        );
        Ok(resolution)
    }

    async fn run_chain(
        &self,
        request: &ResolveRequest,
        input_hash: &Fingerprint,
    ) -> ReplayResult<Resolution> {
        let mut resolved = None;
        for stage in Provenance::CHAIN {
            resolved = match stage {
                Provenance::Exact => self.exact_stage(request, input_hash).await?,
                Provenance::Nearest => self.nearest_stage(request, input_hash).await?,
                Provenance::Surrogate => self.surrogate_stage(request, input_hash).await,
                Provenance::Default => Some(Resolution::fallback(input_hash)),
            };
            if resolved.is_some() {
                break;
            }
            tracing::debug!("Stage {} missed for fp={}", stage, input_hash.short());
        }
        Ok(resolved.unwrap_or_else(|| Resolution::fallback(input_hash)))
    }

    async fn exact_stage(
        &self,
        request: &ResolveRequest,
        input_hash: &Fingerprint,
    ) -> ReplayResult<Option<Resolution>> {
        let key = IndexKey::new(input_hash.clone(), &request.pair, &request.timeframe);

        let cached = self
            .with_storage_retry("index.get", || self.index.get(&key))
            .await?;
        if let Some(record) = cached {
            if let Some(hit) = Resolution::from_record(&record, Provenance::Exact, input_hash, None)
            {
                tracing::debug!("Index hit {}", key);
                return Ok(Some(hit));
            }
        }

        let stored = self
            .with_storage_retry("store.get_by_fingerprint", || {
                self.store
                    .get_by_fingerprint(input_hash, &request.pair, &request.timeframe)
            })
            .await?;

        let Some(record) = stored else {
            return Ok(None);
        };
        let resolution = Resolution::from_record(&record, Provenance::Exact, input_hash, None);
        if resolution.is_some() {
            // Populating the cache is best-effort; the store already answered
            if let Err(e) = self.index.put(key, record).await {
                tracing::warn!("Failed to populate lookup index: {}", e);
            }
        }
        Ok(resolution)
    }

    async fn nearest_stage(
        &self,
        request: &ResolveRequest,
        input_hash: &Fingerprint,
    ) -> ReplayResult<Option<Resolution>> {
        let nearest = self
            .with_storage_retry("store.find_nearest", || {
                self.store.find_nearest(
                    input_hash,
                    &request.pair,
                    &request.timeframe,
                    request.timestamp,
                )
            })
            .await?;

        let Some(record) = nearest else {
            return Ok(None);
        };
        let distance = record.timestamp.abs_diff(request.timestamp);
        if distance > self.config.max_nearest_distance_secs.unsigned_abs() {
            tracing::debug!(
                "Nearest record {} is {}s away (bound {}s)",
                record.request_id,
                distance,
                self.config.max_nearest_distance_secs
            );
            return Ok(None);
        }
        let distance = i64::try_from(distance).unwrap_or(i64::MAX);
        Ok(Resolution::from_record(
            &record,
            Provenance::Nearest,
            input_hash,
            Some(distance),
        ))
    }

    /// Surrogate failures are absorbed here; the default stage follows.
    async fn surrogate_stage(
        &self,
        request: &ResolveRequest,
        input_hash: &Fingerprint,
    ) -> Option<Resolution> {
        let surrogate = self.surrogate.as_ref()?;
        let Some(context) = request.context.as_ref() else {
            tracing::debug!("No context for fp={}, skipping surrogate", input_hash.short());
            return None;
        };

        let payload = match surrogate.predict(context).await {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_surrogate_failure();
                tracing::warn!("Surrogate unavailable for fp={}: {}", input_hash.short(), e);
                return None;
            }
        };
        if let Err(e) = payload.validate() {
            self.stats.record_surrogate_failure();
            tracing::warn!("Surrogate returned an invalid decision: {}", e);
            return None;
        }

        Some(Resolution {
            decision: Decision::from_payload(payload, Provenance::Surrogate),
            input_hash: input_hash.clone(),
            matched_request_id: None,
            distance_secs: None,
            surrogate_version: Some(surrogate.model_version()),
        })
    }

    /// Retry `StorageUnavailable` with exponential backoff; every other
    /// outcome (including other errors) is returned as is.
    async fn with_storage_retry<T, F, Fut>(&self, op: &str, mut f: F) -> ReplayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReplayResult<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        loop {
            match f().await {
                Err(ReplayError::StorageUnavailable(msg)) if attempt < self.config.storage_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        op,
                        attempt,
                        self.config.storage_retries,
                        backoff,
                        msg
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}
