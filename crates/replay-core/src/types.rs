use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chain::{ChainLink, Chained};
use crate::error::{ReplayError, ReplayResult};
use crate::fingerprint::{compute_fingerprint, sha256_hex, Fingerprint};

/// A single named, pre-quantized model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

impl Feature {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The pre-fingerprint market context of a decision request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub pair: String,
    pub timeframe: String,
    /// Epoch seconds of the last observed bar
    pub last_observed_time: i64,
    /// Ordered feature list; order participates in the fingerprint
    pub features: Vec<Feature>,
    /// Digest of the quantized market window (see `quantized_digest`)
    #[serde(default)]
    pub feature_digest: String,
}

impl DecisionContext {
    pub fn fingerprint(&self) -> ReplayResult<Fingerprint> {
        compute_fingerprint(
            &self.pair,
            &self.timeframe,
            self.last_observed_time,
            &self.features,
            &self.feature_digest,
        )
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }

    pub fn feature_map(&self) -> HashMap<String, f64> {
        self.features
            .iter()
            .map(|f| (f.name.clone(), f.value))
            .collect()
    }
}

/// Possible trading actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "buy"),
            Action::Sell => write!(f, "sell"),
            Action::Hold => write!(f, "hold"),
        }
    }
}

impl FromStr for Action {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            "hold" => Ok(Action::Hold),
            _ => Err(ReplayError::InvalidInput(format!("Invalid action: {}", s))),
        }
    }
}

/// Which resolution strategy produced a decision.
///
/// Declaration order is the fallback order: each stage strictly dominates
/// every stage after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Exact,
    Nearest,
    Surrogate,
    Default,
}

impl Provenance {
    pub const CHAIN: [Provenance; 4] = [
        Provenance::Exact,
        Provenance::Nearest,
        Provenance::Surrogate,
        Provenance::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Exact => "exact",
            Provenance::Nearest => "nearest",
            Provenance::Surrogate => "surrogate",
            Provenance::Default => "default",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Provenance::Exact),
            "nearest" => Ok(Provenance::Nearest),
            "surrogate" => Ok(Provenance::Surrogate),
            "default" => Ok(Provenance::Default),
            _ => Err(ReplayError::InvalidInput(format!("Invalid provenance: {}", s))),
        }
    }
}

/// Outcome of the captured model invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Error,
    Timeout,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ok => "ok",
            RecordStatus::Error => "error",
            RecordStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(RecordStatus::Ok),
            "error" => Ok(RecordStatus::Error),
            "timeout" => Ok(RecordStatus::Timeout),
            _ => Err(ReplayError::InvalidInput(format!("Invalid status: {}", s))),
        }
    }
}

/// Structured model output, as captured in `InferenceRecord::response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPayload {
    pub action: Action,
    /// Model confidence (0-1)
    pub confidence: f64,
    /// Free-text explanation, for audit/UI only
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_size_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_sl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_tp: Option<f64>,
}

impl DecisionPayload {
    pub fn new(action: Action, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            action,
            confidence,
            reasoning: reasoning.into(),
            suggested_size_pct: None,
            suggested_sl: None,
            suggested_tp: None,
        }
    }

    pub fn validate(&self) -> ReplayResult<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ReplayError::InvalidInput(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        let hints = [
            ("suggested_size_pct", self.suggested_size_pct),
            ("suggested_sl", self.suggested_sl),
            ("suggested_tp", self.suggested_tp),
        ];
        for (name, hint) in hints {
            if let Some(v) = hint {
                if !v.is_finite() || v < 0.0 {
                    return Err(ReplayError::InvalidInput(format!(
                        "{} must be finite and non-negative, got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(())
    }

    /// Digest of the canonical JSON form, stored as `response_hash`.
    pub fn response_hash(&self) -> ReplayResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_hex(&bytes))
    }
}

/// Normalized decision handed to downstream risk/execution logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_size_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_sl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_tp: Option<f64>,
    pub provenance: Provenance,
}

impl Decision {
    pub fn from_payload(payload: DecisionPayload, provenance: Provenance) -> Self {
        Self {
            action: payload.action,
            confidence: payload.confidence,
            reasoning: payload.reasoning,
            suggested_size_pct: payload.suggested_size_pct,
            suggested_sl: payload.suggested_sl,
            suggested_tp: payload.suggested_tp,
            provenance,
        }
    }

    /// The static safety-net policy: hold with zero confidence.
    pub fn default_hold() -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            reasoning: "No recorded or synthesized decision available; holding".to_string(),
            suggested_size_pct: None,
            suggested_sl: None,
            suggested_tp: None,
            provenance: Provenance::Default,
        }
    }
}

/// One captured model invocation. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub request_id: String,
    /// Epoch seconds at which the market context was observed
    pub timestamp: i64,
    pub input_hash: Fingerprint,
    pub pair: String,
    pub timeframe: String,
    pub prompt: String,
    /// Absent for `error`/`timeout` records
    #[serde(default)]
    pub response: Option<DecisionPayload>,
    pub model_name: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub response_hash: Option<String>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    /// Open extension map; unknown keys are carried, never interpreted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl InferenceRecord {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(&self.pair, &self.timeframe)
    }

    pub fn index_key(&self) -> IndexKey {
        IndexKey::new(self.input_hash.clone(), &self.pair, &self.timeframe)
    }

    /// The decision payload if this record can satisfy a replay.
    pub fn usable_response(&self) -> Option<&DecisionPayload> {
        match self.status {
            RecordStatus::Ok => self.response.as_ref(),
            RecordStatus::Error | RecordStatus::Timeout => None,
        }
    }

    /// Structural checks applied to records entering a store from outside
    /// the capture path (NDJSON import).
    pub fn verify(&self) -> ReplayResult<()> {
        if self.request_id.is_empty() {
            return Err(ReplayError::InvalidInput("empty request_id".into()));
        }
        match (&self.status, &self.response) {
            (RecordStatus::Ok, None) => {
                return Err(ReplayError::CorruptRecord(format!(
                    "{}: status ok without response",
                    self.request_id
                )))
            }
            (_, Some(payload)) => {
                payload.validate()?;
                let expected = payload.response_hash()?;
                if self.response_hash.as_deref() != Some(expected.as_str()) {
                    return Err(ReplayError::CorruptRecord(format!(
                        "{}: response_hash mismatch",
                        self.request_id
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// `(pair, timeframe)` partition of the record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub pair: String,
    pub timeframe: String,
}

impl PartitionKey {
    pub fn new(pair: &str, timeframe: &str) -> Self {
        Self {
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pair, self.timeframe)
    }
}

/// Lookup index key: `(input_hash, pair, timeframe)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub input_hash: Fingerprint,
    pub pair: String,
    pub timeframe: String,
}

impl IndexKey {
    pub fn new(input_hash: Fingerprint, pair: &str, timeframe: &str) -> Self {
        Self {
            input_hash,
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.pair, self.timeframe, self.input_hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Identical payload already stored under this key
    AlreadyPresent,
}

/// Entry of the append-only capture audit trail, chained per partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureAuditEvent {
    pub sequence_number: i64,
    pub event_type: String,
    pub request_id: String,
    pub pair: String,
    pub timeframe: String,
    pub input_hash: String,
    pub details: String,
    pub created_at: String,
    #[serde(flatten)]
    pub link: ChainLink,
}

impl Chained for CaptureAuditEvent {
    fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    fn link(&self) -> &ChainLink {
        &self.link
    }

    fn chain_fields(&self) -> Vec<String> {
        vec![
            self.event_type.clone(),
            self.request_id.clone(),
            self.pair.clone(),
            self.timeframe.clone(),
            self.input_hash.clone(),
            self.details.clone(),
            self.created_at.clone(),
        ]
    }
}

/// A completed resolution, as committed to the replay log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayLogEntry {
    pub run_id: String,
    pub request_id: String,
    pub pair: String,
    pub timeframe: String,
    pub input_hash: Fingerprint,
    /// Query timestamp (epoch seconds)
    pub timestamp: i64,
    pub decision: Decision,
    /// Request id of the record that satisfied an exact/nearest stage
    #[serde(default)]
    pub matched_request_id: Option<String>,
    #[serde(default)]
    pub distance_secs: Option<i64>,
    #[serde(default)]
    pub surrogate_version: Option<String>,
    pub resolved_at: String,
}

impl ReplayLogEntry {
    /// Two entries describe the same resolution if everything but the
    /// wall-clock stamp agrees.
    pub fn same_resolution(&self, other: &ReplayLogEntry) -> bool {
        self.run_id == other.run_id
            && self.request_id == other.request_id
            && self.pair == other.pair
            && self.timeframe == other.timeframe
            && self.input_hash == other.input_hash
            && self.timestamp == other.timestamp
            && self.decision == other.decision
            && self.matched_request_id == other.matched_request_id
            && self.distance_secs == other.distance_secs
            && self.surrogate_version == other.surrogate_version
    }
}

/// A replay log entry together with its position in the run's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedReplay {
    pub sequence_number: i64,
    #[serde(flatten)]
    pub entry: ReplayLogEntry,
    #[serde(flatten)]
    pub link: ChainLink,
}

impl Chained for LoggedReplay {
    fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    fn link(&self) -> &ChainLink {
        &self.link
    }

    fn chain_fields(&self) -> Vec<String> {
        let e = &self.entry;
        vec![
            e.run_id.clone(),
            e.request_id.clone(),
            e.pair.clone(),
            e.timeframe.clone(),
            e.input_hash.to_string(),
            e.timestamp.to_string(),
            serde_json::to_string(&e.decision).unwrap_or_default(),
            e.matched_request_id.clone().unwrap_or_default(),
            e.distance_secs.map(|d| d.to_string()).unwrap_or_default(),
            e.surrogate_version.clone().unwrap_or_default(),
            e.resolved_at.clone(),
        ]
    }
}

/// Field-by-field divergence between a live capture and its replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayAuditEntry {
    pub run_id: String,
    pub request_id: String,
    pub pair: String,
    pub timeframe: String,
    pub live_action: Action,
    pub replayed_action: Action,
    pub action_matches: bool,
    pub live_confidence: f64,
    pub replayed_confidence: f64,
    /// |live - replayed|
    pub confidence_delta: f64,
    pub provenance: Provenance,
    /// False when a fallback stage answered (coverage gap)
    pub exact_replay: bool,
}
