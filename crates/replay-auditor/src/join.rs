use std::collections::HashMap;

use replay_core::{InferenceRecord, LoggedReplay, Provenance, ReplayAuditEntry};

/// Compare one replayed decision with its live capture. `None` when the
/// live capture has no usable response (error/timeout records).
pub fn compare(live: &InferenceRecord, replayed: &LoggedReplay) -> Option<ReplayAuditEntry> {
    let live_payload = live.usable_response()?;
    let decision = &replayed.entry.decision;

    Some(ReplayAuditEntry {
        run_id: replayed.entry.run_id.clone(),
        request_id: replayed.entry.request_id.clone(),
        pair: replayed.entry.pair.clone(),
        timeframe: replayed.entry.timeframe.clone(),
        live_action: live_payload.action,
        replayed_action: decision.action,
        action_matches: live_payload.action == decision.action,
        live_confidence: live_payload.confidence,
        replayed_confidence: decision.confidence,
        confidence_delta: (live_payload.confidence - decision.confidence).abs(),
        provenance: decision.provenance,
        exact_replay: decision.provenance == Provenance::Exact,
    })
}

/// Join live captures with a run's replay log on `request_id`.
///
/// Pure and order-insensitive in `live`: the output follows the replay
/// log's order, and replayed entries without a usable live counterpart are
/// skipped. Re-running over a longer prefix of either log extends the
/// result without changing earlier entries.
pub fn join_logs(live: &[InferenceRecord], replayed: &[LoggedReplay]) -> Vec<ReplayAuditEntry> {
    let by_request: HashMap<&str, &InferenceRecord> =
        live.iter().map(|r| (r.request_id.as_str(), r)).collect();

    replayed
        .iter()
        .filter_map(|entry| {
            let live = by_request.get(entry.entry.request_id.as_str())?;
            compare(live, entry)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use replay_core::{
        Action, ChainLink, Decision, DecisionPayload, Fingerprint, InferenceRecord, LoggedReplay,
        Provenance, RecordStatus, ReplayLogEntry,
    };

    pub fn fp() -> Fingerprint {
        "c".repeat(64).parse().unwrap()
    }

    pub fn live(request_id: &str, action: Action, confidence: f64) -> InferenceRecord {
        let payload = DecisionPayload::new(action, confidence, "live");
        InferenceRecord {
            request_id: request_id.to_string(),
            timestamp: 1000,
            input_hash: fp(),
            pair: "BTC/USDT".to_string(),
            timeframe: "15m".to_string(),
            prompt: "prompt".to_string(),
            response_hash: Some(payload.response_hash().unwrap()),
            response: Some(payload),
            model_name: "m".to_string(),
            temperature: 0.0,
            status: RecordStatus::Ok,
            error: None,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
            meta: Default::default(),
        }
    }

    pub fn entry(
        request_id: &str,
        action: Action,
        confidence: f64,
        provenance: Provenance,
    ) -> ReplayLogEntry {
        let decision = match provenance {
            Provenance::Default => Decision::default_hold(),
            other => Decision::from_payload(DecisionPayload::new(action, confidence, "replay"), other),
        };
        ReplayLogEntry {
            run_id: "run-1".to_string(),
            request_id: request_id.to_string(),
            pair: "BTC/USDT".to_string(),
            timeframe: "15m".to_string(),
            input_hash: fp(),
            timestamp: 1000,
            decision,
            matched_request_id: None,
            distance_secs: None,
            surrogate_version: None,
            resolved_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn replayed(
        request_id: &str,
        action: Action,
        confidence: f64,
        provenance: Provenance,
    ) -> LoggedReplay {
        LoggedReplay {
            sequence_number: 0,
            entry: entry(request_id, action, confidence, provenance),
            link: ChainLink::default(),
        }
    }
}
