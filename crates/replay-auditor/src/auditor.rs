use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use replay_core::{
    verify_chain, ChainVerification, InferenceRecord, LoggedReplay, PartitionKey, RecordStore,
    ReplayAuditEntry, ReplayError, ReplayLog, ReplayResult,
};

use crate::join::{compare, join_logs};
use crate::report::{summarize, ReplaySummary};

/// Result of auditing a single replayed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Entry(ReplayAuditEntry),
    /// The live side has nothing comparable (missing, error or timeout capture)
    NotApplicable { reason: String },
}

pub struct ReproducibilityAuditor {
    store: Arc<dyn RecordStore>,
    log: Arc<dyn ReplayLog>,
}

impl ReproducibilityAuditor {
    pub fn new(store: Arc<dyn RecordStore>, log: Arc<dyn ReplayLog>) -> Self {
        Self { store, log }
    }

    /// Compare the replayed decision for `request_id` in `run_id` with its
    /// live capture.
    pub async fn audit(&self, run_id: &str, request_id: &str) -> ReplayResult<AuditOutcome> {
        let replayed = self
            .log
            .entry_for_request(run_id, request_id)
            .await?
            .ok_or_else(|| {
                ReplayError::NotFound(format!(
                    "request {} was not resolved in run {}",
                    request_id, run_id
                ))
            })?;

        let live = match self.store.get_by_request_id(request_id).await? {
            Some(record) => record,
            None => {
                return Ok(AuditOutcome::NotApplicable {
                    reason: format!("no live capture for request {}", request_id),
                })
            }
        };

        Ok(match compare(&live, &replayed) {
            Some(entry) => AuditOutcome::Entry(entry),
            None => AuditOutcome::NotApplicable {
                reason: format!("live capture {} has status {}", request_id, live.status.as_str()),
            },
        })
    }

    /// Audit every entry of a run that has a usable live counterpart, in
    /// replay-log order.
    pub async fn audit_run(&self, run_id: &str) -> ReplayResult<Vec<ReplayAuditEntry>> {
        let replayed = self.log.run_entries(run_id).await?;
        let live = self.live_records(&replayed).await?;
        Ok(join_logs(&live, &replayed))
    }

    /// Coverage and divergence summary for a run.
    pub async fn report(&self, run_id: &str) -> ReplayResult<ReplaySummary> {
        let replayed = self.log.run_entries(run_id).await?;
        if replayed.is_empty() {
            return Err(ReplayError::NotFound(format!("no replay entries for run {}", run_id)));
        }

        let live = self.live_records(&replayed).await?;
        let audited = join_logs(&live, &replayed);
        let summary = summarize(run_id, &replayed, &audited);

        info!(
            "Audit report for run {}: {} decisions, {} exact, {} audited",
            run_id, summary.total_decisions, summary.provenance.exact, summary.audited
        );
        Ok(summary)
    }

    /// Walk the hash chain of a run's replay log.
    pub async fn verify_run(&self, run_id: &str) -> ReplayResult<ChainVerification> {
        let entries = self.log.run_entries(run_id).await?;
        let verification = verify_chain(&entries);
        if !verification.is_valid {
            warn!("Replay log for run {} failed verification: {}", run_id, verification.message);
        }
        Ok(verification)
    }

    /// Walk the capture audit trail of a partition.
    pub async fn verify_partition(&self, partition: &PartitionKey) -> ReplayResult<ChainVerification> {
        let trail = self.store.capture_trail(partition).await?;
        let verification = verify_chain(&trail);
        if !verification.is_valid {
            warn!(
                "Capture trail for {}:{} failed verification: {}",
                partition.pair, partition.timeframe, verification.message
            );
        }
        Ok(verification)
    }

    async fn live_records(&self, replayed: &[LoggedReplay]) -> ReplayResult<Vec<InferenceRecord>> {
        let mut live = Vec::with_capacity(replayed.len());
        for entry in replayed {
            match self.store.get_by_request_id(&entry.entry.request_id).await? {
                Some(record) => live.push(record),
                None => debug!("No live capture for replayed request {}", entry.entry.request_id),
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::fixtures::{entry, live};
    use record_store::{MemoryRecordStore, MemoryReplayLog};
    use replay_core::{Action, Provenance, RecordStatus};

    async fn auditor_with(
        live_records: Vec<InferenceRecord>,
        entries: Vec<replay_core::ReplayLogEntry>,
    ) -> (ReproducibilityAuditor, Arc<MemoryRecordStore>, Arc<MemoryReplayLog>) {
        let store = Arc::new(MemoryRecordStore::new());
        for record in live_records {
            store.put(record).await.unwrap();
        }
        let log = Arc::new(MemoryReplayLog::new());
        for e in entries {
            log.append(e).await.unwrap();
        }
        let auditor = ReproducibilityAuditor::new(store.clone(), log.clone());
        (auditor, store, log)
    }

    #[tokio::test]
    async fn test_audit_single_request() {
        let (auditor, _, _) = auditor_with(
            vec![live("r1", Action::Buy, 0.8)],
            vec![entry("r1", Action::Buy, 0.8, Provenance::Exact)],
        )
        .await;

        match auditor.audit("run-1", "r1").await.unwrap() {
            AuditOutcome::Entry(e) => {
                assert!(e.action_matches);
                assert!(e.exact_replay);
            }
            other => panic!("expected audit entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_audit_unresolved_request_is_not_found() {
        let (auditor, _, _) = auditor_with(vec![live("r1", Action::Buy, 0.8)], vec![]).await;
        let err = auditor.audit("run-1", "r1").await.unwrap_err();
        assert!(matches!(err, ReplayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_audit_failed_live_capture_not_applicable() {
        let mut failed = live("r1", Action::Buy, 0.8);
        failed.status = RecordStatus::Timeout;
        failed.response = None;
        failed.response_hash = None;
        failed.error = Some("upstream timeout".to_string());

        let (auditor, _, _) = auditor_with(
            vec![failed],
            vec![entry("r1", Action::Hold, 0.0, Provenance::Default)],
        )
        .await;

        let outcome = auditor.audit("run-1", "r1").await.unwrap();
        assert!(matches!(outcome, AuditOutcome::NotApplicable { .. }));

        let (auditor, _, _) =
            auditor_with(vec![], vec![entry("r2", Action::Hold, 0.0, Provenance::Default)]).await;
        let outcome = auditor.audit("run-1", "r2").await.unwrap();
        assert!(matches!(outcome, AuditOutcome::NotApplicable { .. }));
    }

    #[tokio::test]
    async fn test_report_and_verification() {
        let (auditor, store, _) = auditor_with(
            vec![live("r1", Action::Buy, 0.8), live("r2", Action::Sell, 0.6)],
            vec![
                entry("r1", Action::Buy, 0.8, Provenance::Exact),
                entry("r2", Action::Buy, 0.55, Provenance::Surrogate),
                entry("r3", Action::Hold, 0.0, Provenance::Default),
            ],
        )
        .await;

        let audited = auditor.audit_run("run-1").await.unwrap();
        assert_eq!(audited.len(), 2);

        let summary = auditor.report("run-1").await.unwrap();
        assert_eq!(summary.total_decisions, 3);
        assert_eq!(summary.surrogate_compared, 1);
        assert_eq!(summary.surrogate_mismatches, 1);
        assert_eq!(summary.action_match_rate, Some(0.5));

        let run_check = auditor.verify_run("run-1").await.unwrap();
        assert!(run_check.is_valid);
        assert_eq!(run_check.total_entries, 3);

        let partition = PartitionKey::new("BTC/USDT", "15m");
        let trail_check = auditor.verify_partition(&partition).await.unwrap();
        assert!(trail_check.is_valid);
        assert_eq!(trail_check.total_entries, 2);
        assert_eq!(store.partitions().await.unwrap(), vec![partition]);
    }

    #[tokio::test]
    async fn test_report_unknown_run() {
        let (auditor, _, _) = auditor_with(vec![], vec![]).await;
        assert!(matches!(
            auditor.report("missing").await.unwrap_err(),
            ReplayError::NotFound(_)
        ));
    }
}
