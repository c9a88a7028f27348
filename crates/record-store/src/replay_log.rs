use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;

use replay_core::{
    ChainLink, Chained, LoggedReplay, PutOutcome, ReplayError, ReplayLog, ReplayLogEntry,
    ReplayResult,
};

#[derive(Default)]
struct RunLog {
    entries: Vec<LoggedReplay>,
    by_request: HashMap<String, usize>,
}

/// In-memory replay log; each run is chained and locked independently.
#[derive(Default)]
pub struct MemoryReplayLog {
    runs: DashMap<String, Arc<Mutex<RunLog>>>,
}

impl MemoryReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, run_id: &str) -> Option<Arc<Mutex<RunLog>>> {
        self.runs.get(run_id).map(|r| Arc::clone(r.value()))
    }
}

fn poisoned<T>(_: PoisonError<T>) -> ReplayError {
    ReplayError::StorageUnavailable("replay log lock poisoned".to_string())
}

/// Chain a new entry after `prev` (the run's last entry, if any).
pub(crate) fn link_entry(entry: ReplayLogEntry, prev: Option<&LoggedReplay>) -> LoggedReplay {
    let (sequence_number, prev_hash) = match prev {
        Some(p) => (p.sequence_number + 1, p.link.entry_hash.clone()),
        None => (1, String::new()),
    };
    let mut logged = LoggedReplay {
        sequence_number,
        entry,
        link: ChainLink::default(),
    };
    logged.link = ChainLink::extend(&prev_hash, &logged.chain_fields());
    logged
}

/// Shared duplicate policy for `(run_id, request_id)` re-appends.
pub(crate) fn check_duplicate(
    existing: &LoggedReplay,
    entry: &ReplayLogEntry,
) -> ReplayResult<PutOutcome> {
    if existing.entry.same_resolution(entry) {
        Ok(PutOutcome::AlreadyPresent)
    } else {
        Err(ReplayError::DuplicateKey(format!(
            "run {} already resolved request {} differently ({} vs {})",
            entry.run_id,
            entry.request_id,
            existing.entry.decision.provenance,
            entry.decision.provenance
        )))
    }
}

#[async_trait]
impl ReplayLog for MemoryReplayLog {
    async fn append(&self, entry: ReplayLogEntry) -> ReplayResult<PutOutcome> {
        let run = Arc::clone(self.runs.entry(entry.run_id.clone()).or_default().value());
        let mut log = run.lock().map_err(poisoned)?;

        if let Some(&idx) = log.by_request.get(&entry.request_id) {
            return check_duplicate(&log.entries[idx], &entry);
        }

        let request_id = entry.request_id.clone();
        let logged = link_entry(entry, log.entries.last());
        let idx = log.entries.len();
        log.entries.push(logged);
        log.by_request.insert(request_id, idx);
        Ok(PutOutcome::Inserted)
    }

    async fn run_entries(&self, run_id: &str) -> ReplayResult<Vec<LoggedReplay>> {
        match self.run(run_id) {
            Some(run) => Ok(run.lock().map_err(poisoned)?.entries.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn entry_for_request(
        &self,
        run_id: &str,
        request_id: &str,
    ) -> ReplayResult<Option<LoggedReplay>> {
        let Some(run) = self.run(run_id) else {
            return Ok(None);
        };
        let log = run.lock().map_err(poisoned)?;
        Ok(log
            .by_request
            .get(request_id)
            .map(|&idx| log.entries[idx].clone()))
    }

    async fn runs(&self) -> ReplayResult<Vec<String>> {
        let mut runs: Vec<String> = self.runs.iter().map(|r| r.key().clone()).collect();
        runs.sort();
        Ok(runs)
    }
}
