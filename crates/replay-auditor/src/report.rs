use serde::{Deserialize, Serialize};

use replay_core::{LoggedReplay, Provenance, ReplayAuditEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceCounts {
    pub exact: usize,
    pub nearest: usize,
    pub surrogate: usize,
    pub default: usize,
}

impl ProvenanceCounts {
    fn add(&mut self, provenance: Provenance) {
        match provenance {
            Provenance::Exact => self.exact += 1,
            Provenance::Nearest => self.nearest += 1,
            Provenance::Surrogate => self.surrogate += 1,
            Provenance::Default => self.default += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.exact + self.nearest + self.surrogate + self.default
    }
}

/// Run-level reproducibility report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub run_id: String,
    pub total_decisions: usize,
    pub provenance: ProvenanceCounts,
    /// Fraction of decisions resolved via exact match
    pub replay_coverage: Option<f64>,
    /// Decisions with a usable live counterpart
    pub audited: usize,
    pub action_match_rate: Option<f64>,
    pub mean_confidence_delta: Option<f64>,
    pub surrogate_compared: usize,
    pub surrogate_mismatches: usize,
    /// Absent when no surrogate decision has a live counterpart
    pub surrogate_error_rate: Option<f64>,
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    if den == 0 {
        None
    } else {
        Some(num as f64 / den as f64)
    }
}

/// Aggregate a run's replay log and its audit join.
pub fn summarize(run_id: &str, replayed: &[LoggedReplay], audited: &[ReplayAuditEntry]) -> ReplaySummary {
    let mut provenance = ProvenanceCounts::default();
    for entry in replayed {
        provenance.add(entry.entry.decision.provenance);
    }

    let matches = audited.iter().filter(|a| a.action_matches).count();
    let delta_sum: f64 = audited.iter().map(|a| a.confidence_delta).sum();

    let surrogate: Vec<&ReplayAuditEntry> = audited
        .iter()
        .filter(|a| a.provenance == Provenance::Surrogate)
        .collect();
    let surrogate_mismatches = surrogate.iter().filter(|a| !a.action_matches).count();

    ReplaySummary {
        run_id: run_id.to_string(),
        total_decisions: replayed.len(),
        provenance,
        replay_coverage: ratio(provenance.exact, replayed.len()),
        audited: audited.len(),
        action_match_rate: ratio(matches, audited.len()),
        mean_confidence_delta: if audited.is_empty() {
            None
        } else {
            Some(delta_sum / audited.len() as f64)
        },
        surrogate_compared: surrogate.len(),
        surrogate_mismatches,
        surrogate_error_rate: ratio(surrogate_mismatches, surrogate.len()),
    }
}
