use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use replay_core::Provenance;

/// Which fallback stage answered, counted per resolver.
#[derive(Debug, Default)]
pub struct ResolverStats {
    exact: AtomicU64,
    nearest: AtomicU64,
    surrogate: AtomicU64,
    default: AtomicU64,
    surrogate_failures: AtomicU64,
    storage_failures: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub exact: u64,
    pub nearest: u64,
    pub surrogate: u64,
    pub default: u64,
    pub surrogate_failures: u64,
    pub storage_failures: u64,
    pub timeouts: u64,
}

impl StatsSnapshot {
    pub fn resolved(&self) -> u64 {
        self.exact + self.nearest + self.surrogate + self.default
    }
}

impl ResolverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, provenance: Provenance) {
        let counter = match provenance {
            Provenance::Exact => &self.exact,
            Provenance::Nearest => &self.nearest,
            Provenance::Surrogate => &self.surrogate,
            Provenance::Default => &self.default,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_surrogate_failure(&self) {
        self.surrogate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            exact: self.exact.load(Ordering::Relaxed),
            nearest: self.nearest.load(Ordering::Relaxed),
            surrogate: self.surrogate.load(Ordering::Relaxed),
            default: self.default.load(Ordering::Relaxed),
            surrogate_failures: self.surrogate_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
