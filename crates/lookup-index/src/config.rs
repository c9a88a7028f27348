use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use replay_core::ReplayError;

const LIVE_TTL_SECS: u64 = 5;
const BACKTEST_TTL_SECS: u64 = 300; // 5 minutes
const MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Live,
    Backtest,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::Live => write!(f, "live"),
            IndexMode::Backtest => write!(f, "backtest"),
        }
    }
}

impl FromStr for IndexMode {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(IndexMode::Live),
            "backtest" => Ok(IndexMode::Backtest),
            _ => Err(ReplayError::InvalidInput(format!("Invalid index mode: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub mode: IndexMode,
    pub live_ttl: Duration,
    pub backtest_ttl: Duration,
    /// Soft cap for in-process backends
    pub max_entries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            mode: IndexMode::Backtest,
            live_ttl: Duration::from_secs(LIVE_TTL_SECS),
            backtest_ttl: Duration::from_secs(BACKTEST_TTL_SECS),
            max_entries: MAX_ENTRIES,
        }
    }
}

impl IndexConfig {
    pub fn with_mode(mode: IndexMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// TTL in effect for the configured mode.
    pub fn ttl(&self) -> Duration {
        match self.mode {
            IndexMode::Live => self.live_ttl,
            IndexMode::Backtest => self.backtest_ttl,
        }
    }
}
