use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use lookup_index::{IndexConfig, IndexMode};

/// Resolution policy knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Inclusive bound on |record.timestamp - query.timestamp| for a
    /// nearest match. No default: it changes backtest semantics.
    pub max_nearest_distance_secs: i64,
    /// Deadline for one resolution, retries included
    pub timeout: Duration,
    pub storage_retries: u32,
    /// First retry delay; doubled on each further attempt
    pub retry_backoff: Duration,
}

impl ResolverConfig {
    pub fn new(max_nearest_distance_secs: i64) -> Self {
        Self {
            max_nearest_distance_secs,
            timeout: Duration::from_millis(5000),
            storage_retries: 2,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Memory,
    Redis,
}

impl FromStr for IndexBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(IndexBackend::Memory),
            "redis" => Ok(IndexBackend::Redis),
            _ => bail!("Invalid index backend: {} (expected memory|redis)", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurrogateConfig {
    None,
    Rules,
    Linear { model_path: String },
    Http {
        url: String,
        model_version: String,
        timeout: Duration,
    },
}

impl fmt::Display for SurrogateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurrogateConfig::None => write!(f, "none"),
            SurrogateConfig::Rules => write!(f, "rules"),
            SurrogateConfig::Linear { model_path } => write!(f, "linear ({})", model_path),
            SurrogateConfig::Http { url, .. } => write!(f, "http ({})", url),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub database_url: String,
    pub index_backend: IndexBackend,
    pub redis_url: String,
    pub index: IndexConfig,
    /// Absent when no nearest-match bound is configured; only resolution
    /// needs it
    pub resolver: Option<ResolverConfig>,
    pub surrogate: SurrogateConfig,
    pub run_id: String,
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .with_context(|| format!("Invalid value for {}", key))
}

impl ReplayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolver settings. Fails when the nearest-match bound was not
    /// configured, since it has no default.
    pub fn resolver_config(&self) -> Result<&ResolverConfig> {
        self.resolver
            .as_ref()
            .context("REPLAY_MAX_NEAREST_DISTANCE_SECS not set (required to resolve decisions)")
    }

    /// Build from any key lookup (the process environment in production).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let resolver = match get("REPLAY_MAX_NEAREST_DISTANCE_SECS") {
            Some(raw) => {
                let max_nearest_distance_secs: i64 = raw
                    .parse()
                    .context("Invalid value for REPLAY_MAX_NEAREST_DISTANCE_SECS")?;
                if max_nearest_distance_secs < 0 {
                    bail!("REPLAY_MAX_NEAREST_DISTANCE_SECS must be >= 0");
                }
                Some(ResolverConfig {
                    max_nearest_distance_secs,
                    timeout: Duration::from_millis(parse_or(
                        &get,
                        "REPLAY_RESOLVE_TIMEOUT_MS",
                        "5000",
                    )?),
                    storage_retries: parse_or(&get, "REPLAY_STORAGE_RETRIES", "2")?,
                    retry_backoff: Duration::from_millis(parse_or(
                        &get,
                        "REPLAY_STORAGE_RETRY_BACKOFF_MS",
                        "50",
                    )?),
                })
            }
            None => None,
        };

        let index = IndexConfig {
            mode: parse_or::<IndexMode>(&get, "REPLAY_INDEX_MODE", "backtest")?,
            live_ttl: Duration::from_secs(parse_or(&get, "REPLAY_INDEX_LIVE_TTL_SECS", "5")?),
            backtest_ttl: Duration::from_secs(parse_or(
                &get,
                "REPLAY_INDEX_BACKTEST_TTL_SECS",
                "300",
            )?),
            max_entries: parse_or(&get, "REPLAY_INDEX_MAX_ENTRIES", "100000")?,
        };

        let index_backend: IndexBackend = get("REPLAY_INDEX_BACKEND")
            .unwrap_or_else(|| "memory".to_string())
            .parse()?;

        let surrogate = match get("REPLAY_SURROGATE")
            .unwrap_or_else(|| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => SurrogateConfig::None,
            "rules" => SurrogateConfig::Rules,
            "linear" => SurrogateConfig::Linear {
                model_path: get("REPLAY_SURROGATE_MODEL_PATH")
                    .context("REPLAY_SURROGATE_MODEL_PATH not set (required for linear surrogate)")?,
            },
            "http" => {
                let url = get("REPLAY_SURROGATE_URL")
                    .context("REPLAY_SURROGATE_URL not set (required for http surrogate)")?;
                SurrogateConfig::Http {
                    model_version: get("REPLAY_SURROGATE_VERSION")
                        .unwrap_or_else(|| format!("http:{}", url)),
                    url,
                    timeout: Duration::from_millis(parse_or(
                        &get,
                        "REPLAY_SURROGATE_TIMEOUT_MS",
                        "2000",
                    )?),
                }
            }
            other => bail!(
                "Invalid REPLAY_SURROGATE: {} (expected none|rules|linear|http)",
                other
            ),
        };

        Ok(Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:replay.db?mode=rwc".to_string()),
            index_backend,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
            index,
            resolver,
            surrogate,
            run_id: get("REPLAY_RUN_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        })
    }
}
