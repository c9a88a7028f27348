use std::sync::Arc;

use anyhow::{Context, Result};

use lookup_index::{MemoryIndex, RedisIndex};
use record_store::{SqlRecordStore, SqlReplayLog};
use replay_core::{LookupIndex, RecordStore, ReplayLog, SurrogatePredictor};
use surrogate_predictor::{HttpSurrogate, LinearSurrogate, RuleBasedSurrogate};

use crate::config::{IndexBackend, ReplayConfig, SurrogateConfig};
use crate::recorder::Recorder;
use crate::resolver::ReplayResolver;

/// Instantiate the configured surrogate, if any.
pub fn build_surrogate(config: &SurrogateConfig) -> Result<Option<Arc<dyn SurrogatePredictor>>> {
    let surrogate: Arc<dyn SurrogatePredictor> = match config {
        SurrogateConfig::None => return Ok(None),
        SurrogateConfig::Rules => Arc::new(RuleBasedSurrogate::default()),
        SurrogateConfig::Linear { model_path } => Arc::new(
            LinearSurrogate::from_path(model_path)
                .with_context(|| format!("Failed to load surrogate model {}", model_path))?,
        ),
        SurrogateConfig::Http {
            url,
            model_version,
            timeout,
        } => Arc::new(
            HttpSurrogate::new(url.clone(), model_version.clone(), *timeout)
                .context("Failed to create surrogate HTTP client")?,
        ),
    };
    Ok(Some(surrogate))
}

/// Fully wired backends for one process.
pub struct ReplayRuntime {
    pub config: ReplayConfig,
    pub store: Arc<SqlRecordStore>,
    pub replay_log: Arc<SqlReplayLog>,
    pub index: Arc<dyn LookupIndex>,
    pub surrogate: Option<Arc<dyn SurrogatePredictor>>,
}

impl ReplayRuntime {
    pub async fn open(config: ReplayConfig) -> Result<Self> {
        let store = SqlRecordStore::connect(&config.database_url)
            .await
            .with_context(|| format!("Failed to open record store at {}", config.database_url))?;
        let replay_log = SqlReplayLog::from_pool(store.pool().clone())
            .await
            .context("Failed to open replay log")?;

        let index: Arc<dyn LookupIndex> = match config.index_backend {
            IndexBackend::Memory => Arc::new(MemoryIndex::new(&config.index)),
            IndexBackend::Redis => Arc::new(
                RedisIndex::connect(&config.redis_url, &config.index)
                    .await
                    .context("Failed to connect lookup index to Redis")?,
            ),
        };

        let surrogate = build_surrogate(&config.surrogate)?;

        tracing::info!(
            "Replay runtime ready: store={} index={} ({}, ttl {:?}) surrogate={} run={}",
            store.backend_name(),
            index.backend_name(),
            config.index.mode,
            config.index.ttl(),
            config.surrogate,
            config.run_id
        );

        Ok(Self {
            config,
            store: Arc::new(store),
            replay_log: Arc::new(replay_log),
            index,
            surrogate,
        })
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(self.store.clone(), Arc::clone(&self.index))
    }

    /// Resolver logging into this runtime's run. Requires the nearest-match
    /// bound to be configured.
    pub fn resolver(&self) -> Result<ReplayResolver> {
        let config = self.config.resolver_config()?.clone();
        let log: Arc<dyn ReplayLog> = self.replay_log.clone();
        let mut resolver = ReplayResolver::new(self.store.clone(), Arc::clone(&self.index), config)
            .with_replay_log(log, self.config.run_id.clone());
        if let Some(surrogate) = &self.surrogate {
            resolver = resolver.with_surrogate(Arc::clone(surrogate));
        }
        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_surrogate() {
        assert!(build_surrogate(&SurrogateConfig::None).unwrap().is_none());

        let rules = build_surrogate(&SurrogateConfig::Rules).unwrap().unwrap();
        assert_eq!(rules.model_version(), "rules-v1");

        let missing = build_surrogate(&SurrogateConfig::Linear {
            model_path: "/nonexistent/model.json".to_string(),
        });
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_resolver_needs_nearest_bound() {
        let storage_only = ReplayConfig::from_lookup(|key: &str| match key {
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            _ => None,
        })
        .unwrap();
        let runtime = ReplayRuntime::open(storage_only).await.unwrap();
        assert!(runtime.resolver().is_err());
        assert_eq!(runtime.store.backend_name(), "sql");

        let full = ReplayConfig::from_lookup(|key: &str| match key {
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "REPLAY_MAX_NEAREST_DISTANCE_SECS" => Some("60".to_string()),
            "REPLAY_RUN_ID" => Some("bt-1".to_string()),
            _ => None,
        })
        .unwrap();
        let runtime = ReplayRuntime::open(full).await.unwrap();
        let resolver = runtime.resolver().unwrap();
        assert_eq!(resolver.run_id(), Some("bt-1"));
        assert_eq!(resolver.config().max_nearest_distance_secs, 60);
    }
}
