use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use replay_core::{IndexKey, InferenceRecord, LookupIndex, ReplayError, ReplayResult};

use crate::config::IndexConfig;

const KEY_PREFIX: &str = "replay:idx";

fn cache_err(e: redis::RedisError) -> ReplayError {
    ReplayError::StorageUnavailable(format!("redis: {}", e))
}

/// Shared lookup index in Redis. Values are JSON-encoded records stored
/// with `SETEX`, so expiry is enforced server-side.
#[derive(Clone)]
pub struct RedisIndex {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisIndex {
    pub async fn connect(redis_url: &str, config: &IndexConfig) -> ReplayResult<Self> {
        let client = Client::open(redis_url).map_err(cache_err)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_err)?;

        tracing::info!("Connected to Redis lookup index ({} mode)", config.mode);

        Ok(Self {
            conn,
            ttl: config.ttl(),
        })
    }

    fn redis_key(key: &IndexKey) -> String {
        format!("{}:{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl LookupIndex for RedisIndex {
    async fn get(&self, key: &IndexKey) -> ReplayResult<Option<InferenceRecord>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(Self::redis_key(key)).await.map_err(cache_err)?;

        match data {
            Some(json) => match serde_json::from_str(&json) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    // A cache entry is disposable; fall through to the store
                    tracing::warn!("Dropping undecodable index entry {}: {}", key, e);
                    let _: () = conn.del(Self::redis_key(key)).await.map_err(cache_err)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn put(&self, key: IndexKey, record: InferenceRecord) -> ReplayResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&record)?;
        let ttl_secs = self.ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(Self::redis_key(&key), json, ttl_secs)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn invalidate(&self, key: &IndexKey) -> ReplayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::redis_key(key)).await.map_err(cache_err)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
