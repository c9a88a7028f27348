use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use replay_core::{IndexKey, InferenceRecord, LookupIndex, ReplayResult};

use crate::config::IndexConfig;

struct CacheEntry {
    record: InferenceRecord,
    cached_at: DateTime<Utc>,
    /// Insertion order; breaks `cached_at` ties when evicting
    seq: u64,
}

/// In-process lookup index backed by `DashMap`.
///
/// When full, the oldest tenth of the entries is evicted in one pass, so the
/// scan is paid once per batch rather than on every insert.
pub struct MemoryIndex {
    entries: DashMap<IndexKey, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    next_seq: AtomicU64,
}

impl MemoryIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_std(config.ttl()).unwrap_or_else(|_| Duration::days(36_500)),
            max_entries: config.max_entries.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at < self.ttl
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.cached_at < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!("Lookup index purged {} expired entries", removed);
        }
        removed
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }

        let batch = (self.max_entries / 10).max(1);
        let excess = (self.entries.len() + 1).saturating_sub(self.max_entries);
        let mut by_age: Vec<(u64, IndexKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        let evict = (excess + batch - 1).min(by_age.len());
        if evict < by_age.len() {
            by_age.select_nth_unstable_by_key(evict, |(seq, _)| *seq);
        }
        for (_, key) in by_age.into_iter().take(evict) {
            self.entries.remove(&key);
        }
        tracing::debug!("Lookup index full, evicted {} oldest entries", evict);
    }
}

#[async_trait]
impl LookupIndex for MemoryIndex {
    async fn get(&self, key: &IndexKey) -> ReplayResult<Option<InferenceRecord>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if self.is_fresh(&entry, now) {
                return Ok(Some(entry.record.clone()));
            }
        }
        // Expired entries behave as absent
        self.entries.remove_if(key, |_, entry| !self.is_fresh(entry, now));
        Ok(None)
    }

    async fn put(&self, key: IndexKey, record: InferenceRecord) -> ReplayResult<()> {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            CacheEntry {
                record,
                cached_at: Utc::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &IndexKey) -> ReplayResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexMode;
    use replay_core::{Action, DecisionPayload, Fingerprint, RecordStatus};

    fn key(c: char) -> IndexKey {
        let fp: Fingerprint = c.to_string().repeat(64).parse().unwrap();
        IndexKey::new(fp, "BTC/USDT", "15m")
    }

    fn record(request_id: &str) -> InferenceRecord {
        let payload = DecisionPayload::new(Action::Buy, 0.6, "cached");
        InferenceRecord {
            request_id: request_id.to_string(),
            timestamp: 1000,
            input_hash: key('a').input_hash,
            pair: "BTC/USDT".to_string(),
            timeframe: "15m".to_string(),
            prompt: String::new(),
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

    #[tokio::test]
    async fn test_get_put_invalidate() {
        let index = MemoryIndex::new(&IndexConfig::default());
        assert!(index.get(&key('a')).await.unwrap().is_none());

        index.put(key('a'), record("r1")).await.unwrap();
        let hit = index.get(&key('a')).await.unwrap().unwrap();
        assert_eq!(hit.request_id, "r1");

        index.invalidate(&key('a')).await.unwrap();
        assert!(index.get(&key('a')).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let config = IndexConfig {
            live_ttl: std::time::Duration::ZERO,
            ..IndexConfig::with_mode(IndexMode::Live)
        };
        let index = MemoryIndex::new(&config);
        index.put(key('a'), record("r1")).await.unwrap();

        assert!(index.get(&key('a')).await.unwrap().is_none());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let config = IndexConfig {
            max_entries: 2,
            ..IndexConfig::default()
        };
        let index = MemoryIndex::new(&config);
        index.put(key('a'), record("r1")).await.unwrap();
        index.put(key('b'), record("r2")).await.unwrap();
        index.put(key('c'), record("r3")).await.unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.get(&key('c')).await.unwrap().is_some());
    }

    fn numbered_key(n: u64) -> IndexKey {
        let fp: Fingerprint = format!("{:064x}", n).parse().unwrap();
        IndexKey::new(fp, "BTC/USDT", "15m")
    }

    #[tokio::test]
    async fn test_full_index_evicts_in_batches() {
        let config = IndexConfig {
            max_entries: 20,
            ..IndexConfig::default()
        };
        let index = MemoryIndex::new(&config);
        for n in 0..21 {
            index
                .put(numbered_key(n), record(&format!("r{}", n)))
                .await
                .unwrap();
        }

        // The 21st insert evicted the two oldest entries at once
        assert_eq!(index.len(), 19);
        assert!(index.get(&numbered_key(0)).await.unwrap().is_none());
        assert!(index.get(&numbered_key(1)).await.unwrap().is_none());
        assert!(index.get(&numbered_key(2)).await.unwrap().is_some());
        assert!(index.get(&numbered_key(20)).await.unwrap().is_some());

        // Room is left for the next insert without another scan
        index.put(numbered_key(21), record("r21")).await.unwrap();
        assert_eq!(index.len(), 20);

        // Overwriting a cached key never evicts
        index.put(numbered_key(21), record("r21b")).await.unwrap();
        assert_eq!(index.len(), 20);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let config = IndexConfig {
            backtest_ttl: std::time::Duration::ZERO,
            ..IndexConfig::default()
        };
        let index = MemoryIndex::new(&config);
        index.put(key('a'), record("r1")).await.unwrap();
        index.put(key('b'), record("r2")).await.unwrap();
        assert_eq!(index.purge_expired(), 2);
    }
}
