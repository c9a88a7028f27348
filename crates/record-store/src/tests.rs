#[cfg(test)]
mod record_store_tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use futures_util::StreamExt;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use replay_core::{
        verify_chain, Action, Decision, DecisionPayload, Fingerprint, InferenceRecord,
        PartitionKey, Provenance, PutOutcome, RecordStatus, RecordStore, ReplayError, ReplayLog,
        ReplayLogEntry,
    };

    use crate::{
        export_range, import_records, read_records, MemoryRecordStore, MemoryReplayLog,
        SqlRecordStore, SqlReplayLog,
    };

    const PAIR: &str = "BTC/USDT";
    const TF: &str = "15m";

    fn fp(c: char) -> Fingerprint {
        c.to_string().repeat(64).parse().unwrap()
    }

    fn record(request_id: &str, hash: char, ts: i64, action: Action) -> InferenceRecord {
        let payload = DecisionPayload::new(action, 0.7, format!("{} at {}", action, ts));
        InferenceRecord {
            request_id: request_id.to_string(),
            timestamp: ts,
            input_hash: fp(hash),
            pair: PAIR.to_string(),
            timeframe: TF.to_string(),
            prompt: "prompt".to_string(),
            response_hash: Some(payload.response_hash().unwrap()),
            response: Some(payload),
            model_name: "test-model".to_string(),
            temperature: 0.0,
            status: RecordStatus::Ok,
            error: None,
            tokens_in: Some(120),
            tokens_out: Some(40),
            latency_ms: Some(850),
            meta: Default::default(),
        }
    }

    fn failed(request_id: &str, hash: char, ts: i64) -> InferenceRecord {
        InferenceRecord {
            response: None,
            response_hash: None,
            status: RecordStatus::Timeout,
            error: Some("upstream timeout".to_string()),
            ..record(request_id, hash, ts, Action::Hold)
        }
    }

    /// Records whose confidences use the full f64 mantissa.
    fn random_confidence_records(n: usize) -> Vec<InferenceRecord> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|i| {
                let mut r = record(&format!("f{}", i), 'a', i as i64, Action::Buy);
                let payload = DecisionPayload::new(Action::Buy, rng.gen_range(0.0..=1.0), "float");
                r.response_hash = Some(payload.response_hash().unwrap());
                r.response = Some(payload);
                r
            })
            .collect()
    }

    async fn sql_store() -> SqlRecordStore {
        SqlRecordStore::connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite")
    }

    async fn most_recent_wins(store: &dyn RecordStore) {
        store.put(record("r1", 'a', 1000, Action::Buy)).await.unwrap();
        store.put(record("r2", 'a', 2000, Action::Sell)).await.unwrap();
        // Same timestamp as r2, inserted later
        store.put(record("r3", 'a', 2000, Action::Hold)).await.unwrap();

        let found = store
            .get_by_fingerprint(&fp('a'), PAIR, TF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, "r3");

        let other_partition = store.get_by_fingerprint(&fp('a'), PAIR, "1h").await.unwrap();
        assert!(other_partition.is_none());
    }

    async fn nearest_picks_closest_usable(store: &dyn RecordStore) {
        store.put(record("n1", 'a', 100, Action::Buy)).await.unwrap();
        store.put(record("n2", 'b', 200, Action::Hold)).await.unwrap();
        store.put(record("n3", 'c', 400, Action::Sell)).await.unwrap();
        // Closer to 260 but unusable
        store.put(failed("n4", 'd', 260)).await.unwrap();

        let found = store
            .find_nearest(&fp('f'), PAIR, TF, 250)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, "n2");

        let found = store
            .find_nearest(&fp('f'), PAIR, TF, 390)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, "n3");

        let none = store.find_nearest(&fp('f'), "ETH/USDT", TF, 250).await.unwrap();
        assert!(none.is_none());
    }

    async fn nearest_tie_prefers_latest_insert(store: &dyn RecordStore) {
        store.put(record("t1", 'a', 100, Action::Buy)).await.unwrap();
        store.put(record("t2", 'b', 300, Action::Sell)).await.unwrap();

        let found = store
            .find_nearest(&fp('f'), PAIR, TF, 200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, "t2");
    }

    async fn put_is_idempotent(store: &dyn RecordStore) {
        let r = record("dup", 'a', 1000, Action::Buy);
        assert_eq!(store.put(r.clone()).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(r).await.unwrap(), PutOutcome::AlreadyPresent);

        let err = store
            .put(record("dup", 'a', 1000, Action::Sell))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::DuplicateKey(_)));

        let stored = store.get_by_request_id("dup").await.unwrap().unwrap();
        assert_eq!(stored.response.unwrap().action, Action::Buy);
    }

    async fn range_is_ascending_and_bounded(store: &dyn RecordStore) {
        for (i, ts) in [500, 100, 300, 200, 400].iter().enumerate() {
            store
                .put(record(&format!("q{}", i), 'a', *ts, Action::Hold))
                .await
                .unwrap();
        }

        let got: Vec<i64> = store
            .range_query(PAIR, TF, 200, 400)
            .map(|r| r.unwrap().timestamp)
            .collect()
            .await;
        assert_eq!(got, vec![200, 300, 400]);

        // A second pass starts fresh
        let again = store.range_query(PAIR, TF, 200, 400).count().await;
        assert_eq!(again, 3);

        let empty = store.range_query(PAIR, TF, 400, 200).count().await;
        assert_eq!(empty, 0);
    }

    async fn capture_trail_is_chained(store: &dyn RecordStore) {
        store.put(record("c1", 'a', 1, Action::Buy)).await.unwrap();
        store.put(record("c2", 'b', 2, Action::Sell)).await.unwrap();
        store.put(record("c3", 'c', 3, Action::Hold)).await.unwrap();
        // No trail entry for an ignored re-capture
        store.put(record("c3", 'c', 3, Action::Hold)).await.unwrap();

        let trail = store
            .capture_trail(&PartitionKey::new(PAIR, TF))
            .await
            .unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].request_id, "c1");

        let verification = verify_chain(&trail);
        assert!(verification.is_valid, "{}", verification.message);
        assert_eq!(verification.total_entries, 3);

        assert_eq!(
            store.partitions().await.unwrap(),
            vec![PartitionKey::new(PAIR, TF)]
        );
    }

    #[tokio::test]
    async fn test_memory_most_recent_wins() {
        most_recent_wins(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_most_recent_wins() {
        most_recent_wins(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_memory_nearest() {
        let store = MemoryRecordStore::new();
        nearest_picks_closest_usable(&store).await;
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_sql_nearest() {
        nearest_picks_closest_usable(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_memory_nearest_tie() {
        nearest_tie_prefers_latest_insert(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_nearest_tie() {
        nearest_tie_prefers_latest_insert(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_memory_put_idempotent() {
        put_is_idempotent(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_put_idempotent() {
        put_is_idempotent(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_memory_range() {
        range_is_ascending_and_bounded(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_range() {
        range_is_ascending_and_bounded(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_memory_capture_trail() {
        capture_trail_is_chained(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_capture_trail() {
        capture_trail_is_chained(&sql_store().await).await;
    }

    #[tokio::test]
    async fn test_sql_round_trips_optional_fields() {
        let store = sql_store().await;
        let mut r = record("meta", 'a', 42, Action::Buy);
        r.meta.insert("prompt_version".to_string(), serde_json::json!("v3"));
        r.temperature = 0.2;
        store.put(r.clone()).await.unwrap();

        let failed_record = failed("failed", 'b', 43);
        store.put(failed_record.clone()).await.unwrap();

        assert_eq!(store.get_by_request_id("meta").await.unwrap(), Some(r));
        assert_eq!(
            store.get_by_request_id("failed").await.unwrap(),
            Some(failed_record)
        );
        assert!(store.get_by_request_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sql_corrupt_row_surfaces() {
        let store = sql_store().await;
        sqlx::query(
            "INSERT INTO inference_records (request_id, timestamp, input_hash, pair, timeframe,
                prompt, response, model_name, status)
             VALUES ('bad', 1, 'not-a-hash', 'BTC/USDT', '15m', 'p', NULL, 'm', 'ok')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get_by_request_id("bad").await.unwrap_err();
        assert!(matches!(err, ReplayError::CorruptRecord(_)));
    }

    #[tokio::test]
    async fn test_ndjson_export_then_import() {
        let source = MemoryRecordStore::new();
        for (i, ts) in [10, 20, 30].iter().enumerate() {
            source
                .put(record(&format!("e{}", i), 'a', *ts, Action::Buy))
                .await
                .unwrap();
        }
        source.put(failed("e-failed", 'b', 25)).await.unwrap();

        let mut buf = Vec::new();
        let written = export_range(&source, PAIR, TF, 0, 100, &mut buf).await.unwrap();
        assert_eq!(written, 4);

        let target = sql_store().await;
        let summary = import_records(&target, Cursor::new(&buf)).await.unwrap();
        assert_eq!(summary.inserted, 4);

        let again = import_records(&target, Cursor::new(&buf)).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_present, 4);

        let replayed = target
            .get_by_fingerprint(&fp('a'), PAIR, TF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.request_id, "e2");
    }

    #[tokio::test]
    async fn test_ndjson_preserves_confidence_bits() {
        let records = random_confidence_records(500);
        let source = MemoryRecordStore::new();
        for r in &records {
            source.put(r.clone()).await.unwrap();
        }

        let mut buf = Vec::new();
        export_range(&source, PAIR, TF, i64::MIN, i64::MAX, &mut buf)
            .await
            .unwrap();

        // Parsing re-verifies every response hash
        let parsed = read_records(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, records);

        let target = MemoryRecordStore::new();
        let summary = import_records(&target, Cursor::new(&buf)).await.unwrap();
        assert_eq!(summary.inserted, 500);

        // Importing the same dump into a store that already holds it is a no-op
        let again = import_records(&source, Cursor::new(&buf)).await.unwrap();
        assert_eq!(again.already_present, 500);
    }

    #[tokio::test]
    async fn test_sql_recapture_preserves_confidence_bits() {
        let store = sql_store().await;
        let records = random_confidence_records(200);
        for r in &records {
            assert_eq!(store.put(r.clone()).await.unwrap(), PutOutcome::Inserted);
        }

        for r in &records {
            assert_eq!(store.put(r.clone()).await.unwrap(), PutOutcome::AlreadyPresent);

            let stored = store.get_by_request_id(&r.request_id).await.unwrap().unwrap();
            let want = r.response.as_ref().unwrap().confidence;
            let got = stored.response.as_ref().unwrap().confidence;
            assert_eq!(got.to_bits(), want.to_bits());
            assert_eq!(&stored, r);
        }
    }

    /// Writers on separate partitions interleaved with readers.
    async fn concurrent_partitions(store: Arc<dyn RecordStore>) {
        let pairs = ["BTC/USDT", "ETH/USDT", "SOL/USDT", "ADA/USDT"];

        let mut tasks = Vec::new();
        for (p, pair) in pairs.iter().enumerate() {
            for i in 0..10i64 {
                let store = store.clone();
                let mut r = record(&format!("{}-{}", pair, i), 'a', i * 60, Action::Buy);
                r.pair = pair.to_string();
                tasks.push(tokio::spawn(async move {
                    store.put(r).await.unwrap();
                    // A write is visible to its own task immediately
                    let seen = store.get_by_fingerprint(&fp('a'), pairs[p], TF).await.unwrap();
                    assert!(seen.is_some_and(|s| s.pair == pairs[p]));
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        for pair in pairs {
            let latest = store
                .get_by_fingerprint(&fp('a'), pair, TF)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(latest.request_id, format!("{}-9", pair));

            let trail = store.capture_trail(&PartitionKey::new(pair, TF)).await.unwrap();
            assert_eq!(trail.len(), 10);
            assert!(verify_chain(&trail).is_valid);
        }
        assert_eq!(store.partitions().await.unwrap().len(), pairs.len());
    }

    /// Concurrent captures of one fingerprint at one timestamp: the winner is
    /// whichever was inserted last, and the chain still verifies.
    async fn concurrent_same_partition(store: Arc<dyn RecordStore>) {
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let action = if i % 2 == 0 { Action::Buy } else { Action::Sell };
                store
                    .put(record(&format!("s{}", i), 'a', 5000, action))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), PutOutcome::Inserted);
        }

        let ordered: Vec<InferenceRecord> = store
            .range_query(PAIR, TF, 5000, 5000)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(ordered.len(), 20);

        let latest = store
            .get_by_fingerprint(&fp('a'), PAIR, TF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(&latest), ordered.last());

        let trail = store.capture_trail(&PartitionKey::new(PAIR, TF)).await.unwrap();
        assert_eq!(trail.len(), 20);
        let verification = verify_chain(&trail);
        assert!(verification.is_valid, "{}", verification.message);
        assert_eq!(trail.last().unwrap().request_id, latest.request_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_partitions() {
        concurrent_partitions(Arc::new(MemoryRecordStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sql_concurrent_partitions() {
        concurrent_partitions(Arc::new(sql_store().await)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_same_partition() {
        concurrent_same_partition(Arc::new(MemoryRecordStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sql_concurrent_same_partition() {
        concurrent_same_partition(Arc::new(sql_store().await)).await;
    }

    #[test]
    fn test_ndjson_rejects_tampered_response() {
        let mut r = record("tampered", 'a', 1, Action::Buy);
        if let Some(payload) = r.response.as_mut() {
            payload.action = Action::Sell;
        }
        let line = serde_json::to_string(&r).unwrap();
        let input = format!("\n{}\n", line);

        let err = read_records(Cursor::new(input)).unwrap_err();
        match err {
            ReplayError::CorruptRecord(msg) => assert!(msg.starts_with("line 2")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_ndjson_rejects_malformed_json() {
        let err = read_records(Cursor::new("{not json}\n")).unwrap_err();
        assert!(matches!(err, ReplayError::CorruptRecord(_)));
    }

    fn log_entry(run_id: &str, request_id: &str, provenance: Provenance) -> ReplayLogEntry {
        let decision = match provenance {
            Provenance::Default => Decision::default_hold(),
            other => Decision::from_payload(
                DecisionPayload::new(Action::Buy, 0.8, "replayed"),
                other,
            ),
        };
        ReplayLogEntry {
            run_id: run_id.to_string(),
            request_id: request_id.to_string(),
            pair: PAIR.to_string(),
            timeframe: TF.to_string(),
            input_hash: fp('a'),
            timestamp: 1000,
            decision,
            matched_request_id: None,
            distance_secs: None,
            surrogate_version: None,
            resolved_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    async fn replay_log_policy(log: &dyn ReplayLog) {
        let first = log_entry("run-1", "q1", Provenance::Exact);
        assert_eq!(log.append(first.clone()).await.unwrap(), PutOutcome::Inserted);

        // Only the wall-clock stamp differs: no-op
        let mut same = first.clone();
        same.resolved_at = "2026-01-02T00:00:00Z".to_string();
        assert_eq!(log.append(same).await.unwrap(), PutOutcome::AlreadyPresent);

        let err = log
            .append(log_entry("run-1", "q1", Provenance::Default))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::DuplicateKey(_)));

        log.append(log_entry("run-1", "q2", Provenance::Default))
            .await
            .unwrap();
        log.append(log_entry("run-2", "q1", Provenance::Default))
            .await
            .unwrap();

        let entries = log.run_entries("run-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence_number, 1);
        assert_eq!(entries[1].entry.request_id, "q2");
        assert!(verify_chain(&entries).is_valid);

        let stored = log.entry_for_request("run-1", "q1").await.unwrap().unwrap();
        assert_eq!(stored.entry.resolved_at, first.resolved_at);
        assert!(log.entry_for_request("run-3", "q1").await.unwrap().is_none());

        assert_eq!(log.runs().await.unwrap(), vec!["run-1", "run-2"]);
    }

    #[tokio::test]
    async fn test_memory_replay_log_policy() {
        replay_log_policy(&MemoryReplayLog::new()).await;
    }

    #[tokio::test]
    async fn test_sql_replay_log_policy() {
        let store = sql_store().await;
        let log = SqlReplayLog::from_pool(store.pool().clone()).await.unwrap();
        replay_log_policy(&log).await;

        let counts = log.action_counts("run-1").await.unwrap();
        assert_eq!(counts, vec![(Action::Buy, 1), (Action::Hold, 1)]);
    }
}
