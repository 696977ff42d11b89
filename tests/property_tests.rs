//! Property-based tests for invariants using proptest
//!
//! These verify properties that must hold for all inputs:
//! - the persisted event state matches the pure hysteresis reducer, even
//!   when records for different keys interleave
//! - emitted edges strictly alternate DOWN/UP
//! - timeline aggregation is invariant under row insertion order
//! - DB-style pre-aggregated rows and raw rows produce the same timeline

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use relay_pulse::events::{EventPolicy, EventService, reduce};
use relay_pulse::storage::{ProbeStore, SqliteStore};
use relay_pulse::timeline::{
    TimelineAggBatch, TimelineAggRow, TimelineLatestRow, TimelineParams, aggregate_batch,
    aggregate_records,
};
use relay_pulse::{
    EventType, MonitorKey, ProbeRecord, ProbeStatus, ServiceState, SubStatus,
};

fn params() -> TimelineParams {
    TimelineParams {
        since: 1_000,
        end_time: 1_600,
        bucket_count: 6,
        bucket_window: 100,
        time_filter: None,
        degraded_weight: 0.7,
    }
}

fn build_record(id: i64, timestamp: i64, status_code: u8, latency_ms: i64) -> ProbeRecord {
    let status = ProbeStatus::from_code(status_code as i64).unwrap();
    ProbeRecord {
        id,
        key: MonitorKey::new("acme", "chat", "", "m1"),
        status,
        sub_status: match status {
            ProbeStatus::Green => SubStatus::None,
            ProbeStatus::Yellow => SubStatus::SlowLatency,
            ProbeStatus::Red => SubStatus::AuthError,
        },
        http_code: match status {
            ProbeStatus::Red => 401,
            _ => 200,
        },
        latency_ms,
        timestamp,
    }
}

fn record_strategy() -> impl Strategy<Value = (i64, u8, i64)> {
    // timestamps straddle the window boundaries on purpose
    (900i64..1_700, 0u8..3, 0i64..10_000)
}

// Property: reducer state stays well-formed and edges alternate
proptest! {
    #[test]
    fn prop_reducer_edges_alternate(
        observations in prop::collection::vec(prop::bool::ANY, 1..60),
        down_threshold in 1i64..4,
        up_threshold in 1i64..4,
    ) {
        let key = MonitorKey::new("acme", "chat", "", "m1");
        let mut state = ServiceState::uninitialised(key);
        let mut edges = Vec::new();

        for &available in &observations {
            let (next, edge) = reduce(&state, available, down_threshold, up_threshold);
            state = next;

            prop_assert!(state.stable_available == 0 || state.stable_available == 1);
            prop_assert!(state.streak_count < down_threshold.max(up_threshold));

            if let Some(edge) = edge {
                prop_assert_eq!(i64::from(edge.event_type == EventType::Up), state.stable_available);
                edges.push(edge);
            }
        }

        for pair in edges.windows(2) {
            prop_assert_ne!(pair[0].event_type, pair[1].event_type);
        }
    }
}

// Property: a DOWN edge requires down_threshold consecutive unavailable
// observations right before it
proptest! {
    #[test]
    fn prop_down_requires_consecutive_failures(
        observations in prop::collection::vec(prop::bool::ANY, 1..60),
        down_threshold in 1i64..4,
    ) {
        let key = MonitorKey::new("acme", "chat", "", "m1");
        let mut state = ServiceState::uninitialised(key);

        for (index, &available) in observations.iter().enumerate() {
            let (next, edge) = reduce(&state, available, down_threshold, 1);
            state = next;

            if edge.map(|e| e.event_type) == Some(EventType::Down) {
                let window = &observations[index + 1 - down_threshold as usize..=index];
                prop_assert!(window.iter().all(|&a| !a));
            }
        }
    }
}

// Property 1: persisted state equals the pure reducer folded per key, no
// matter how records interleave across keys
proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]
    #[test]
    fn prop_persisted_state_matches_pure_reducer(
        stream in prop::collection::vec((0usize..3, prop::bool::ANY), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store: Arc<dyn ProbeStore> = Arc::new(
                SqliteStore::new(dir.path().join("prop.db"), 2).await.unwrap(),
            );
            let policy = EventPolicy {
                enabled: true,
                mode: relay_pulse::config::EventMode::Model,
                down_threshold: 2,
                up_threshold: 1,
            };
            let service = EventService::new(store.clone(), policy);

            let keys: Vec<MonitorKey> = (0..3)
                .map(|i| MonitorKey::new("acme", "chat", "", format!("m{i}")))
                .collect();
            let mut expected: HashMap<MonitorKey, ServiceState> = keys
                .iter()
                .map(|key| (key.clone(), ServiceState::uninitialised(key.clone())))
                .collect();

            for (index, (key_index, available)) in stream.iter().enumerate() {
                let key = &keys[*key_index];
                let record = ProbeRecord {
                    id: index as i64 + 1,
                    key: key.clone(),
                    status: if *available {
                        ProbeStatus::Green
                    } else {
                        ProbeStatus::Red
                    },
                    sub_status: SubStatus::None,
                    http_code: 200,
                    latency_ms: 10,
                    timestamp: 1_700_000_000 + index as i64,
                };
                service.process_record(&record).await;

                let folded = reduce(&expected[key], *available, 2, 1).0;
                expected.insert(key.clone(), folded);
            }

            for key in &keys {
                let persisted = store.get_service_state(key).await.unwrap();
                let reference = &expected[key];
                if reference.last_record_id == 0 && persisted.is_none() {
                    continue; // key never observed
                }
                let persisted = persisted.unwrap();
                assert_eq!(persisted.stable_available, reference.stable_available);
                assert_eq!(persisted.streak_count, reference.streak_count);
                assert_eq!(persisted.streak_status, reference.streak_status);
            }
        });
    }
}

// Property 4: aggregation output is invariant under insertion order
proptest! {
    #[test]
    fn prop_timeline_order_invariance(
        rows in prop::collection::vec(record_strategy(), 0..50),
        rotation in 0usize..50,
    ) {
        let records: Vec<ProbeRecord> = rows
            .iter()
            .enumerate()
            .map(|(index, &(timestamp, status, latency))| {
                build_record(index as i64 + 1, timestamp, status, latency)
            })
            .collect();

        let baseline = aggregate_records(&records, &params());

        let mut reversed = records.clone();
        reversed.reverse();
        prop_assert_eq!(&aggregate_records(&reversed, &params()), &baseline);

        let mut rotated = records.clone();
        if !rotated.is_empty() {
            let pivot = rotation % rotated.len();
            rotated.rotate_left(pivot);
        }
        prop_assert_eq!(&aggregate_records(&rotated, &params()), &baseline);
    }
}

// Bucket indices stay in range and respect the strict boundaries
proptest! {
    #[test]
    fn prop_bucket_index_bounds(timestamp in 0i64..3_000) {
        let p = params();
        match p.bucket_index(timestamp) {
            Some(index) => {
                prop_assert!(index < p.bucket_count);
                prop_assert!(timestamp > p.since);
                prop_assert!(timestamp <= p.end_time);
            }
            None => {
                prop_assert!(timestamp <= p.since || timestamp > p.end_time);
            }
        }
    }
}

/// Re-group raw records the way the PostgreSQL aggregation query does.
fn group_like_database(records: &[ProbeRecord], p: &TimelineParams) -> TimelineAggBatch {
    let key = MonitorKey::new("acme", "chat", "", "m1");
    let mut groups: HashMap<(i64, i64, String, i64), (i64, i64, i64, i64)> = HashMap::new();
    let mut latest: HashMap<i64, (i64, i64, i64)> = HashMap::new();

    for record in records {
        let Some(bucket) = p.bucket_index(record.timestamp) else {
            continue;
        };
        let bucket = bucket as i64;

        let entry = groups
            .entry((
                bucket,
                record.status.code(),
                record.sub_status.as_str().to_string(),
                record.http_code as i64,
            ))
            .or_default();
        entry.0 += 1;
        entry.1 += record.latency_ms;
        if record.latency_ms > 0 {
            entry.2 += record.latency_ms;
            entry.3 += 1;
        }

        let candidate = (record.timestamp, record.id, record.status.code());
        latest
            .entry(bucket)
            .and_modify(|existing| {
                if (candidate.0, candidate.1) > (existing.0, existing.1) {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }

    TimelineAggBatch {
        groups: groups
            .into_iter()
            .map(
                |((bucket, status, sub_status, http_code), (count, latency_sum, pos_sum, pos_count))| {
                    TimelineAggRow {
                        key: key.clone(),
                        bucket,
                        status,
                        sub_status,
                        http_code,
                        count,
                        latency_sum,
                        positive_latency_sum: pos_sum,
                        positive_latency_count: pos_count,
                    }
                },
            )
            .collect(),
        latest: latest
            .into_iter()
            .map(|(bucket, (timestamp, id, status))| TimelineLatestRow {
                key: key.clone(),
                bucket,
                status,
                timestamp,
                id,
            })
            .collect(),
    }
}

// Property 5: DB-side and application-side aggregation agree to 1e-9
proptest! {
    #[test]
    fn prop_db_and_app_aggregation_agree(
        rows in prop::collection::vec(record_strategy(), 0..60),
    ) {
        let p = params();
        let key = MonitorKey::new("acme", "chat", "", "m1");
        let records: Vec<ProbeRecord> = rows
            .iter()
            .enumerate()
            .map(|(index, &(timestamp, status, latency))| {
                build_record(index as i64 + 1, timestamp, status, latency)
            })
            .collect();

        let from_records = aggregate_records(&records, &p);

        let batch = group_like_database(&records, &p);
        let from_batch = aggregate_batch(&batch, std::slice::from_ref(&key), &p)
            .remove(&key)
            .unwrap();

        prop_assert_eq!(from_records.len(), from_batch.len());
        for (a, b) in from_records.iter().zip(from_batch.iter()) {
            prop_assert_eq!(a.status, b.status);
            prop_assert_eq!(a.timestamp, b.timestamp);
            prop_assert_eq!(&a.status_counts, &b.status_counts);
            prop_assert!((a.latency - b.latency).abs() < 1e-9);
            prop_assert!((a.availability - b.availability).abs() < 1e-9);
        }
    }
}
