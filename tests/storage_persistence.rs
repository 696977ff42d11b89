//! Cross-component storage tests: event pagination semantics, idempotent
//! event emission, and feeding stored history into the timeline aggregator.

mod helpers;

use helpers::{create_sqlite_store, create_test_record};
use pretty_assertions::assert_eq;
use relay_pulse::storage::{EventFilter, ProbeStore};
use relay_pulse::timeline::{TimelineParams, aggregate_records};
use relay_pulse::{EventType, MonitorKey, ProbeStatus, StatusEvent};

fn down_event(key: &MonitorKey, trigger: i64) -> StatusEvent {
    StatusEvent {
        id: 0,
        key: key.clone(),
        event_type: EventType::Down,
        from_status: 1,
        to_status: 0,
        trigger_record_id: trigger,
        observed_at: 1_700_000_000 + trigger,
        created_at: 1_700_000_000 + trigger,
        meta: serde_json::json!({}),
    }
}

#[tokio::test]
async fn test_event_reads_are_monotonic_suffixes() {
    let (_dir, store) = create_sqlite_store().await;
    let key = MonitorKey::new("acme", "chat", "eu", "m1");

    for trigger in 1..=10 {
        assert!(store.save_status_event(&down_event(&key, trigger)).await.unwrap());
    }

    let all = store
        .get_status_events(0, 100, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 10);

    // ids are strictly ascending
    for pair in all.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }

    // a read from a later cursor is a suffix of the earlier read
    let since_a = all[2].id;
    let since_b = all[5].id;
    let from_a = store
        .get_status_events(since_a, 100, &EventFilter::default())
        .await
        .unwrap();
    let from_b = store
        .get_status_events(since_b, 100, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(from_a[from_a.len() - from_b.len()..], from_b[..]);
}

#[tokio::test]
async fn test_duplicate_event_leaves_table_unchanged() {
    let (_dir, store) = create_sqlite_store().await;
    let key = MonitorKey::new("acme", "chat", "eu", "m1");

    assert!(store.save_status_event(&down_event(&key, 7)).await.unwrap());
    let before = store
        .get_status_events(0, 100, &EventFilter::default())
        .await
        .unwrap();

    assert!(!store.save_status_event(&down_event(&key, 7)).await.unwrap());
    let after = store
        .get_status_events(0, 100, &EventFilter::default())
        .await
        .unwrap();

    assert_eq!(before, after);
}

#[tokio::test]
async fn test_stored_history_feeds_the_timeline() {
    let (_dir, store) = create_sqlite_store().await;
    let key = MonitorKey::new("acme", "chat", "", "m1");

    // bucket window [1000, 1600), 6 buckets of 100s
    for (status, timestamp) in [
        (ProbeStatus::Green, 1_010),
        (ProbeStatus::Green, 1_050),
        (ProbeStatus::Red, 1_150),
        (ProbeStatus::Yellow, 1_250),
        (ProbeStatus::Green, 1_590),
    ] {
        store
            .save_record(&create_test_record(&key, status, timestamp))
            .await
            .unwrap();
    }

    let history = store.get_history(&key, 1_000).await.unwrap();
    let params = TimelineParams {
        since: 1_000,
        end_time: 1_600,
        bucket_count: 6,
        bucket_window: 100,
        time_filter: None,
        degraded_weight: 0.7,
    };
    let points = aggregate_records(&history, &params);

    assert_eq!(points.len(), 6);
    assert_eq!(points[0].status, 1);
    assert_eq!(points[0].status_counts.available, 2);
    assert_eq!(points[1].status, 0);
    assert_eq!(points[1].status_counts.unavailable, 1);
    assert_eq!(points[2].status, 2);
    assert!((points[2].availability - 70.0).abs() < 1e-9);
    assert_eq!(points[3].status, -1);
    assert_eq!(points[5].status, 1);
}

#[tokio::test]
async fn test_batch_history_matches_per_key_reads() {
    let (_dir, store) = create_sqlite_store().await;
    let keys: Vec<MonitorKey> = (1..=3)
        .map(|i| MonitorKey::new("acme", "chat", "", format!("m{i}")))
        .collect();

    for (offset, key) in keys.iter().enumerate() {
        for t in 0..(offset + 2) {
            store
                .save_record(&create_test_record(
                    key,
                    ProbeStatus::Green,
                    1_000 + t as i64,
                ))
                .await
                .unwrap();
        }
    }

    let batch = store.get_history_batch(&keys, 0).await.unwrap();
    for key in &keys {
        let single = store.get_history(key, 0).await.unwrap();
        assert_eq!(batch[key], single, "mismatch for {key}");
    }
}
