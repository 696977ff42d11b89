//! Test helpers shared by the integration tests

use std::sync::Arc;
use std::time::Duration;

use relay_pulse::config::MonitorDef;
use relay_pulse::storage::SqliteStore;
use relay_pulse::{MonitorKey, ProbeRecord, ProbeStatus, SubStatus};

/// Create a MonitorDef pointing at a test URL with sensible defaults
pub fn create_test_monitor(url: &str) -> MonitorDef {
    MonitorDef {
        key: MonitorKey::new("acme", "chat", "", "test-model"),
        url: url.to_string(),
        method: "GET".to_string(),
        headers: Vec::new(),
        body: String::new(),
        success_contains: String::new(),
        api_key: None,
        interval: Duration::from_secs(60),
        slow_latency: Duration::from_millis(5_000),
        timeout: Duration::from_secs(10),
        disabled: false,
        cold: false,
        parent: String::new(),
    }
}

/// Variant with a POST body, API key header template and content check
pub fn create_chat_probe_monitor(url: &str, success_contains: &str) -> MonitorDef {
    let mut monitor = create_test_monitor(url);
    monitor.method = "POST".to_string();
    monitor.headers = vec![
        ("content-type".to_string(), "application/json".to_string()),
        ("x-api-key".to_string(), "{{API_KEY}}".to_string()),
    ];
    monitor.body = r#"{"model":"test-model","messages":[{"role":"user","content":"ping"}]}"#
        .to_string();
    monitor.success_contains = success_contains.to_string();
    monitor.api_key = Some("sk-test-123".to_string());
    monitor
}

/// Create a ProbeRecord for direct store insertion
pub fn create_test_record(
    key: &MonitorKey,
    status: ProbeStatus,
    timestamp: i64,
) -> ProbeRecord {
    ProbeRecord {
        id: 0,
        key: key.clone(),
        status,
        sub_status: match status {
            ProbeStatus::Green => SubStatus::None,
            ProbeStatus::Yellow => SubStatus::SlowLatency,
            ProbeStatus::Red => SubStatus::ServerError,
        },
        http_code: match status {
            ProbeStatus::Red => 500,
            _ => 200,
        },
        latency_ms: 150,
        timestamp,
    }
}

/// Open a fresh SQLite store inside a temp directory
pub async fn create_sqlite_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteStore::new(dir.path().join("test.db"), 5)
        .await
        .expect("sqlite store");
    (dir, Arc::new(store))
}
