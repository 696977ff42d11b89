//! SQLite probe store implementation
//!
//! ## Features
//!
//! - **Embedded**: no separate database server required
//! - **WAL mode**: readers stay unblocked during probe inserts
//! - **In-place migration**: missing columns are detected and added on
//!   startup, the covering index is rebuilt, legacy primary keys are fixed
//!
//! ## Limitations
//!
//! - Single-writer: fine for the probe pipeline, which serialises writes per
//!   monitor anyway
//! - No DB-side timeline aggregation; readers fall back to raw-row
//!   aggregation (`supports_timeline_agg` returns false)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::error::{StoreError, StoreResult};
use super::schema::{event_type_lossy, status_lossy, sub_status_lossy};
use super::store::{ChannelMapping, EventFilter, ProbeStore};
use crate::{ChannelState, MonitorKey, ProbeRecord, ServiceState, StatusEvent};

const RECORD_COLUMNS: &str =
    "id, provider, service, channel, model, status, sub_status, http_code, latency, timestamp";

const STATE_COLUMNS: &str = "provider, service, channel, model, stable_available, streak_count, \
                             streak_status, last_record_id, last_timestamp";

const EVENT_COLUMNS: &str = "id, provider, service, channel, model, event_type, from_status, \
                             to_status, trigger_record_id, observed_at, created_at, meta";

/// SQLite probe store
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    max_connections: u32,
}

impl SqliteStore {
    /// Open (or create) the database file, configure WAL mode and run the
    /// in-place schema migration.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, max_connections: u32) -> StoreResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        migrate(&pool).await?;

        info!("SQLite store ready");

        Ok(Self {
            pool,
            max_connections,
        })
    }

    fn record_from_row(row: &SqliteRow) -> ProbeRecord {
        ProbeRecord {
            id: row.get("id"),
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            status: status_lossy(row.get("status")),
            sub_status: sub_status_lossy(&row.get::<String, _>("sub_status")),
            http_code: row.get::<i64, _>("http_code") as u16,
            latency_ms: row.get("latency"),
            timestamp: row.get("timestamp"),
        }
    }

    fn state_from_row(row: &SqliteRow) -> ServiceState {
        ServiceState {
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            stable_available: row.get("stable_available"),
            streak_count: row.get("streak_count"),
            streak_status: row.get("streak_status"),
            last_record_id: row.get("last_record_id"),
            last_timestamp: row.get("last_timestamp"),
        }
    }

    fn event_from_row(row: &SqliteRow) -> StatusEvent {
        StatusEvent {
            id: row.get("id"),
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            event_type: event_type_lossy(&row.get::<String, _>("event_type")),
            from_status: row.get("from_status"),
            to_status: row.get("to_status"),
            trigger_record_id: row.get("trigger_record_id"),
            observed_at: row.get("observed_at"),
            created_at: row.get("created_at"),
            meta: serde_json::from_str(&row.get::<String, _>("meta"))
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Append a `(provider, service, channel, model) IN ((?,?,?,?), ...)` clause.
fn push_key_filter(qb: &mut QueryBuilder<'_, Sqlite>, keys: &[MonitorKey]) {
    qb.push(" (provider, service, channel, model) IN (");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push("(");
        qb.push_bind(key.provider.clone());
        qb.push(", ");
        qb.push_bind(key.service.clone());
        qb.push(", ");
        qb.push_bind(key.channel.clone());
        qb.push(", ");
        qb.push_bind(key.model.clone());
        qb.push(")");
    }
    qb.push(")");
}

async fn migrate(pool: &Pool<Sqlite>) -> StoreResult<()> {
    debug!("running SQLite schema migration");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS probe_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 0,
            sub_status TEXT NOT NULL DEFAULT '',
            http_code INTEGER NOT NULL DEFAULT 0,
            latency INTEGER NOT NULL DEFAULT 0,
            timestamp BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    add_missing_columns(
        pool,
        "probe_history",
        &[
            ("channel", "TEXT NOT NULL DEFAULT ''"),
            ("model", "TEXT NOT NULL DEFAULT ''"),
            ("sub_status", "TEXT NOT NULL DEFAULT ''"),
            ("http_code", "INTEGER NOT NULL DEFAULT 0"),
        ],
    )
    .await?;

    // The covering index carries every column the 30d read path touches, so
    // those queries stay index-only.
    sqlx::query("DROP INDEX IF EXISTS idx_probe_history_lookup")
        .execute(pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_probe_history_lookup_v2
        ON probe_history (provider, service, channel, model, timestamp DESC,
                          status, sub_status, latency, id, http_code)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_states (
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            stable_available INTEGER NOT NULL DEFAULT -1,
            streak_count INTEGER NOT NULL DEFAULT 0,
            streak_status INTEGER NOT NULL DEFAULT 0,
            last_record_id BIGINT NOT NULL DEFAULT 0,
            last_timestamp BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (provider, service, channel, model)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    add_missing_columns(
        pool,
        "service_states",
        &[
            ("channel", "TEXT NOT NULL DEFAULT ''"),
            ("model", "TEXT NOT NULL DEFAULT ''"),
        ],
    )
    .await?;

    rebuild_legacy_state_pk(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_states (
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            stable_available INTEGER NOT NULL DEFAULT -1,
            down_count INTEGER NOT NULL DEFAULT 0,
            known_count INTEGER NOT NULL DEFAULT 0,
            last_record_id BIGINT NOT NULL DEFAULT 0,
            last_timestamp BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (provider, service, channel)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            event_type TEXT NOT NULL,
            from_status INTEGER NOT NULL DEFAULT -1,
            to_status INTEGER NOT NULL DEFAULT -1,
            trigger_record_id BIGINT NOT NULL DEFAULT 0,
            observed_at BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL DEFAULT 0,
            meta TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_status_events_dedup
        ON status_events (provider, service, channel, event_type, trigger_record_id)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    debug!("SQLite schema migration complete");
    Ok(())
}

/// `(name, pk_position > 0)` for every column of a table.
async fn table_columns(pool: &Pool<Sqlite>, table: &str) -> StoreResult<Vec<(String, bool)>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get::<String, _>("name"),
                row.get::<i64, _>("pk") > 0,
            )
        })
        .collect())
}

async fn add_missing_columns(
    pool: &Pool<Sqlite>,
    table: &str,
    wanted: &[(&str, &str)],
) -> StoreResult<()> {
    let existing = table_columns(pool, table).await?;

    for (name, definition) in wanted {
        if existing.iter().any(|(column, _)| column == name) {
            continue;
        }
        info!("adding missing column {table}.{name}");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {name} {definition}"))
            .execute(pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    }

    Ok(())
}

/// Databases created before per-model states keyed `service_states` on
/// `(provider, service, channel)` only. SQLite cannot alter a primary key,
/// so the table is rebuilt and the rows copied over.
async fn rebuild_legacy_state_pk(pool: &Pool<Sqlite>) -> StoreResult<()> {
    let columns = table_columns(pool, "service_states").await?;
    let model_in_pk = columns
        .iter()
        .any(|(name, in_pk)| name == "model" && *in_pk);
    if model_in_pk {
        return Ok(());
    }

    info!("rebuilding service_states primary key to include model");

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    for statement in [
        "ALTER TABLE service_states RENAME TO service_states_legacy",
        r#"
        CREATE TABLE service_states (
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            stable_available INTEGER NOT NULL DEFAULT -1,
            streak_count INTEGER NOT NULL DEFAULT 0,
            streak_status INTEGER NOT NULL DEFAULT 0,
            last_record_id BIGINT NOT NULL DEFAULT 0,
            last_timestamp BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (provider, service, channel, model)
        )
        "#,
        r#"
        INSERT OR IGNORE INTO service_states
            (provider, service, channel, model, stable_available, streak_count,
             streak_status, last_record_id, last_timestamp)
        SELECT provider, service, COALESCE(channel, ''), COALESCE(model, ''),
               stable_available, streak_count, streak_status, last_record_id, last_timestamp
        FROM service_states_legacy
        "#,
        "DROP TABLE service_states_legacy",
    ] {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    }

    tx.commit()
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    Ok(())
}

#[async_trait]
impl ProbeStore for SqliteStore {
    #[instrument(skip(self, record), fields(monitor = %record.key))]
    async fn save_record(&self, record: &ProbeRecord) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO probe_history
                (provider, service, channel, model, status, sub_status, http_code, latency, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.key.provider)
        .bind(&record.key.service)
        .bind(&record.key.channel)
        .bind(&record.key.model)
        .bind(record.status.code())
        .bind(record.sub_status.as_str())
        .bind(record.http_code as i64)
        .bind(record.latency_ms)
        .bind(record.timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn get_latest(&self, key: &MonitorKey) -> StoreResult<Option<ProbeRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM probe_history
            WHERE provider = ? AND service = ? AND channel = ? AND model = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(&key.provider)
        .bind(&key.service)
        .bind(&key.channel)
        .bind(&key.model)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::record_from_row))
    }

    async fn get_history(&self, key: &MonitorKey, since: i64) -> StoreResult<Vec<ProbeRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM probe_history
            WHERE provider = ? AND service = ? AND channel = ? AND model = ?
              AND timestamp > ?
            ORDER BY timestamp ASC, id ASC
            "#
        ))
        .bind(&key.provider)
        .bind(&key.service)
        .bind(&key.channel)
        .bind(&key.model)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::record_from_row).collect())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn get_latest_batch(
        &self,
        keys: &[MonitorKey],
    ) -> StoreResult<HashMap<MonitorKey, ProbeRecord>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM (
                SELECT {RECORD_COLUMNS},
                       ROW_NUMBER() OVER (
                           PARTITION BY provider, service, channel, model
                           ORDER BY timestamp DESC, id DESC
                       ) AS rn
                FROM probe_history
                WHERE
            "#
        ));
        push_key_filter(&mut qb, keys);
        qb.push(") WHERE rn = 1");

        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .map(|record| (record.key.clone(), record))
            .collect())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn get_history_batch(
        &self,
        keys: &[MonitorKey],
        since: i64,
    ) -> StoreResult<HashMap<MonitorKey, Vec<ProbeRecord>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM probe_history WHERE timestamp > "
        ));
        qb.push_bind(since);
        qb.push(" AND");
        push_key_filter(&mut qb, keys);
        qb.push(" ORDER BY timestamp ASC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut grouped: HashMap<MonitorKey, Vec<ProbeRecord>> = HashMap::new();
        for row in &rows {
            let record = Self::record_from_row(row);
            grouped.entry(record.key.clone()).or_default().push(record);
        }
        Ok(grouped)
    }

    async fn get_service_state(&self, key: &MonitorKey) -> StoreResult<Option<ServiceState>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM service_states
            WHERE provider = ? AND service = ? AND channel = ? AND model = ?
            "#
        ))
        .bind(&key.provider)
        .bind(&key.service)
        .bind(&key.channel)
        .bind(&key.model)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::state_from_row))
    }

    async fn upsert_service_state(&self, state: &ServiceState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_states
                (provider, service, channel, model, stable_available, streak_count,
                 streak_status, last_record_id, last_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (provider, service, channel, model) DO UPDATE SET
                stable_available = excluded.stable_available,
                streak_count = excluded.streak_count,
                streak_status = excluded.streak_status,
                last_record_id = excluded.last_record_id,
                last_timestamp = excluded.last_timestamp
            "#,
        )
        .bind(&state.key.provider)
        .bind(&state.key.service)
        .bind(&state.key.channel)
        .bind(&state.key.model)
        .bind(state.stable_available)
        .bind(state.streak_count)
        .bind(state.streak_status)
        .bind(state.last_record_id)
        .bind(state.last_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_channel_state(
        &self,
        provider: &str,
        service: &str,
        channel: &str,
    ) -> StoreResult<Option<ChannelState>> {
        let row = sqlx::query(
            r#"
            SELECT provider, service, channel, stable_available, down_count,
                   known_count, last_record_id, last_timestamp
            FROM channel_states
            WHERE provider = ? AND service = ? AND channel = ?
            "#,
        )
        .bind(provider)
        .bind(service)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ChannelState {
            provider: row.get("provider"),
            service: row.get("service"),
            channel: row.get("channel"),
            stable_available: row.get("stable_available"),
            down_count: row.get("down_count"),
            known_count: row.get("known_count"),
            last_record_id: row.get("last_record_id"),
            last_timestamp: row.get("last_timestamp"),
        }))
    }

    async fn upsert_channel_state(&self, state: &ChannelState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_states
                (provider, service, channel, stable_available, down_count,
                 known_count, last_record_id, last_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (provider, service, channel) DO UPDATE SET
                stable_available = excluded.stable_available,
                down_count = excluded.down_count,
                known_count = excluded.known_count,
                last_record_id = excluded.last_record_id,
                last_timestamp = excluded.last_timestamp
            "#,
        )
        .bind(&state.provider)
        .bind(&state.service)
        .bind(&state.channel)
        .bind(state.stable_available)
        .bind(state.down_count)
        .bind(state.known_count)
        .bind(state.last_record_id)
        .bind(state.last_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_model_states_for_channel(
        &self,
        provider: &str,
        service: &str,
        channel: &str,
    ) -> StoreResult<Vec<ServiceState>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM service_states
            WHERE provider = ? AND service = ? AND channel = ?
            ORDER BY model ASC
            "#
        ))
        .bind(provider)
        .bind(service)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::state_from_row).collect())
    }

    #[instrument(skip(self, event), fields(monitor = %event.key, event_type = %event.event_type))]
    async fn save_status_event(&self, event: &StatusEvent) -> StoreResult<bool> {
        let meta = serde_json::to_string(&event.meta)?;

        let result = sqlx::query(
            r#"
            INSERT INTO status_events
                (provider, service, channel, model, event_type, from_status,
                 to_status, trigger_record_id, observed_at, created_at, meta)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&event.key.provider)
        .bind(&event.key.service)
        .bind(&event.key.channel)
        .bind(&event.key.model)
        .bind(event.event_type.as_str())
        .bind(event.from_status)
        .bind(event.to_status)
        .bind(event.trigger_record_id)
        .bind(event.observed_at)
        .bind(event.created_at)
        .bind(meta)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_status_events(
        &self,
        since_id: i64,
        limit: usize,
        filter: &EventFilter,
    ) -> StoreResult<Vec<StatusEvent>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM status_events WHERE id > "
        ));
        qb.push_bind(since_id);

        if let Some(provider) = &filter.provider {
            qb.push(" AND provider = ");
            qb.push_bind(provider.clone());
        }
        if let Some(service) = &filter.service {
            qb.push(" AND service = ");
            qb.push_bind(service.clone());
        }
        if let Some(channel) = &filter.channel {
            qb.push(" AND channel = ");
            qb.push_bind(channel.clone());
        }
        if let Some(types) = &filter.types {
            qb.push(" AND event_type IN (");
            for (i, event_type) in types.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push_bind(event_type.as_str());
            }
            qb.push(")");
        }

        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::event_from_row).collect())
    }

    async fn get_latest_event_id(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM status_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    #[instrument(skip(self, mappings), fields(count = mappings.len()))]
    async fn migrate_channel_data(&self, mappings: &[ChannelMapping]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut rewritten = 0u64;

        for mapping in mappings {
            let result = sqlx::query(
                "UPDATE probe_history SET channel = ? \
                 WHERE provider = ? AND service = ? AND channel = ''",
            )
            .bind(&mapping.channel)
            .bind(&mapping.provider)
            .bind(&mapping.service)
            .execute(&mut *tx)
            .await?;
            rewritten += result.rows_affected();

            let result = sqlx::query(
                "UPDATE OR IGNORE service_states SET channel = ? \
                 WHERE provider = ? AND service = ? AND channel = ''",
            )
            .bind(&mapping.channel)
            .bind(&mapping.provider)
            .bind(&mapping.service)
            .execute(&mut *tx)
            .await?;
            rewritten += result.rows_affected();
        }

        tx.commit().await?;

        info!("channel migration rewrote {rewritten} rows");
        Ok(rewritten)
    }

    fn max_connections(&self) -> u32 {
        self.max_connections
    }

    async fn close(&self) -> StoreResult<()> {
        info!("closing SQLite store");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventType, ProbeStatus, SubStatus};

    async fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db"), 5).await.unwrap();
        (dir, store)
    }

    fn record(key: &MonitorKey, status: ProbeStatus, timestamp: i64) -> ProbeRecord {
        ProbeRecord {
            id: 0,
            key: key.clone(),
            status,
            sub_status: if status == ProbeStatus::Red {
                SubStatus::ServerError
            } else {
                SubStatus::None
            },
            http_code: if status == ProbeStatus::Red { 500 } else { 200 },
            latency_ms: 120,
            timestamp,
        }
    }

    fn event(key: &MonitorKey, trigger: i64) -> StatusEvent {
        StatusEvent {
            id: 0,
            key: key.clone(),
            event_type: EventType::Down,
            from_status: 1,
            to_status: 0,
            trigger_record_id: trigger,
            observed_at: 1_700_000_000,
            created_at: 1_700_000_000,
            meta: serde_json::json!({"sub_status": "server_error"}),
        }
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let (_dir, store) = test_store().await;
        let key = MonitorKey::new("acme", "chat", "", "m1");

        let first = store.save_record(&record(&key, ProbeStatus::Green, 100)).await.unwrap();
        let second = store.save_record(&record(&key, ProbeStatus::Green, 200)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_latest_prefers_timestamp_then_id() {
        let (_dir, store) = test_store().await;
        let key = MonitorKey::new("acme", "chat", "", "m1");

        store.save_record(&record(&key, ProbeStatus::Green, 100)).await.unwrap();
        store.save_record(&record(&key, ProbeStatus::Red, 300)).await.unwrap();
        store.save_record(&record(&key, ProbeStatus::Yellow, 200)).await.unwrap();

        let latest = store.get_latest(&key).await.unwrap().unwrap();
        assert_eq!(latest.status, ProbeStatus::Red);
        assert_eq!(latest.timestamp, 300);
    }

    #[tokio::test]
    async fn test_history_strict_since() {
        let (_dir, store) = test_store().await;
        let key = MonitorKey::new("acme", "chat", "", "m1");

        for timestamp in [100, 200, 300] {
            store.save_record(&record(&key, ProbeStatus::Green, timestamp)).await.unwrap();
        }

        let history = store.get_history(&key, 100).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, 200);
        assert_eq!(history[1].timestamp, 300);
    }

    #[tokio::test]
    async fn test_batch_queries() {
        let (_dir, store) = test_store().await;
        let key_a = MonitorKey::new("acme", "chat", "", "m1");
        let key_b = MonitorKey::new("acme", "chat", "", "m2");
        let unknown = MonitorKey::new("acme", "chat", "", "m3");

        store.save_record(&record(&key_a, ProbeStatus::Green, 100)).await.unwrap();
        store.save_record(&record(&key_a, ProbeStatus::Red, 200)).await.unwrap();
        store.save_record(&record(&key_b, ProbeStatus::Yellow, 150)).await.unwrap();

        let latest = store
            .get_latest_batch(&[key_a.clone(), key_b.clone(), unknown.clone()])
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&key_a].status, ProbeStatus::Red);
        assert_eq!(latest[&key_b].status, ProbeStatus::Yellow);

        let history = store
            .get_history_batch(&[key_a.clone(), key_b.clone()], 0)
            .await
            .unwrap();
        assert_eq!(history[&key_a].len(), 2);
        assert_eq!(history[&key_b].len(), 1);

        assert!(store.get_latest_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_state_upsert_is_last_writer_wins() {
        let (_dir, store) = test_store().await;
        let key = MonitorKey::new("acme", "chat", "eu", "m1");

        assert!(store.get_service_state(&key).await.unwrap().is_none());

        let mut state = ServiceState::uninitialised(key.clone());
        state.stable_available = 1;
        state.last_record_id = 7;
        store.upsert_service_state(&state).await.unwrap();

        state.stable_available = 0;
        state.last_record_id = 9;
        store.upsert_service_state(&state).await.unwrap();

        let loaded = store.get_service_state(&key).await.unwrap().unwrap();
        assert_eq!(loaded.stable_available, 0);
        assert_eq!(loaded.last_record_id, 9);
    }

    #[tokio::test]
    async fn test_model_states_for_channel() {
        let (_dir, store) = test_store().await;
        for model in ["m1", "m2"] {
            let mut state =
                ServiceState::uninitialised(MonitorKey::new("acme", "chat", "eu", model));
            state.stable_available = 1;
            store.upsert_service_state(&state).await.unwrap();
        }
        let mut other = ServiceState::uninitialised(MonitorKey::new("acme", "chat", "us", "m1"));
        other.stable_available = 0;
        store.upsert_service_state(&other).await.unwrap();

        let states = store
            .get_model_states_for_channel("acme", "chat", "eu")
            .await
            .unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.key.channel == "eu"));
    }

    #[tokio::test]
    async fn test_event_insert_is_idempotent() {
        let (_dir, store) = test_store().await;
        let key = MonitorKey::new("acme", "chat", "eu", "m1");

        assert!(store.save_status_event(&event(&key, 42)).await.unwrap());
        assert!(!store.save_status_event(&event(&key, 42)).await.unwrap());

        let events = store
            .get_status_events(0, 10, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_record_id, 42);
        assert_eq!(store.get_latest_event_id().await.unwrap(), events[0].id);
    }

    #[tokio::test]
    async fn test_event_filters_and_pagination() {
        let (_dir, store) = test_store().await;
        let key_a = MonitorKey::new("acme", "chat", "eu", "m1");
        let key_b = MonitorKey::new("zeta", "embed", "", "m1");

        store.save_status_event(&event(&key_a, 1)).await.unwrap();
        store.save_status_event(&event(&key_b, 2)).await.unwrap();
        let mut up = event(&key_a, 3);
        up.event_type = EventType::Up;
        store.save_status_event(&up).await.unwrap();

        let filter = EventFilter {
            provider: Some("acme".to_string()),
            ..Default::default()
        };
        let events = store.get_status_events(0, 10, &filter).await.unwrap();
        assert_eq!(events.len(), 2);

        let filter = EventFilter {
            types: Some(vec![EventType::Up]),
            ..Default::default()
        };
        let events = store.get_status_events(0, 10, &filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Up);

        let all = store
            .get_status_events(0, 10, &EventFilter::default())
            .await
            .unwrap();
        let tail = store
            .get_status_events(all[0].id, 10, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|e| e.id > all[0].id));

        let limited = store
            .get_status_events(0, 1, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_channel_data() {
        let (_dir, store) = test_store().await;
        let legacy = MonitorKey::new("acme", "chat", "", "m1");
        let modern = MonitorKey::new("acme", "chat", "eu", "m1");

        store.save_record(&record(&legacy, ProbeStatus::Green, 100)).await.unwrap();
        store.save_record(&record(&modern, ProbeStatus::Green, 200)).await.unwrap();
        store
            .upsert_service_state(&ServiceState::uninitialised(legacy.clone()))
            .await
            .unwrap();

        let rewritten = store
            .migrate_channel_data(&[ChannelMapping {
                provider: "acme".to_string(),
                service: "chat".to_string(),
                channel: "eu".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(rewritten, 2);

        assert!(store.get_latest(&legacy).await.unwrap().is_none());
        let history = store.get_history(&modern, 0).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_migration_adds_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        // seed a pre-channel/model era database
        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::query(
                r#"
                CREATE TABLE probe_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider TEXT NOT NULL DEFAULT '',
                    service TEXT NOT NULL DEFAULT '',
                    status INTEGER NOT NULL DEFAULT 0,
                    latency INTEGER NOT NULL DEFAULT 0,
                    timestamp BIGINT NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO probe_history (provider, service, status, latency, timestamp) \
                 VALUES ('acme', 'chat', 1, 50, 123)",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let store = SqliteStore::new(&path, 5).await.unwrap();
        let key = MonitorKey::new("acme", "chat", "", "");
        let latest = store.get_latest(&key).await.unwrap().unwrap();
        assert_eq!(latest.status, ProbeStatus::Green);
        assert_eq!(latest.sub_status, SubStatus::None);
        assert_eq!(latest.http_code, 0);
    }

    #[tokio::test]
    async fn test_migration_rebuilds_legacy_state_pk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy_pk.db");

        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::query(
                r#"
                CREATE TABLE service_states (
                    provider TEXT NOT NULL DEFAULT '',
                    service TEXT NOT NULL DEFAULT '',
                    channel TEXT NOT NULL DEFAULT '',
                    stable_available INTEGER NOT NULL DEFAULT -1,
                    streak_count INTEGER NOT NULL DEFAULT 0,
                    streak_status INTEGER NOT NULL DEFAULT 0,
                    last_record_id BIGINT NOT NULL DEFAULT 0,
                    last_timestamp BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (provider, service, channel)
                )
                "#,
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO service_states (provider, service, channel, stable_available) \
                 VALUES ('acme', 'chat', '', 1)",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let store = SqliteStore::new(&path, 5).await.unwrap();

        // the legacy row survived the rebuild with model = ''
        let legacy = store
            .get_service_state(&MonitorKey::new("acme", "chat", "", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(legacy.stable_available, 1);

        // and two models under one channel no longer collide
        for model in ["m1", "m2"] {
            store
                .upsert_service_state(&ServiceState::uninitialised(MonitorKey::new(
                    "acme", "chat", "", model,
                )))
                .await
                .unwrap();
        }
        let states = store
            .get_model_states_for_channel("acme", "chat", "")
            .await
            .unwrap();
        assert_eq!(states.len(), 3);
    }
}
