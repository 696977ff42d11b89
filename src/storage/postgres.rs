//! PostgreSQL probe store implementation
//!
//! Everything the SQLite backend does, plus the optional DB-side timeline
//! aggregation capability: for long windows (7d/30d) the read path pushes
//! bucketing and counting into the database and ships back one pre-grouped
//! row per `(key, bucket, status, sub_status, http_code)` together with the
//! latest record per bucket. The application then folds those rows through
//! the exact same reductions as the raw-row path, so the two agree
//! numerically.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use super::error::{StoreError, StoreResult};
use super::schema::{event_type_lossy, status_lossy, sub_status_lossy};
use super::store::{ChannelMapping, EventFilter, ProbeStore};
use crate::timeline::{TimeFilter, TimelineAggBatch, TimelineAggRow, TimelineLatestRow};
use crate::{ChannelState, MonitorKey, ProbeRecord, ServiceState, StatusEvent};

const RECORD_COLUMNS: &str =
    "id, provider, service, channel, model, status, sub_status, http_code, latency, timestamp";

const STATE_COLUMNS: &str = "provider, service, channel, model, stable_available, streak_count, \
                             streak_status, last_record_id, last_timestamp";

const EVENT_COLUMNS: &str = "id, provider, service, channel, model, event_type, from_status, \
                             to_status, trigger_record_id, observed_at, created_at, meta";

/// PostgreSQL probe store
pub struct PostgresStore {
    pool: PgPool,
    max_connections: u32,
}

impl PostgresStore {
    /// Connect, size the pool and run the in-place schema migration.
    #[instrument(skip_all)]
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("initializing PostgreSQL store");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        migrate(&pool).await?;

        info!("PostgreSQL store ready");

        Ok(Self {
            pool,
            max_connections,
        })
    }

    fn record_from_row(row: &PgRow) -> ProbeRecord {
        ProbeRecord {
            id: row.get("id"),
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            status: status_lossy(row.get::<i32, _>("status") as i64),
            sub_status: sub_status_lossy(&row.get::<String, _>("sub_status")),
            http_code: row.get::<i32, _>("http_code") as u16,
            latency_ms: row.get("latency"),
            timestamp: row.get("timestamp"),
        }
    }

    fn state_from_row(row: &PgRow) -> ServiceState {
        ServiceState {
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            stable_available: row.get::<i32, _>("stable_available") as i64,
            streak_count: row.get("streak_count"),
            streak_status: row.get::<i32, _>("streak_status") as i64,
            last_record_id: row.get("last_record_id"),
            last_timestamp: row.get("last_timestamp"),
        }
    }

    fn event_from_row(row: &PgRow) -> StatusEvent {
        StatusEvent {
            id: row.get("id"),
            key: MonitorKey::new(
                row.get::<String, _>("provider"),
                row.get::<String, _>("service"),
                row.get::<String, _>("channel"),
                row.get::<String, _>("model"),
            ),
            event_type: event_type_lossy(&row.get::<String, _>("event_type")),
            from_status: row.get::<i32, _>("from_status") as i64,
            to_status: row.get::<i32, _>("to_status") as i64,
            trigger_record_id: row.get("trigger_record_id"),
            observed_at: row.get("observed_at"),
            created_at: row.get("created_at"),
            meta: serde_json::from_str(&row.get::<String, _>("meta"))
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Append a `(provider, service, channel, model) IN ((...), ...)` clause.
fn push_key_filter(qb: &mut QueryBuilder<'_, Postgres>, keys: &[MonitorKey]) {
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

/// SQL predicate for the intra-day UTC minutes filter, mirroring
/// `TimeFilter::contains_timestamp` (half-open, midnight-crossing).
fn time_filter_sql(filter: &TimeFilter) -> Option<String> {
    if filter.start_minute == filter.end_minute {
        return None;
    }
    let minutes = "((timestamp / 60) % 1440)";
    if filter.start_minute < filter.end_minute {
        Some(format!(
            "({minutes} >= {} AND {minutes} < {})",
            filter.start_minute, filter.end_minute
        ))
    } else {
        Some(format!(
            "({minutes} >= {} OR {minutes} < {})",
            filter.start_minute, filter.end_minute
        ))
    }
}

async fn migrate(pool: &PgPool) -> StoreResult<()> {
    debug!("running PostgreSQL schema migration");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS probe_history (
            id BIGSERIAL PRIMARY KEY,
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 0,
            sub_status TEXT NOT NULL DEFAULT '',
            http_code INTEGER NOT NULL DEFAULT 0,
            latency BIGINT NOT NULL DEFAULT 0,
            timestamp BIGINT NOT NULL DEFAULT 0
        )
        "#,
        "ALTER TABLE probe_history ADD COLUMN IF NOT EXISTS channel TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE probe_history ADD COLUMN IF NOT EXISTS model TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE probe_history ADD COLUMN IF NOT EXISTS sub_status TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE probe_history ADD COLUMN IF NOT EXISTS http_code INTEGER NOT NULL DEFAULT 0",
        "DROP INDEX IF EXISTS idx_probe_history_lookup",
        r#"
        CREATE INDEX IF NOT EXISTS idx_probe_history_lookup_v2
        ON probe_history (provider, service, channel, model, timestamp DESC)
        INCLUDE (status, sub_status, latency, id, http_code)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS service_states (
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            stable_available INTEGER NOT NULL DEFAULT -1,
            streak_count BIGINT NOT NULL DEFAULT 0,
            streak_status INTEGER NOT NULL DEFAULT 0,
            last_record_id BIGINT NOT NULL DEFAULT 0,
            last_timestamp BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (provider, service, channel, model)
        )
        "#,
        "ALTER TABLE service_states ADD COLUMN IF NOT EXISTS channel TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE service_states ADD COLUMN IF NOT EXISTS model TEXT NOT NULL DEFAULT ''",
        r#"
        CREATE TABLE IF NOT EXISTS channel_states (
            provider TEXT NOT NULL DEFAULT '',
            service TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL DEFAULT '',
            stable_available INTEGER NOT NULL DEFAULT -1,
            down_count BIGINT NOT NULL DEFAULT 0,
            known_count BIGINT NOT NULL DEFAULT 0,
            last_record_id BIGINT NOT NULL DEFAULT 0,
            last_timestamp BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (provider, service, channel)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS status_events (
            id BIGSERIAL PRIMARY KEY,
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
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_status_events_dedup
        ON status_events (provider, service, channel, event_type, trigger_record_id)
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    }

    rebuild_legacy_state_pk(pool).await?;

    debug!("PostgreSQL schema migration complete");
    Ok(())
}

/// Swap a legacy `(provider, service, channel)` primary key on
/// `service_states` for one that includes `model`.
async fn rebuild_legacy_state_pk(pool: &PgPool) -> StoreResult<()> {
    let pk_columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT a.attname
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
        WHERE i.indrelid = 'service_states'::regclass AND i.indisprimary
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    if pk_columns.iter().any(|column| column == "model") {
        return Ok(());
    }

    info!("rebuilding service_states primary key to include model");

    let constraint: Option<String> = sqlx::query_scalar(
        "SELECT conname FROM pg_constraint \
         WHERE conrelid = 'service_states'::regclass AND contype = 'p'",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    if let Some(name) = constraint {
        sqlx::query(&format!("ALTER TABLE service_states DROP CONSTRAINT {name}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
    }
    sqlx::query(
        "ALTER TABLE service_states ADD PRIMARY KEY (provider, service, channel, model)",
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    Ok(())
}

#[async_trait]
impl ProbeStore for PostgresStore {
    #[instrument(skip(self, record), fields(monitor = %record.key))]
    async fn save_record(&self, record: &ProbeRecord) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO probe_history
                (provider, service, channel, model, status, sub_status, http_code, latency, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&record.key.provider)
        .bind(&record.key.service)
        .bind(&record.key.channel)
        .bind(&record.key.model)
        .bind(record.status.code() as i32)
        .bind(record.sub_status.as_str())
        .bind(record.http_code as i32)
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
            WHERE provider = $1 AND service = $2 AND channel = $3 AND model = $4
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
            WHERE provider = $1 AND service = $2 AND channel = $3 AND model = $4
              AND timestamp > $5
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

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            r#"
            SELECT DISTINCT ON (provider, service, channel, model) {RECORD_COLUMNS}
            FROM probe_history
            WHERE
            "#
        ));
        push_key_filter(&mut qb, keys);
        qb.push(" ORDER BY provider, service, channel, model, timestamp DESC, id DESC");

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

        let mut qb = QueryBuilder::<Postgres>::new(format!(
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

    fn supports_timeline_agg(&self) -> bool {
        true
    }

    #[instrument(skip(self, keys, time_filter), fields(count = keys.len()))]
    async fn get_timeline_agg_batch(
        &self,
        keys: &[MonitorKey],
        since: i64,
        end_time: i64,
        bucket_count: usize,
        bucket_window: i64,
        time_filter: Option<&TimeFilter>,
    ) -> StoreResult<TimelineAggBatch> {
        if keys.is_empty() || bucket_count == 0 || bucket_window <= 0 {
            return Ok(TimelineAggBatch::default());
        }

        let filter_sql = time_filter.and_then(time_filter_sql);
        let window = WindowSelect {
            since,
            end_time,
            bucket_count,
            bucket_window,
            filter_sql,
        };

        let mut groups_qb = QueryBuilder::<Postgres>::new(
            r#"
            SELECT provider, service, channel, model, bucket, status, sub_status, http_code,
                   COUNT(*) AS count,
                   COALESCE(SUM(latency), 0)::bigint AS latency_sum,
                   COALESCE(SUM(latency) FILTER (WHERE latency > 0), 0)::bigint AS positive_latency_sum,
                   COUNT(*) FILTER (WHERE latency > 0) AS positive_latency_count
            FROM (
            "#,
        );
        window.push_select(&mut groups_qb, keys);
        groups_qb.push(
            ") AS windowed GROUP BY provider, service, channel, model, bucket, status, sub_status, http_code",
        );
        let group_rows = groups_qb.build().fetch_all(&self.pool).await?;

        let mut latest_qb = QueryBuilder::<Postgres>::new(
            r#"
            SELECT DISTINCT ON (provider, service, channel, model, bucket)
                   provider, service, channel, model, bucket, status, timestamp, id
            FROM (
            "#,
        );
        window.push_select(&mut latest_qb, keys);
        latest_qb.push(
            ") AS windowed ORDER BY provider, service, channel, model, bucket, timestamp DESC, id DESC",
        );
        let latest_rows = latest_qb.build().fetch_all(&self.pool).await?;

        let groups = group_rows
            .iter()
            .map(|row| TimelineAggRow {
                key: MonitorKey::new(
                    row.get::<String, _>("provider"),
                    row.get::<String, _>("service"),
                    row.get::<String, _>("channel"),
                    row.get::<String, _>("model"),
                ),
                bucket: row.get("bucket"),
                status: row.get::<i32, _>("status") as i64,
                sub_status: row.get("sub_status"),
                http_code: row.get::<i32, _>("http_code") as i64,
                count: row.get("count"),
                latency_sum: row.get("latency_sum"),
                positive_latency_sum: row.get("positive_latency_sum"),
                positive_latency_count: row.get("positive_latency_count"),
            })
            .collect();

        let latest = latest_rows
            .iter()
            .map(|row| TimelineLatestRow {
                key: MonitorKey::new(
                    row.get::<String, _>("provider"),
                    row.get::<String, _>("service"),
                    row.get::<String, _>("channel"),
                    row.get::<String, _>("model"),
                ),
                bucket: row.get("bucket"),
                status: row.get::<i32, _>("status") as i64,
                timestamp: row.get("timestamp"),
                id: row.get("id"),
            })
            .collect();

        Ok(TimelineAggBatch { groups, latest })
    }

    async fn get_service_state(&self, key: &MonitorKey) -> StoreResult<Option<ServiceState>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM service_states
            WHERE provider = $1 AND service = $2 AND channel = $3 AND model = $4
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        .bind(state.stable_available as i32)
        .bind(state.streak_count)
        .bind(state.streak_status as i32)
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
            WHERE provider = $1 AND service = $2 AND channel = $3
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
            stable_available: row.get::<i32, _>("stable_available") as i64,
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
        .bind(state.stable_available as i32)
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
            WHERE provider = $1 AND service = $2 AND channel = $3
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&event.key.provider)
        .bind(&event.key.service)
        .bind(&event.key.channel)
        .bind(&event.key.model)
        .bind(event.event_type.as_str())
        .bind(event.from_status as i32)
        .bind(event.to_status as i32)
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
        let mut qb = QueryBuilder::<Postgres>::new(format!(
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
                "UPDATE probe_history SET channel = $1 \
                 WHERE provider = $2 AND service = $3 AND channel = ''",
            )
            .bind(&mapping.channel)
            .bind(&mapping.provider)
            .bind(&mapping.service)
            .execute(&mut *tx)
            .await?;
            rewritten += result.rows_affected();

            // skip rows whose target state already exists to keep the
            // primary key intact
            let result = sqlx::query(
                r#"
                UPDATE service_states SET channel = $1
                WHERE provider = $2 AND service = $3 AND channel = ''
                  AND NOT EXISTS (
                      SELECT 1 FROM service_states existing
                      WHERE existing.provider = $2 AND existing.service = $3
                        AND existing.channel = $1 AND existing.model = service_states.model
                  )
                "#,
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
        info!("closing PostgreSQL store");
        self.pool.close().await;
        Ok(())
    }
}

/// Inner select shared by the two aggregation queries: window bounds, time
/// filter and the bucket formula `count - 1 - (end - t) / width`. The
/// integer parameters are inlined (they are caller-computed i64s, not user
/// text); monitor keys stay bound.
struct WindowSelect {
    since: i64,
    end_time: i64,
    bucket_count: usize,
    bucket_window: i64,
    filter_sql: Option<String>,
}

impl WindowSelect {
    fn push_select(&self, qb: &mut QueryBuilder<'_, Postgres>, keys: &[MonitorKey]) {
        qb.push(format!(
            "SELECT provider, service, channel, model, status, sub_status, \
             http_code, latency, timestamp, id, \
             ({} - 1 - (({} - timestamp) / {})) AS bucket \
             FROM probe_history WHERE timestamp > {} AND timestamp <= {} AND",
            self.bucket_count as i64,
            self.end_time,
            self.bucket_window,
            self.since,
            self.end_time
        ));
        push_key_filter(qb, keys);
        if let Some(predicate) = &self.filter_sql {
            qb.push(" AND ");
            qb.push(predicate.as_str());
        }
    }
}
