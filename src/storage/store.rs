//! Probe store trait definition
//!
//! This module defines the `ProbeStore` trait both storage backends
//! implement. The trait is designed to be:
//!
//! - **Async**: all methods are async for compatibility with Tokio
//! - **Batch-oriented**: the 7d/30d read paths fetch many monitor keys in a
//!   single round trip
//! - **Feature-detected**: DB-side timeline aggregation is an optional
//!   capability; callers check `supports_timeline_agg` and fall back to raw
//!   rows
//!
//! ## Thread safety
//!
//! Implementations must be `Send + Sync`; the scheduler's workers, the event
//! state machine and the read path all share one store concurrently.
//!
//! ## Cancellation
//!
//! Every method is a plain future: per-request deadlines are applied by the
//! caller (`tokio::time::timeout`) and dropping the future cancels the
//! underlying query. No context object is threaded through.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::{StoreError, StoreResult};
use crate::timeline::{TimeFilter, TimelineAggBatch};
use crate::{ChannelState, EventType, MonitorKey, ProbeRecord, ServiceState, StatusEvent};

/// Filters for the event read path (`GET /api/events`).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub provider: Option<String>,
    pub service: Option<String>,
    pub channel: Option<String>,
    /// Restrict to these event types; None means both.
    pub types: Option<Vec<EventType>>,
}

/// One legacy-channel backfill instruction: rows with this provider/service
/// and an empty channel are rewritten to `channel`.
#[derive(Debug, Clone)]
pub struct ChannelMapping {
    pub provider: String,
    pub service: String,
    pub channel: String,
}

#[async_trait]
pub trait ProbeStore: Send + Sync {
    /// Insert one probe record and return its assigned id.
    async fn save_record(&self, record: &ProbeRecord) -> StoreResult<i64>;

    /// Latest record for one monitor key.
    async fn get_latest(&self, key: &MonitorKey) -> StoreResult<Option<ProbeRecord>>;

    /// Records for one key with `timestamp > since`, oldest first.
    async fn get_history(&self, key: &MonitorKey, since: i64) -> StoreResult<Vec<ProbeRecord>>;

    /// Latest record per key, one round trip.
    async fn get_latest_batch(
        &self,
        keys: &[MonitorKey],
    ) -> StoreResult<HashMap<MonitorKey, ProbeRecord>>;

    /// History per key with `timestamp > since`, one round trip.
    async fn get_history_batch(
        &self,
        keys: &[MonitorKey],
        since: i64,
    ) -> StoreResult<HashMap<MonitorKey, Vec<ProbeRecord>>>;

    /// Whether `get_timeline_agg_batch` is implemented.
    fn supports_timeline_agg(&self) -> bool {
        false
    }

    /// DB-side timeline pre-aggregation. Must be numerically identical to
    /// folding the raw rows through `timeline::aggregate_records` (same
    /// boundary rules, same bucket formula, same filter).
    #[allow(unused_variables)]
    async fn get_timeline_agg_batch(
        &self,
        keys: &[MonitorKey],
        since: i64,
        end_time: i64,
        bucket_count: usize,
        bucket_window: i64,
        time_filter: Option<&TimeFilter>,
    ) -> StoreResult<TimelineAggBatch> {
        Err(StoreError::Unsupported("timeline aggregation"))
    }

    async fn get_service_state(&self, key: &MonitorKey) -> StoreResult<Option<ServiceState>>;

    /// Last-writer-wins upsert keyed by the monitor key.
    async fn upsert_service_state(&self, state: &ServiceState) -> StoreResult<()>;

    async fn get_channel_state(
        &self,
        provider: &str,
        service: &str,
        channel: &str,
    ) -> StoreResult<Option<ChannelState>>;

    async fn upsert_channel_state(&self, state: &ChannelState) -> StoreResult<()>;

    /// All per-model states under one channel.
    async fn get_model_states_for_channel(
        &self,
        provider: &str,
        service: &str,
        channel: &str,
    ) -> StoreResult<Vec<ServiceState>>;

    /// Insert an event. Returns false when the unique index swallowed a
    /// duplicate; both outcomes are success for the state machine.
    async fn save_status_event(&self, event: &StatusEvent) -> StoreResult<bool>;

    /// Events with `id > since_id`, ascending, capped at `limit`.
    async fn get_status_events(
        &self,
        since_id: i64,
        limit: usize,
        filter: &EventFilter,
    ) -> StoreResult<Vec<StatusEvent>>;

    /// Highest event id, 0 when the table is empty.
    async fn get_latest_event_id(&self) -> StoreResult<i64>;

    /// One-shot backfill of legacy empty-channel rows. Returns the number of
    /// rewritten rows across `probe_history` and `service_states`.
    async fn migrate_channel_data(&self, mappings: &[ChannelMapping]) -> StoreResult<u64>;

    /// Configured pool size, for the runtime's sizing warning.
    fn max_connections(&self) -> u32;

    /// Close the backend and release resources.
    async fn close(&self) -> StoreResult<()>;
}
