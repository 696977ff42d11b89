//! Event state machine - turns the raw probe stream into edge-triggered
//! DOWN/UP events.
//!
//! ## Hysteresis
//!
//! Each monitor key carries a persisted `ServiceState`. A configurable number
//! of consecutive opposing observations (`down_threshold` / `up_threshold`)
//! must accumulate before the stable availability flips and an event is
//! emitted:
//!
//! ```text
//! observation == stable  -> streak resets, nothing happens
//! observation != stable  -> streak grows; at the threshold the stable
//!                           value flips and exactly one edge is emitted
//! ```
//!
//! ## Modes
//!
//! - **Model mode** (default): one state machine per monitor key.
//! - **Channel mode**: the latest observation of every model under a channel
//!   is combined; the channel is down only when all known models are down.
//!
//! ## Crash safety
//!
//! The event row is inserted before the state row is updated. If the process
//! dies in between, the next record recomputes the same edge and the unique
//! index on `(provider, service, channel, event_type, trigger_record_id)`
//! turns the duplicate insert into a no-op.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

use crate::config::{EventMode, EventsConfig, MonitorDef};
use crate::storage::{ProbeStore, StoreResult};
use crate::util::unix_now;
use crate::{ChannelState, EventType, MonitorKey, ProbeRecord, ServiceState, StatusEvent};

/// Snapshot of the event-related configuration.
#[derive(Debug, Clone)]
pub struct EventPolicy {
    pub enabled: bool,
    pub mode: EventMode,
    pub down_threshold: i64,
    pub up_threshold: i64,
}

impl From<&EventsConfig> for EventPolicy {
    fn from(config: &EventsConfig) -> Self {
        Self {
            enabled: config.enabled,
            mode: config.mode,
            down_threshold: config.down_threshold.max(1),
            up_threshold: config.up_threshold.max(1),
        }
    }
}

/// One availability flip produced by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub event_type: EventType,
    pub from_status: i64,
    pub to_status: i64,
}

/// Pure hysteresis reducer. The persisted state after any record stream must
/// equal folding this function over the same stream, which is what the
/// property tests check.
pub fn reduce(
    state: &ServiceState,
    available: bool,
    down_threshold: i64,
    up_threshold: i64,
) -> (ServiceState, Option<Edge>) {
    let observed = available as i64;
    let mut next = state.clone();

    if state.stable_available == -1 {
        // first observation is adopted silently
        next.stable_available = observed;
        next.streak_count = 0;
        next.streak_status = observed;
        return (next, None);
    }

    if observed == state.stable_available {
        next.streak_count = 0;
        next.streak_status = observed;
        return (next, None);
    }

    if observed == state.streak_status {
        next.streak_count = state.streak_count + 1;
    } else {
        next.streak_count = 1;
        next.streak_status = observed;
    }

    let threshold = if observed == 0 {
        down_threshold
    } else {
        up_threshold
    };
    if next.streak_count >= threshold {
        let edge = Edge {
            event_type: if observed == 0 {
                EventType::Down
            } else {
                EventType::Up
            },
            from_status: state.stable_available,
            to_status: observed,
        };
        next.stable_available = observed;
        next.streak_count = 0;
        return (next, Some(edge));
    }

    (next, None)
}

#[derive(Debug, Default)]
struct ActiveIndex {
    keys: HashSet<MonitorKey>,
    /// Channel key -> models currently scheduled under it.
    channel_models: HashMap<MonitorKey, BTreeSet<String>>,
}

/// Ingests probe records and persists hysteretic DOWN/UP edges.
///
/// The probe pipeline is never blocked on event delivery: `process_record`
/// logs and swallows every failure, and the next record for the same key
/// resumes from the persisted state.
pub struct EventService {
    store: Arc<dyn ProbeStore>,
    policy: RwLock<EventPolicy>,
    active: RwLock<ActiveIndex>,
}

impl EventService {
    pub fn new(store: Arc<dyn ProbeStore>, policy: EventPolicy) -> Self {
        Self {
            store,
            policy: RwLock::new(policy),
            active: RwLock::new(ActiveIndex::default()),
        }
    }

    /// Swap in a new config generation. The scheduler calls this *before* it
    /// swaps its heap, so a worker launched right after a reload always sees
    /// the fresh monitor index.
    pub async fn refresh(&self, policy: EventPolicy, active_monitors: &[Arc<MonitorDef>]) {
        let mut index = ActiveIndex::default();
        for monitor in active_monitors {
            index.keys.insert(monitor.key.clone());
            index
                .channel_models
                .entry(monitor.key.channel_key())
                .or_default()
                .insert(monitor.key.model.clone());
        }

        *self.active.write().await = index;
        *self.policy.write().await = policy;
        debug!("event service refreshed with {} monitors", active_monitors.len());
    }

    /// Whether a monitor key belongs to the latest config generation.
    pub async fn is_active(&self, key: &MonitorKey) -> bool {
        self.active.read().await.keys.contains(key)
    }

    #[instrument(skip(self, record), fields(monitor = %record.key))]
    pub async fn process_record(&self, record: &ProbeRecord) {
        let policy = self.policy.read().await.clone();
        if !policy.enabled {
            return;
        }

        let result = match policy.mode {
            EventMode::Model => self.process_model_mode(record, &policy).await,
            EventMode::Channel => self.process_channel_mode(record, &policy).await,
        };

        if let Err(e) = result {
            // drop the record; the next one resumes from persisted state
            error!("event processing failed for {}: {e}", record.key);
        }
    }

    async fn process_model_mode(
        &self,
        record: &ProbeRecord,
        policy: &EventPolicy,
    ) -> StoreResult<()> {
        let state = self
            .store
            .get_service_state(&record.key)
            .await?
            .unwrap_or_else(|| ServiceState::uninitialised(record.key.clone()));

        if record.id < state.last_record_id {
            warn!(
                "ignoring out-of-order record {} for {} (last processed {})",
                record.id, record.key, state.last_record_id
            );
            return Ok(());
        }

        let (mut next, edge) = reduce(
            &state,
            record.status.is_available(),
            policy.down_threshold,
            policy.up_threshold,
        );
        next.last_record_id = record.id;
        next.last_timestamp = record.timestamp;

        if let Some(edge) = edge {
            let event = StatusEvent {
                id: 0,
                key: record.key.clone(),
                event_type: edge.event_type,
                from_status: edge.from_status,
                to_status: edge.to_status,
                trigger_record_id: record.id,
                observed_at: record.timestamp,
                created_at: unix_now(),
                meta: json!({
                    "sub_status": record.sub_status.as_str(),
                    "http_code": record.http_code,
                    "latency_ms": record.latency_ms,
                }),
            };
            if self.store.save_status_event(&event).await? {
                debug!("emitted {} for {}", edge.event_type, record.key);
            } else {
                debug!("duplicate {} for {} suppressed", edge.event_type, record.key);
            }
        }

        self.store.upsert_service_state(&next).await
    }

    async fn process_channel_mode(
        &self,
        record: &ProbeRecord,
        policy: &EventPolicy,
    ) -> StoreResult<()> {
        // channel mode keeps per-model rows as plain latest-observation
        // trackers; hysteresis lives on the channel
        let mut model_state = self
            .store
            .get_service_state(&record.key)
            .await?
            .unwrap_or_else(|| ServiceState::uninitialised(record.key.clone()));

        if record.id < model_state.last_record_id {
            warn!(
                "ignoring out-of-order record {} for {} (last processed {})",
                record.id, record.key, model_state.last_record_id
            );
            return Ok(());
        }

        let observed_model = record.status.is_available() as i64;
        model_state.stable_available = observed_model;
        model_state.streak_count = 0;
        model_state.streak_status = observed_model;
        model_state.last_record_id = record.id;
        model_state.last_timestamp = record.timestamp;
        self.store.upsert_service_state(&model_state).await?;

        let channel_key = record.key.channel_key();
        let active_models = self
            .active
            .read()
            .await
            .channel_models
            .get(&channel_key)
            .cloned()
            .unwrap_or_default();

        let states = self
            .store
            .get_model_states_for_channel(
                &record.key.provider,
                &record.key.service,
                &record.key.channel,
            )
            .await?;

        let known: Vec<&ServiceState> = states
            .iter()
            .filter(|state| state.stable_available >= 0)
            .filter(|state| active_models.is_empty() || active_models.contains(&state.key.model))
            .collect();
        if known.is_empty() {
            return Ok(());
        }

        let down_models: Vec<&str> = known
            .iter()
            .filter(|state| state.stable_available == 0)
            .map(|state| state.key.model.as_str())
            .collect();
        let observed = (down_models.len() != known.len()) as i64;

        let previous = self
            .store
            .get_channel_state(
                &record.key.provider,
                &record.key.service,
                &record.key.channel,
            )
            .await?
            .unwrap_or_else(|| {
                ChannelState::uninitialised(
                    record.key.provider.clone(),
                    record.key.service.clone(),
                    record.key.channel.clone(),
                )
            });

        let mut next = previous.clone();
        next.known_count = known.len() as i64;
        next.last_record_id = previous.last_record_id.max(record.id);
        next.last_timestamp = previous.last_timestamp.max(record.timestamp);

        let edge = if previous.stable_available == -1 {
            next.stable_available = observed;
            next.down_count = 0;
            None
        } else if observed == previous.stable_available {
            next.down_count = 0;
            None
        } else {
            next.down_count = previous.down_count + 1;
            let threshold = if observed == 0 {
                policy.down_threshold
            } else {
                policy.up_threshold
            };
            if next.down_count >= threshold {
                next.stable_available = observed;
                next.down_count = 0;
                Some(Edge {
                    event_type: if observed == 0 {
                        EventType::Down
                    } else {
                        EventType::Up
                    },
                    from_status: previous.stable_available,
                    to_status: observed,
                })
            } else {
                None
            }
        };

        if let Some(edge) = edge {
            let models: Vec<&str> = known.iter().map(|state| state.key.model.as_str()).collect();
            let event = StatusEvent {
                id: 0,
                key: channel_key.clone(),
                event_type: edge.event_type,
                from_status: edge.from_status,
                to_status: edge.to_status,
                trigger_record_id: record.id,
                observed_at: record.timestamp,
                created_at: unix_now(),
                meta: json!({
                    "models": models,
                    "down_models": down_models,
                }),
            };
            if self.store.save_status_event(&event).await? {
                debug!("emitted channel {} for {}", edge.event_type, channel_key);
            } else {
                debug!("duplicate channel {} for {} suppressed", edge.event_type, channel_key);
            }
        }

        self.store.upsert_channel_state(&next).await
    }
}
