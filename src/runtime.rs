//! Runtime glue: wires storage, events, probe engine and scheduler together
//! and owns their lifecycle.
//!
//! Hot reload goes through `reload`: the new document is validated first and
//! rejected wholesale on error, so a running generation is never replaced by
//! a broken one. A successful reload propagates to the event service before
//! the scheduler swaps its heap (the scheduler enforces that ordering).

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, ResolvedConfig, StorageConfig};
use crate::events::{EventPolicy, EventService};
use crate::probe::ProbeEngine;
use crate::scheduler::{ScheduleSet, Scheduler, effective_concurrency, plan::active_monitors};
use crate::storage::{PostgresStore, ProbeStore, SqliteStore};

/// Extra connections reserved for the read path on top of probe concurrency.
const POOL_HEADROOM: usize = 2;

pub struct PulseRuntime {
    scheduler: Scheduler,
    store: Arc<dyn ProbeStore>,
    events: Arc<EventService>,
}

impl PulseRuntime {
    /// Build the store, spawn the scheduler, start probing.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;
        let resolved = config.resolve()?;

        let store = build_store(&resolved.storage).await?;
        warn_on_small_pool(store.as_ref(), &resolved);

        let events = Arc::new(EventService::new(
            store.clone(),
            EventPolicy::from(&resolved.events),
        ));
        let engine = Arc::new(ProbeEngine::new(resolved.max_response_bytes)?);

        let scheduler = Scheduler::start(
            engine,
            store.clone(),
            events.clone(),
            ScheduleSet::from_config(&resolved),
        );

        info!(
            "relay pulse started with {} configured monitors",
            resolved.monitors.len()
        );

        Ok(Self {
            scheduler,
            store,
            events,
        })
    }

    /// Validate and apply a new config generation. On error the previous
    /// generation stays active. Storage backend changes require a restart.
    pub async fn reload(&self, config: Config) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;
        let resolved = config.resolve()?;

        warn_on_small_pool(self.store.as_ref(), &resolved);
        self.scheduler
            .update_config(ScheduleSet::from_config(&resolved))
            .await;

        info!(
            "configuration reloaded: {} configured monitors",
            resolved.monitors.len()
        );
        Ok(())
    }

    /// Force an immediate probe of every scheduled monitor.
    pub async fn trigger_now(&self) {
        self.scheduler.trigger_now().await;
    }

    /// Shared store handle for the read path.
    pub fn store(&self) -> Arc<dyn ProbeStore> {
        self.store.clone()
    }

    /// Event service handle (the events read API checks `is_active`).
    pub fn events(&self) -> Arc<EventService> {
        self.events.clone()
    }

    /// Stop probing, wait for in-flight workers, close the store.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.scheduler.stop().await;
        self.store.close().await?;
        info!("relay pulse stopped");
        Ok(())
    }
}

async fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ProbeStore>> {
    match config {
        StorageConfig::Sqlite {
            path,
            max_connections,
        } => Ok(Arc::new(SqliteStore::new(path, *max_connections).await?)),
        StorageConfig::Postgres {
            url,
            max_connections,
        } => Ok(Arc::new(PostgresStore::new(url, *max_connections).await?)),
    }
}

/// The pool serves probe writers and API readers at once; a pool smaller
/// than the worker cap stalls one of them.
fn warn_on_small_pool(store: &dyn ProbeStore, resolved: &ResolvedConfig) {
    let active = active_monitors(&resolved.monitors, resolved.boards_enabled);
    let concurrency = effective_concurrency(resolved.max_concurrency, active.len());
    let pool = store.max_connections() as usize;
    if pool < concurrency + POOL_HEADROOM {
        warn!(
            "storage pool of {pool} connections is smaller than probe concurrency {concurrency} \
             plus read headroom {POOL_HEADROOM}; raise storage.max_connections"
        );
    }
}
