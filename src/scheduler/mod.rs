//! Probe scheduler - min-heap cadence with a single timer and a global
//! concurrency cap.
//!
//! ## Design
//!
//! One dispatcher task owns a min-heap of `Task { monitor, next_run }`. A
//! single `sleep_until` is armed for the heap root; command and completion
//! channels double as the wake channel. Workers acquire a semaphore permit
//! before launch and run `probe -> save record -> process events`, then hand
//! the task back for rescheduling.
//!
//! ```text
//! heap root due -> pop -> acquire permit -> spawn worker
//!                                              |
//!      reschedule(max(planned, now) + interval) <- completion channel
//! ```
//!
//! ## At-least-interval
//!
//! `next_run = max(planned + interval, now + interval)`: a probe that
//! overruns its interval pushes the next run out instead of piling up
//! catch-up probes.
//!
//! ## Hot reload
//!
//! `update_config` refreshes the event service's active-monitor index
//! *before* the heap is swapped, and every task carries the generation that
//! built it - completions from a previous generation are dropped instead of
//! re-entering the new heap.

pub mod plan;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::ProbeRecord;
use crate::config::{MonitorDef, ResolvedConfig};
use crate::events::{EventPolicy, EventService};
use crate::probe::{ProbeEngine, ProbeOutcome};
use crate::storage::ProbeStore;
use crate::util::unix_now;

use self::plan::{PlanReason, active_monitors, build_plan};

/// Fallback concurrency cap when the config says 0 / nothing.
const DEFAULT_CONCURRENCY: usize = 10;

/// Park duration while the heap is empty; commands wake the loop earlier.
const IDLE_PARK: Duration = Duration::from_secs(60);

/// Everything the scheduler needs from one config generation.
#[derive(Clone)]
pub struct ScheduleSet {
    pub monitors: Vec<Arc<MonitorDef>>,
    pub stagger: bool,
    pub max_concurrency: i64,
    pub boards_enabled: bool,
    pub events: EventPolicy,
}

impl ScheduleSet {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            monitors: config.monitors.clone(),
            stagger: config.stagger_probes,
            max_concurrency: config.max_concurrency,
            boards_enabled: config.boards_enabled,
            events: EventPolicy::from(&config.events),
        }
    }
}

struct Task {
    monitor: Arc<MonitorDef>,
    interval: Duration,
    next_run: Instant,
    generation: u64,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_run.cmp(&other.next_run)
    }
}

enum SchedulerCommand {
    UpdateConfig(ScheduleSet),
    TriggerNow,
}

/// Handle to the running dispatcher.
pub struct Scheduler {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the dispatcher with an initial config generation. The event
    /// service is wired here, before the first probe can launch.
    pub fn start(
        engine: Arc<ProbeEngine>,
        store: Arc<dyn ProbeStore>,
        events: Arc<EventService>,
        initial: ScheduleSet,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = SchedulerActor {
            engine,
            store,
            events,
            heap: BinaryHeap::new(),
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            capacity: DEFAULT_CONCURRENCY,
            generation: 0,
            started: false,
            cancel: cancel.clone(),
            cmd_rx,
            done_tx,
            done_rx,
        };

        let handle = tokio::spawn(actor.run(initial));

        Self {
            cmd_tx,
            cancel,
            handle,
        }
    }

    /// Swap in a new config generation (hot reload).
    pub async fn update_config(&self, set: ScheduleSet) {
        if self
            .cmd_tx
            .send(SchedulerCommand::UpdateConfig(set))
            .await
            .is_err()
        {
            warn!("scheduler is gone, config update dropped");
        }
    }

    /// Force an immediate run of every task.
    pub async fn trigger_now(&self) {
        if self.cmd_tx.send(SchedulerCommand::TriggerNow).await.is_err() {
            warn!("scheduler is gone, trigger dropped");
        }
    }

    /// Cancel in-flight work and wait for the dispatcher to drain.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("scheduler task ended abnormally: {e}");
        }
    }
}

struct SchedulerActor {
    engine: Arc<ProbeEngine>,
    store: Arc<dyn ProbeStore>,
    events: Arc<EventService>,
    heap: BinaryHeap<Reverse<Task>>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    generation: u64,
    started: bool,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    done_tx: mpsc::UnboundedSender<Task>,
    done_rx: mpsc::UnboundedReceiver<Task>,
}

impl SchedulerActor {
    async fn run(mut self, initial: ScheduleSet) {
        debug!("starting probe scheduler");
        self.apply_config(initial).await;

        loop {
            let deadline = self.heap.peek().map(|Reverse(task)| task.next_run);

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    SchedulerCommand::UpdateConfig(set) => self.apply_config(set).await,
                    SchedulerCommand::TriggerNow => self.trigger_now(),
                },

                Some(task) = self.done_rx.recv() => self.reschedule(task),

                _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_PARK)) => {
                    if deadline.is_some() {
                        self.dispatch_due().await;
                    }
                }
            }
        }

        self.drain().await;
        debug!("probe scheduler stopped");
    }

    /// Rebuild heap and semaphore for a new generation. The event service is
    /// refreshed first so concurrent workers never observe a monitor the
    /// event side does not know about.
    #[instrument(skip(self, set), fields(monitors = set.monitors.len()))]
    async fn apply_config(&mut self, set: ScheduleSet) {
        let active = active_monitors(&set.monitors, set.boards_enabled);

        self.events.refresh(set.events.clone(), &active).await;

        let reason = if self.started {
            PlanReason::Reload
        } else {
            PlanReason::Startup
        };
        self.started = true;
        self.generation += 1;

        let now = Instant::now();
        self.heap = build_plan(&active, set.stagger, reason)
            .into_iter()
            .map(|planned| {
                Reverse(Task {
                    interval: planned.monitor.interval,
                    next_run: now + planned.initial_delay,
                    monitor: planned.monitor,
                    generation: self.generation,
                })
            })
            .collect();

        let capacity = effective_concurrency(set.max_concurrency, active.len());
        if capacity != self.capacity {
            self.semaphore = Arc::new(Semaphore::new(capacity));
            self.capacity = capacity;
        }

        info!(
            "schedule rebuilt: {} active monitors, concurrency {}",
            self.heap.len(),
            capacity
        );
    }

    fn trigger_now(&mut self) {
        let now = Instant::now();
        let tasks: Vec<Reverse<Task>> = self
            .heap
            .drain()
            .map(|Reverse(mut task)| {
                task.next_run = now;
                Reverse(task)
            })
            .collect();
        self.heap = tasks.into();
        debug!("trigger: {} tasks due now", self.heap.len());
    }

    async fn dispatch_due(&mut self) {
        let now = Instant::now();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(task)| task.next_run <= now)
        {
            let Reverse(task) = self.heap.pop().expect("peeked");

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = self.cancel.cancelled() => return,
            };

            let engine = self.engine.clone();
            let store = self.store.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let done_tx = self.done_tx.clone();

            tokio::spawn(async move {
                let _permit = permit;
                run_probe(&engine, &store, &events, &cancel, &task.monitor).await;
                let _ = done_tx.send(task);
            });
        }
    }

    fn reschedule(&mut self, mut task: Task) {
        if task.generation != self.generation {
            debug!("dropping completed task from stale generation");
            return;
        }
        task.next_run = next_run_after(task.next_run, Instant::now(), task.interval);
        self.heap.push(Reverse(task));
    }

    /// Wait for in-flight workers by draining the semaphore.
    async fn drain(&mut self) {
        // completion sends fail fast instead of backing up on a closed loop
        self.done_rx.close();
        if let Err(e) = self.semaphore.acquire_many(self.capacity as u32).await {
            debug!("semaphore closed during drain: {e}");
        }
    }
}

/// The at-least-interval rule.
fn next_run_after(planned: Instant, now: Instant, interval: Duration) -> Instant {
    (planned + interval).max(now + interval)
}

/// Concurrency cap sentinels: -1 expands to the active monitor count at
/// rebuild time, 0/missing means the default of 10.
pub fn effective_concurrency(max_concurrency: i64, active_count: usize) -> usize {
    match max_concurrency {
        -1 => active_count.max(1),
        n if n > 0 => n as usize,
        _ => DEFAULT_CONCURRENCY,
    }
}

/// One worker: probe, persist, feed the event machine. Persistence failures
/// are logged and the event step skipped; the scheduler keeps going.
async fn run_probe(
    engine: &ProbeEngine,
    store: &Arc<dyn ProbeStore>,
    events: &EventService,
    cancel: &CancellationToken,
    monitor: &Arc<MonitorDef>,
) {
    if cancel.is_cancelled() {
        // never started the request; skip the save entirely
        return;
    }

    let outcome = tokio::select! {
        outcome = engine.probe(monitor) => outcome,
        _ = cancel.cancelled() => ProbeOutcome::cancelled(),
    };

    let mut record = ProbeRecord {
        id: 0,
        key: monitor.key.clone(),
        status: outcome.status,
        sub_status: outcome.sub_status,
        http_code: outcome.http_code,
        latency_ms: outcome.latency_ms,
        timestamp: unix_now(),
    };

    match store.save_record(&record).await {
        Ok(id) => {
            record.id = id;
            events.process_record(&record).await;
        }
        Err(e) => {
            error!("failed to persist probe record for {}: {e}", monitor.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_least_interval_rule() {
        let interval = Duration::from_secs(60);
        let planned = Instant::now();

        // probe finished quickly: next run follows the plan
        let now = planned + Duration::from_secs(1);
        assert_eq!(next_run_after(planned, now, interval), planned + interval);

        // probe overran its interval by 30s: next run moves out, no catch-up
        let now = planned + Duration::from_secs(90);
        assert_eq!(
            next_run_after(planned, now, interval),
            now + interval
        );
    }

    #[test]
    fn test_effective_concurrency_sentinels() {
        assert_eq!(effective_concurrency(-1, 7), 7);
        assert_eq!(effective_concurrency(-1, 0), 1);
        assert_eq!(effective_concurrency(0, 7), 10);
        assert_eq!(effective_concurrency(4, 7), 4);
    }

    #[test]
    fn test_heap_orders_by_next_run() {
        let monitor = Arc::new(MonitorDef {
            key: crate::MonitorKey::new("acme", "chat", "", "m1"),
            url: "https://api.acme.test/ping".to_string(),
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
        });

        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for offset in [30u64, 10, 20] {
            heap.push(Reverse(Task {
                monitor: monitor.clone(),
                interval: Duration::from_secs(60),
                next_run: now + Duration::from_secs(offset),
                generation: 1,
            }));
        }

        let Reverse(first) = heap.pop().unwrap();
        assert_eq!(first.next_run, now + Duration::from_secs(10));
        let Reverse(second) = heap.pop().unwrap();
        assert_eq!(second.next_run, now + Duration::from_secs(20));
    }
}
