//! Schedule planning: grouping, intra-group compaction and stagger.
//!
//! Monitors sharing `(provider, service, channel)` form a group and probe in
//! a compact sequence 2 s apart, parent entry first. Group start times are
//! spread out ("staggered") so a fleet of groups does not fire at once:
//!
//! - On startup the per-group step is 3 s, jittered by +-10 %. The step is
//!   raised until `step - 2 * jitter >= widest intra-group spread`, which
//!   keeps adjacent groups from overlapping even in the worst jitter case.
//! - On hot reload the step is `min active interval / group count`, clamped
//!   to at least 5 s, jittered by +-5 %. A spread wider than the step is
//!   only worth a warning there - the running schedule absorbs it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::MonitorKey;
use crate::config::MonitorDef;

/// Fixed gap between members of one group.
pub const INTRA_GROUP_GAP: Duration = Duration::from_secs(2);

const STARTUP_STEP_SECS: f64 = 3.0;
const STARTUP_JITTER: f64 = 0.10;
const RELOAD_MIN_STEP_SECS: f64 = 5.0;
const RELOAD_JITTER: f64 = 0.05;

/// Why a plan is being built; startup and reload stagger differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    Startup,
    Reload,
}

/// One monitor with its initial dispatch delay.
#[derive(Debug, Clone)]
pub struct PlannedProbe {
    pub monitor: Arc<MonitorDef>,
    pub initial_delay: Duration,
}

/// Whether a monitor takes part in scheduling at all.
pub fn is_schedulable(monitor: &MonitorDef, boards_enabled: bool) -> bool {
    !monitor.disabled && !(boards_enabled && monitor.cold)
}

/// The schedulable subset of a config generation.
pub fn active_monitors(
    monitors: &[Arc<MonitorDef>],
    boards_enabled: bool,
) -> Vec<Arc<MonitorDef>> {
    monitors
        .iter()
        .filter(|monitor| is_schedulable(monitor, boards_enabled))
        .cloned()
        .collect()
}

/// Partition into `(provider, service, channel)` groups, parent entry first
/// within each group. BTreeMap keeps group order deterministic.
fn group(monitors: &[Arc<MonitorDef>]) -> BTreeMap<MonitorKey, Vec<Arc<MonitorDef>>> {
    let mut groups: BTreeMap<MonitorKey, Vec<Arc<MonitorDef>>> = BTreeMap::new();
    for monitor in monitors {
        groups
            .entry(monitor.key.channel_key())
            .or_default()
            .push(monitor.clone());
    }
    for members in groups.values_mut() {
        members.sort_by(|a, b| {
            (&a.parent, &a.key.model).cmp(&(&b.parent, &b.key.model))
        });
    }
    groups
}

/// Compute initial dispatch delays for the active monitors.
pub fn build_plan(
    active: &[Arc<MonitorDef>],
    stagger: bool,
    reason: PlanReason,
) -> Vec<PlannedProbe> {
    let groups = group(active);
    if groups.is_empty() {
        return Vec::new();
    }

    let max_width_secs = groups
        .values()
        .map(|members| (members.len().saturating_sub(1)) as f64 * INTRA_GROUP_GAP.as_secs_f64())
        .fold(0.0, f64::max);

    let (step_secs, jitter) = match reason {
        PlanReason::Startup => {
            let mut step = STARTUP_STEP_SECS;
            // worst case: this group jitters late, the next one jitters early
            let needed = max_width_secs / (1.0 - 2.0 * STARTUP_JITTER);
            if needed > step {
                step = needed.max(STARTUP_STEP_SECS);
            }
            (step, STARTUP_JITTER)
        }
        PlanReason::Reload => {
            let min_interval_secs = active
                .iter()
                .map(|monitor| monitor.interval.as_secs_f64())
                .fold(f64::INFINITY, f64::min);
            let step =
                (min_interval_secs / groups.len() as f64).max(RELOAD_MIN_STEP_SECS);
            if max_width_secs > step {
                warn!(
                    "intra-group spread of {max_width_secs:.0}s exceeds the reload stagger step of {step:.0}s"
                );
            }
            (step, RELOAD_JITTER)
        }
    };

    let mut rng = rand::rng();
    let mut plan = Vec::with_capacity(active.len());

    for (group_index, members) in groups.values().enumerate() {
        let group_offset = if !stagger || group_index == 0 {
            Duration::ZERO
        } else {
            let base = step_secs * group_index as f64;
            let jittered = base * (1.0 + rng.random_range(-jitter..=jitter));
            Duration::from_secs_f64(jittered.max(0.0))
        };

        for (member_index, monitor) in members.iter().enumerate() {
            plan.push(PlannedProbe {
                monitor: monitor.clone(),
                initial_delay: group_offset + INTRA_GROUP_GAP * member_index as u32,
            });
        }
    }

    plan
}
