//! Timeline aggregation - turns probe rows into bucketed uptime timelines.
//!
//! The read path asks for a fixed number of buckets over a window
//! (`bucket_count * bucket_window == end_time - since`). Each bucket reduces
//! its records to a latest status, a mean latency, a weighted availability
//! percentage and exact per-sub-status tallies.
//!
//! Two input shapes fold through the same reductions so their outputs agree
//! to floating-point rounding: raw `ProbeRecord` rows (SQLite, short
//! windows) and pre-aggregated rows produced DB-side by PostgreSQL for long
//! windows.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::{MonitorKey, ProbeRecord, SubStatus};

/// Derived timeline-only status for buckets without records. Never persisted.
pub const MISSING_STATUS: i64 = -1;

/// Intra-day filter in UTC minutes-of-day, half-open `[start, end)`.
/// `start > end` crosses midnight; `start == end` keeps the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFilter {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TimeFilter {
    pub fn contains_timestamp(&self, timestamp: i64) -> bool {
        let minute = (((timestamp / 60) % 1440 + 1440) % 1440) as u16;
        if self.start_minute == self.end_minute {
            true
        } else if self.start_minute < self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

/// One aggregation request. `bucket_count * bucket_window` must equal
/// `end_time - since`.
#[derive(Debug, Clone)]
pub struct TimelineParams {
    pub since: i64,
    pub end_time: i64,
    pub bucket_count: usize,
    pub bucket_window: i64,
    pub time_filter: Option<TimeFilter>,
    pub degraded_weight: f64,
}

impl TimelineParams {
    /// Bucket index for a record timestamp, or None when the record falls
    /// outside the window (strict left boundary) or the time filter.
    pub fn bucket_index(&self, timestamp: i64) -> Option<usize> {
        if timestamp <= self.since || timestamp > self.end_time {
            return None;
        }
        if let Some(filter) = &self.time_filter
            && !filter.contains_timestamp(timestamp)
        {
            return None;
        }

        let offset = (self.end_time - timestamp) / self.bucket_window;
        let index = self.bucket_count as i64 - 1 - offset;
        (0..self.bucket_count as i64)
            .contains(&index)
            .then_some(index as usize)
    }

    fn bucket_end(&self, index: usize) -> i64 {
        self.end_time - (self.bucket_count - 1 - index) as i64 * self.bucket_window
    }
}

/// Exact per-bucket tallies shipped to the read API.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub available: u64,
    pub degraded: u64,
    pub unavailable: u64,
    /// Count per non-empty sub-status string.
    pub sub_status: BTreeMap<String, u64>,
    /// `sub_status -> http_code -> count`, red records with a non-zero code
    /// and a sub-status in `SubStatus::HTTP_CODE_BREAKDOWN` only.
    pub http_code_breakdown: BTreeMap<String, BTreeMap<u16, u64>>,
}

/// One timeline bucket as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimePoint {
    pub time: String,
    /// Bucket end, unix seconds.
    pub timestamp: i64,
    /// Latest record status in the bucket, or -1 when empty.
    pub status: i64,
    /// Mean latency in milliseconds (see bucket reduction rules).
    pub latency: f64,
    /// Weighted availability percentage, or -1 when the bucket is empty.
    pub availability: f64,
    pub status_counts: StatusCounts,
}

/// DB-side pre-aggregated group: one row per
/// `(key, bucket, status, sub_status, http_code)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineAggRow {
    pub key: MonitorKey,
    pub bucket: i64,
    pub status: i64,
    pub sub_status: String,
    pub http_code: i64,
    pub count: i64,
    pub latency_sum: i64,
    /// Sum and count restricted to records with `latency > 0`.
    pub positive_latency_sum: i64,
    pub positive_latency_count: i64,
}

/// DB-side latest record per `(key, bucket)` by `(timestamp DESC, id DESC)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineLatestRow {
    pub key: MonitorKey,
    pub bucket: i64,
    pub status: i64,
    pub timestamp: i64,
    pub id: i64,
}

/// Result of one batched DB-side aggregation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineAggBatch {
    pub groups: Vec<TimelineAggRow>,
    pub latest: Vec<TimelineLatestRow>,
}

#[derive(Debug, Clone, Default)]
struct BucketAcc {
    total: u64,
    green: u64,
    yellow: u64,
    unavailable: u64,
    /// Latency over records with status > 0.
    available_latency_sum: i64,
    available_latency_count: u64,
    /// Latency over records with latency > 0 (fallback mean).
    positive_latency_sum: i64,
    positive_latency_count: u64,
    /// (timestamp, id, status) of the newest record seen.
    latest: Option<(i64, i64, i64)>,
    sub_status: BTreeMap<String, u64>,
    http_code_breakdown: BTreeMap<String, BTreeMap<u16, u64>>,
}

impl BucketAcc {
    fn note_latest(&mut self, timestamp: i64, id: i64, status: i64) {
        let newer = match self.latest {
            None => true,
            Some((ts, existing_id, _)) => (timestamp, id) > (ts, existing_id),
        };
        if newer {
            self.latest = Some((timestamp, id, status));
        }
    }

    fn fold_record(&mut self, record: &ProbeRecord) {
        let status = record.status.code();
        self.total += 1;
        match status {
            1 => self.green += 1,
            2 => self.yellow += 1,
            _ => self.unavailable += 1,
        }

        if status > 0 {
            self.available_latency_sum += record.latency_ms;
            self.available_latency_count += 1;
        }
        if record.latency_ms > 0 {
            self.positive_latency_sum += record.latency_ms;
            self.positive_latency_count += 1;
        }

        self.note_latest(record.timestamp, record.id, status);

        let sub = record.sub_status.as_str();
        if !sub.is_empty() {
            *self.sub_status.entry(sub.to_string()).or_default() += 1;
        }
        if status == 0 && record.http_code != 0 && record.sub_status.in_http_code_breakdown() {
            *self
                .http_code_breakdown
                .entry(sub.to_string())
                .or_default()
                .entry(record.http_code)
                .or_default() += 1;
        }
    }

    fn fold_group(&mut self, row: &TimelineAggRow) {
        let count = row.count.max(0) as u64;
        self.total += count;
        match row.status {
            1 => self.green += count,
            2 => self.yellow += count,
            _ => self.unavailable += count,
        }

        if row.status > 0 {
            self.available_latency_sum += row.latency_sum;
            self.available_latency_count += count;
        }
        self.positive_latency_sum += row.positive_latency_sum;
        self.positive_latency_count += row.positive_latency_count.max(0) as u64;

        if !row.sub_status.is_empty() {
            *self.sub_status.entry(row.sub_status.clone()).or_default() += count;
        }
        let in_breakdown = SubStatus::parse(&row.sub_status)
            .map(SubStatus::in_http_code_breakdown)
            .unwrap_or(false);
        if row.status == 0 && row.http_code != 0 && in_breakdown {
            *self
                .http_code_breakdown
                .entry(row.sub_status.clone())
                .or_default()
                .entry(row.http_code as u16)
                .or_default() += count;
        }
    }

    fn finish(self, time_end: i64, degraded_weight: f64) -> TimePoint {
        let status = self
            .latest
            .map(|(_, _, status)| status)
            .unwrap_or(MISSING_STATUS);

        let latency = if self.available_latency_count > 0 {
            self.available_latency_sum as f64 / self.available_latency_count as f64
        } else if self.positive_latency_count > 0 {
            self.positive_latency_sum as f64 / self.positive_latency_count as f64
        } else {
            0.0
        };

        let availability = if self.total > 0 {
            (self.green as f64 + self.yellow as f64 * degraded_weight) / self.total as f64 * 100.0
        } else {
            -1.0
        };

        TimePoint {
            time: format_bucket_time(time_end),
            timestamp: time_end,
            status,
            latency,
            availability,
            status_counts: StatusCounts {
                total: self.total,
                available: self.green,
                degraded: self.yellow,
                unavailable: self.unavailable,
                sub_status: self.sub_status,
                http_code_breakdown: self.http_code_breakdown,
            },
        }
    }
}

fn format_bucket_time(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn finish_buckets(accs: Vec<BucketAcc>, params: &TimelineParams) -> Vec<TimePoint> {
    accs.into_iter()
        .enumerate()
        .map(|(index, acc)| acc.finish(params.bucket_end(index), params.degraded_weight))
        .collect()
}

/// Application-side aggregation over raw records for one monitor key.
/// Output is invariant under record ordering.
pub fn aggregate_records(records: &[ProbeRecord], params: &TimelineParams) -> Vec<TimePoint> {
    let mut accs = vec![BucketAcc::default(); params.bucket_count];
    for record in records {
        if let Some(index) = params.bucket_index(record.timestamp) {
            accs[index].fold_record(record);
        }
    }
    finish_buckets(accs, params)
}

/// Fold a DB-side aggregation batch into per-key timelines. The backend has
/// already applied the window, the time filter and the bucket formula; this
/// only trusts bucket indices that are in range.
pub fn aggregate_batch(
    batch: &TimelineAggBatch,
    keys: &[MonitorKey],
    params: &TimelineParams,
) -> HashMap<MonitorKey, Vec<TimePoint>> {
    let mut accs: HashMap<MonitorKey, Vec<BucketAcc>> = keys
        .iter()
        .map(|key| (key.clone(), vec![BucketAcc::default(); params.bucket_count]))
        .collect();

    for row in &batch.groups {
        if let Some(buckets) = accs.get_mut(&row.key)
            && (0..params.bucket_count as i64).contains(&row.bucket)
        {
            buckets[row.bucket as usize].fold_group(row);
        }
    }
    for row in &batch.latest {
        if let Some(buckets) = accs.get_mut(&row.key)
            && (0..params.bucket_count as i64).contains(&row.bucket)
        {
            buckets[row.bucket as usize].note_latest(row.timestamp, row.id, row.status);
        }
    }

    accs.into_iter()
        .map(|(key, buckets)| (key, finish_buckets(buckets, params)))
        .collect()
}
