use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::MAX_WINDOW_HOURS;
use crate::store::{RollingEventStore, StoreSnapshot};
use crate::types::{
    FailureRateDataPoint, LatencyDataPoint, MetricsOverview, TokenUsageDataPoint,
    ToolCallDataPoint, ToolCallEvent, ToolCallStatus,
};

const SECS_PER_HOUR: i64 = 3600;

/// Hour-aligned window of `hours` buckets whose last bucket contains `now`.
///
/// `hours` is clamped to `1..=MAX_WINDOW_HOURS`; edges saturate at the
/// representable time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: DateTime<Utc>,
    pub hours: u32,
}

impl HourWindow {
    pub fn ending_at(now: DateTime<Utc>, hours: u32) -> Self {
        let hours = hours.clamp(1, MAX_WINDOW_HOURS);
        let current = hour_floor(now);
        let start = current
            .checked_sub_signed(Duration::hours(i64::from(hours - 1)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, hours }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start
            .checked_add_signed(Duration::hours(i64::from(self.hours)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The window of equal length immediately before this one.
    pub fn previous(&self) -> Self {
        Self {
            start: self
                .start
                .checked_sub_signed(Duration::hours(i64::from(self.hours)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            hours: self.hours,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end()
    }

    pub fn bucket_index(&self, at: DateTime<Utc>) -> Option<usize> {
        if !self.contains(at) {
            return None;
        }
        Some(((at - self.start).num_seconds() / SECS_PER_HOUR) as usize)
    }

    pub fn bucket_start(&self, index: usize) -> DateTime<Utc> {
        self.start
            .checked_add_signed(Duration::hours(index as i64))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(SECS_PER_HOUR), 0).unwrap_or(at)
}

fn hour_label(start: DateTime<Utc>) -> String {
    start.format("%H:00").to_string()
}

/// Nearest-rank percentile over an ascending slice: `rank = ceil(p/100 * n)`,
/// clamped to `[1, n]`.
pub fn nearest_rank(sorted: &[u64], percentile: u32) -> Option<u64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (percentile as usize * n).div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

fn failure_percent(success: u64, failures: u64) -> f64 {
    let total = success + failures;
    if total == 0 {
        0.0
    } else {
        failures as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HourTally {
    success: u64,
    failures: u64,
    input: u64,
    output: u64,
}

fn tally(snapshot: &StoreSnapshot, window: HourWindow) -> Vec<HourTally> {
    let mut buckets = vec![HourTally::default(); window.hours as usize];
    for event in snapshot.iter() {
        let Some(bucket) = window
            .bucket_index(event.started_at)
            .and_then(|index| buckets.get_mut(index))
        else {
            continue;
        };
        match event.status {
            ToolCallStatus::Success => bucket.success += 1,
            ToolCallStatus::Failed => bucket.failures += 1,
        }
        bucket.input = bucket.input.saturating_add(event.input_tokens.unwrap_or(0));
        bucket.output = bucket.output.saturating_add(event.output_tokens.unwrap_or(0));
    }
    buckets
}

fn events_in<'a>(
    snapshot: &'a StoreSnapshot,
    window: HourWindow,
) -> impl Iterator<Item = &'a ToolCallEvent> + 'a {
    snapshot.iter().filter(move |e| window.contains(e.started_at))
}

pub fn tool_call_series(snapshot: &StoreSnapshot, window: HourWindow) -> Vec<ToolCallDataPoint> {
    tally(snapshot, window)
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let start = window.bucket_start(i);
            ToolCallDataPoint {
                start,
                hour: hour_label(start),
                success: t.success,
                failures: t.failures,
            }
        })
        .collect()
}

pub fn token_usage_series(snapshot: &StoreSnapshot, window: HourWindow) -> Vec<TokenUsageDataPoint> {
    tally(snapshot, window)
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let start = window.bucket_start(i);
            TokenUsageDataPoint {
                start,
                hour: hour_label(start),
                input: t.input,
                output: t.output,
            }
        })
        .collect()
}

pub fn failure_rate_series(
    snapshot: &StoreSnapshot,
    window: HourWindow,
) -> Vec<FailureRateDataPoint> {
    tally(snapshot, window)
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let start = window.bucket_start(i);
            FailureRateDataPoint {
                start,
                hour: hour_label(start),
                failure_percent: failure_percent(t.success, t.failures),
            }
        })
        .collect()
}

/// p50/p95/p99 per tool. Tools without calls in the window are omitted.
pub fn latency_by_tool(snapshot: &StoreSnapshot, window: HourWindow) -> Vec<LatencyDataPoint> {
    let mut durations: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for event in events_in(snapshot, window) {
        durations
            .entry(event.tool.as_str())
            .or_default()
            .push(event.duration_ms);
    }

    durations
        .into_iter()
        .filter_map(|(tool, mut samples)| {
            samples.sort_unstable();
            Some(LatencyDataPoint {
                tool: tool.to_string(),
                samples: samples.len(),
                p50: nearest_rank(&samples, 50)?,
                p95: nearest_rank(&samples, 95)?,
                p99: nearest_rank(&samples, 99)?,
            })
        })
        .collect()
}

pub fn overview(snapshot: &StoreSnapshot, window: HourWindow) -> MetricsOverview {
    let mut total_calls = 0u64;
    let mut failures = 0u64;
    let mut total_duration = 0u64;
    let mut total_tokens = 0u64;
    for event in events_in(snapshot, window) {
        total_calls += 1;
        total_duration = total_duration.saturating_add(event.duration_ms);
        total_tokens = total_tokens.saturating_add(event.total_tokens());
        if event.status.is_failure() {
            failures += 1;
        }
    }

    let previous_calls = events_in(snapshot, window.previous()).count() as u64;
    let change_percent = if previous_calls == 0 {
        0.0
    } else {
        (total_calls as f64 - previous_calls as f64) / previous_calls as f64 * 100.0
    };

    MetricsOverview {
        total_calls,
        avg_latency_ms: if total_calls == 0 {
            0.0
        } else {
            total_duration as f64 / total_calls as f64
        },
        total_tokens,
        failure_rate: failure_percent(total_calls - failures, failures),
        change_percent,
    }
}

/// Derives the dashboard metric families from the store.
///
/// Holds no state of its own: every call takes one snapshot and computes over it,
/// so concurrent appends never show up half-applied.
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<RollingEventStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<RollingEventStore>) -> Self {
        Self { store }
    }

    pub fn tool_call_series(&self, hours: u32) -> Vec<ToolCallDataPoint> {
        self.tool_call_series_at(hours, Utc::now())
    }

    pub fn tool_call_series_at(&self, hours: u32, now: DateTime<Utc>) -> Vec<ToolCallDataPoint> {
        tool_call_series(&self.store.snapshot(), HourWindow::ending_at(now, hours))
    }

    pub fn latency_by_tool(&self, hours: u32) -> Vec<LatencyDataPoint> {
        self.latency_by_tool_at(hours, Utc::now())
    }

    pub fn latency_by_tool_at(&self, hours: u32, now: DateTime<Utc>) -> Vec<LatencyDataPoint> {
        latency_by_tool(&self.store.snapshot(), HourWindow::ending_at(now, hours))
    }

    pub fn latency_for_tool(&self, hours: u32, tool: &str) -> Option<LatencyDataPoint> {
        self.latency_for_tool_at(hours, tool, Utc::now())
    }

    pub fn latency_for_tool_at(
        &self,
        hours: u32,
        tool: &str,
        now: DateTime<Utc>,
    ) -> Option<LatencyDataPoint> {
        self.latency_by_tool_at(hours, now)
            .into_iter()
            .find(|point| point.tool == tool)
    }

    pub fn token_usage_series(&self, hours: u32) -> Vec<TokenUsageDataPoint> {
        self.token_usage_series_at(hours, Utc::now())
    }

    pub fn token_usage_series_at(&self, hours: u32, now: DateTime<Utc>) -> Vec<TokenUsageDataPoint> {
        token_usage_series(&self.store.snapshot(), HourWindow::ending_at(now, hours))
    }

    pub fn failure_rate_series(&self, hours: u32) -> Vec<FailureRateDataPoint> {
        self.failure_rate_series_at(hours, Utc::now())
    }

    pub fn failure_rate_series_at(
        &self,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Vec<FailureRateDataPoint> {
        failure_rate_series(&self.store.snapshot(), HourWindow::ending_at(now, hours))
    }

    pub fn overview(&self, hours: u32) -> MetricsOverview {
        self.overview_at(hours, Utc::now())
    }

    pub fn overview_at(&self, hours: u32, now: DateTime<Utc>) -> MetricsOverview {
        overview(&self.store.snapshot(), HourWindow::ending_at(now, hours))
    }
}
