use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tools the dashboard has dedicated styling and ordering for.
pub const KNOWN_TOOLS: [&str; 5] = ["SearchRepo", "ReadFile", "Grep", "WriteFile", "SearchWeb"];

pub fn is_known_tool(name: &str) -> bool {
    KNOWN_TOOLS.contains(&name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Failed,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallEvent {
    pub id: String,
    pub request_id: String,
    pub tool: String,
    pub started_at: DateTime<Utc>,
    /// Position within the request's chain, when the producer supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub duration_ms: u64,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Set iff `status` is [`ToolCallStatus::Failed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolCallEvent {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .unwrap_or(0)
            .saturating_add(self.output_tokens.unwrap_or(0))
    }

    /// `started_at + duration_ms`, saturating at the latest representable time.
    pub fn finished_at(&self) -> DateTime<Utc> {
        i64::try_from(self.duration_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|duration| self.started_at.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Ordering key within a chain: sequenced calls first by sequence, the rest
    /// by start time.
    pub(crate) fn chain_key(&self) -> (bool, u64, DateTime<Utc>) {
        (
            self.sequence.is_none(),
            self.sequence.unwrap_or(0),
            self.started_at,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallDataPoint {
    pub start: DateTime<Utc>,
    pub hour: String,
    pub success: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatencyDataPoint {
    pub tool: String,
    pub samples: usize,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsageDataPoint {
    pub start: DateTime<Utc>,
    pub hour: String,
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRateDataPoint {
    pub start: DateTime<Utc>,
    pub hour: String,
    #[serde(rename = "failurePercent")]
    pub failure_percent: f64,
}

/// Headline numbers for the metric cards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsOverview {
    pub total_calls: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub failure_rate: f64,
    /// Change in `total_calls` relative to the preceding window of equal length.
    pub change_percent: f64,
}

/// All events sharing a request id, in causal order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallChain {
    pub request_id: String,
    pub calls: Vec<ToolCallEvent>,
    /// Sum of member durations.
    pub total_duration_ms: u64,
    /// Wall-clock span from the first start to the last finish.
    pub span_ms: u64,
}

impl ToolCallChain {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn failed_calls(&self) -> usize {
        self.calls.iter().filter(|c| c.status.is_failure()).count()
    }
}
