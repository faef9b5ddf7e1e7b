//! Parsing of inbound wire frames into [`ToolCallEvent`]s.
//!
//! Frames arrive as `{ "type": string, "data": <payload>, "timestamp": number }`
//! where `timestamp` is epoch milliseconds. Only `tool_call` frames are consumed;
//! any other type is skipped so producers can add message kinds freely.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{is_known_tool, ToolCallEvent, ToolCallStatus};

pub const TOOL_CALL_TYPE: &str = "tool_call";

/// Latest accepted event time, `9999-12-31T23:59:59.999Z`. Earliest is the Unix epoch.
const MAX_EPOCH_MILLIS: i64 = 253_402_300_799_999;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    #[serde(default)]
    id: Option<String>,
    request_id: Option<String>,
    tool_name: Option<String>,
    duration_ms: Option<Value>,
    status: Option<String>,
    #[serde(default)]
    input_tokens: Option<Value>,
    #[serde(default)]
    output_tokens: Option<Value>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    sequence: Option<Value>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Decode one raw frame.
///
/// Returns `Ok(None)` for well-formed frames of a type this core does not consume.
pub fn decode(raw: &str) -> Result<Option<ToolCallEvent>, DecodeError> {
    let envelope: Envelope = serde_json::from_str(raw)?;

    let kind = envelope.kind.ok_or(DecodeError::MissingField("type"))?;
    let timestamp = envelope
        .timestamp
        .ok_or(DecodeError::MissingField("timestamp"))?;
    let envelope_time = parse_epoch_millis(&timestamp)?;

    if kind != TOOL_CALL_TYPE {
        debug!("Ignoring frame of type '{}'", kind);
        return Ok(None);
    }

    let data = envelope.data.ok_or(DecodeError::MissingField("data"))?;
    let payload: ToolCallPayload = serde_json::from_value(data)?;
    payload.into_event(envelope_time).map(Some)
}

impl ToolCallPayload {
    fn into_event(self, envelope_time: DateTime<Utc>) -> Result<ToolCallEvent, DecodeError> {
        let request_id = non_empty("request_id", self.request_id)?;
        let tool = non_empty("tool_name", self.tool_name)?;

        let duration_ms = self
            .duration_ms
            .as_ref()
            .ok_or(DecodeError::MissingField("duration_ms"))
            .and_then(|v| non_negative_integer("duration_ms", v))?;

        let status = match self.status.as_deref() {
            None => return Err(DecodeError::MissingField("status")),
            Some("success") => ToolCallStatus::Success,
            Some("failed") => ToolCallStatus::Failed,
            Some(other) => {
                return Err(DecodeError::InvalidField {
                    field: "status",
                    reason: format!("expected 'success' or 'failed', got '{}'", other),
                })
            }
        };

        let input_tokens = optional_integer("input_tokens", self.input_tokens.as_ref())?;
        let output_tokens = optional_integer("output_tokens", self.output_tokens.as_ref())?;
        let sequence = optional_integer("sequence", self.sequence.as_ref())?;

        let error = self.error_message.filter(|msg| !msg.trim().is_empty());
        match (status, &error) {
            (ToolCallStatus::Failed, None) => {
                return Err(DecodeError::Invariant(
                    "failed call without error_message".to_string(),
                ))
            }
            (ToolCallStatus::Success, Some(_)) => {
                return Err(DecodeError::Invariant(
                    "error_message present on successful call".to_string(),
                ))
            }
            _ => {}
        }
        if duration_ms == 0 && status == ToolCallStatus::Success {
            return Err(DecodeError::Invariant(
                "zero duration is only valid for failed calls".to_string(),
            ));
        }

        let started_at = match self.timestamp {
            Some(ts) => DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DecodeError::InvalidField {
                    field: "timestamp",
                    reason: e.to_string(),
                })
                .and_then(|dt| in_range(dt.timestamp_millis()).map(|_| dt))?,
            None => envelope_time,
        };

        if !is_known_tool(&tool) {
            debug!("Tool '{}' is outside the dashboard catalog", tool);
        }

        Ok(ToolCallEvent {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            request_id,
            tool,
            started_at,
            sequence,
            duration_ms,
            status,
            input_tokens,
            output_tokens,
            error,
            metadata: self.metadata.filter(|m| !m.is_null()),
        })
    }
}

fn non_empty(field: &'static str, value: Option<String>) -> Result<String, DecodeError> {
    match value {
        None => Err(DecodeError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(DecodeError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(v) => Ok(v),
    }
}

fn non_negative_integer(field: &'static str, value: &Value) -> Result<u64, DecodeError> {
    value.as_u64().ok_or_else(|| DecodeError::InvalidField {
        field,
        reason: format!("expected a non-negative integer, got {}", value),
    })
}

fn optional_integer(field: &'static str, value: Option<&Value>) -> Result<Option<u64>, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => non_negative_integer(field, v).map(Some),
    }
}

fn parse_epoch_millis(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let millis = value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .ok_or_else(|| DecodeError::InvalidField {
            field: "timestamp",
            reason: format!("expected epoch milliseconds, got {}", value),
        })?;
    Utc.timestamp_millis_opt(in_range(millis)?)
        .single()
        .ok_or_else(|| out_of_range(millis))
}

fn in_range(millis: i64) -> Result<i64, DecodeError> {
    if (0..=MAX_EPOCH_MILLIS).contains(&millis) {
        Ok(millis)
    } else {
        Err(out_of_range(millis))
    }
}

fn out_of_range(millis: i64) -> DecodeError {
    DecodeError::InvalidField {
        field: "timestamp",
        reason: format!("out of range: {}", millis),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(data: Value) -> String {
        json!({ "type": "tool_call", "data": data, "timestamp": 1_760_000_000_000i64 }).to_string()
    }

    #[test]
    fn test_decode_successful_call() {
        let raw = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": 45,
            "status": "success",
            "input_tokens": 120,
            "output_tokens": 80
        }));

        let event = decode(&raw).expect("decode").expect("tool call");
        assert_eq!(event.request_id, "req-1");
        assert_eq!(event.tool, "ReadFile");
        assert_eq!(event.duration_ms, 45);
        assert_eq!(event.status, ToolCallStatus::Success);
        assert_eq!(event.input_tokens, Some(120));
        assert_eq!(event.output_tokens, Some(80));
        assert!(event.error.is_none());
        assert!(!event.id.is_empty());
        assert_eq!(event.started_at.timestamp_millis(), 1_760_000_000_000);
    }

    #[test]
    fn test_decode_keeps_producer_id_sequence_and_timestamp() {
        let raw = frame(json!({
            "id": "call-7",
            "request_id": "req-1",
            "tool_name": "Grep",
            "duration_ms": 12,
            "status": "success",
            "sequence": 3,
            "timestamp": "2025-10-01T14:23:45.123Z",
            "metadata": { "pattern": "fn main" }
        }));

        let event = decode(&raw).expect("decode").expect("tool call");
        assert_eq!(event.id, "call-7");
        assert_eq!(event.sequence, Some(3));
        assert_eq!(event.started_at.to_rfc3339(), "2025-10-01T14:23:45.123+00:00");
        assert_eq!(event.metadata, Some(json!({ "pattern": "fn main" })));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let raw = json!({ "type": "heartbeat", "data": {}, "timestamp": 1 }).to_string();
        assert_eq!(decode(&raw), Ok(None));
    }

    #[test]
    fn test_missing_duration_is_rejected() {
        let raw = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "status": "success"
        }));
        assert_eq!(decode(&raw), Err(DecodeError::MissingField("duration_ms")));
    }

    #[test]
    fn test_negative_and_fractional_numbers_are_rejected() {
        let negative = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": -5,
            "status": "success"
        }));
        assert!(matches!(
            decode(&negative),
            Err(DecodeError::InvalidField { field: "duration_ms", .. })
        ));

        let fractional_tokens = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": 5,
            "status": "success",
            "input_tokens": 1.5
        }));
        assert!(matches!(
            decode(&fractional_tokens),
            Err(DecodeError::InvalidField { field: "input_tokens", .. })
        ));
    }

    #[test]
    fn test_status_outside_allowed_set_is_rejected() {
        let raw = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": 5,
            "status": "timeout"
        }));
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::InvalidField { field: "status", .. })
        ));
    }

    #[test]
    fn test_error_must_accompany_failure_only() {
        let failed_without_error = frame(json!({
            "request_id": "req-1",
            "tool_name": "Grep",
            "duration_ms": 0,
            "status": "failed"
        }));
        assert!(matches!(decode(&failed_without_error), Err(DecodeError::Invariant(_))));

        let success_with_error = frame(json!({
            "request_id": "req-1",
            "tool_name": "Grep",
            "duration_ms": 10,
            "status": "success",
            "error_message": "boom"
        }));
        assert!(matches!(decode(&success_with_error), Err(DecodeError::Invariant(_))));

        let failed_with_error = frame(json!({
            "request_id": "req-1",
            "tool_name": "Grep",
            "duration_ms": 0,
            "status": "failed",
            "error_message": "Pattern syntax error"
        }));
        let event = decode(&failed_with_error).expect("decode").expect("tool call");
        assert_eq!(event.error.as_deref(), Some("Pattern syntax error"));
        assert_eq!(event.duration_ms, 0);
    }

    #[test]
    fn test_timestamps_outside_supported_range_are_rejected() {
        let data = json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": 5,
            "status": "success"
        });
        let min_utc = DateTime::<Utc>::MIN_UTC.timestamp_millis();
        for millis in [min_utc, -1, MAX_EPOCH_MILLIS + 1] {
            let raw = json!({ "type": "tool_call", "data": data, "timestamp": millis }).to_string();
            assert!(matches!(
                decode(&raw),
                Err(DecodeError::InvalidField { field: "timestamp", .. })
            ));
        }

        let mut ancient = data.clone();
        ancient["timestamp"] = json!("0001-01-01T00:00:00Z");
        assert!(matches!(
            decode(&frame(ancient)),
            Err(DecodeError::InvalidField { field: "timestamp", .. })
        ));

        let edge = json!({ "type": "tool_call", "data": data, "timestamp": MAX_EPOCH_MILLIS }).to_string();
        let event = decode(&edge).expect("decode").expect("tool call");
        assert_eq!(event.started_at.timestamp_millis(), MAX_EPOCH_MILLIS);
    }

    #[test]
    fn test_zero_duration_success_is_rejected() {
        let raw = frame(json!({
            "request_id": "req-1",
            "tool_name": "ReadFile",
            "duration_ms": 0,
            "status": "success"
        }));
        assert!(matches!(decode(&raw), Err(DecodeError::Invariant(_))));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
        assert_eq!(
            decode(r#"{"data": {}, "timestamp": 1}"#),
            Err(DecodeError::MissingField("type"))
        );
        assert_eq!(
            decode(r#"{"type": "tool_call", "data": {}}"#),
            Err(DecodeError::MissingField("timestamp"))
        );
        assert!(matches!(
            decode(r#"{"type": "tool_call", "data": {}, "timestamp": "yesterday"}"#),
            Err(DecodeError::InvalidField { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_empty_request_id_is_rejected() {
        let raw = frame(json!({
            "request_id": "  ",
            "tool_name": "ReadFile",
            "duration_ms": 5,
            "status": "success"
        }));
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::InvalidField { field: "request_id", .. })
        ));
    }
}
