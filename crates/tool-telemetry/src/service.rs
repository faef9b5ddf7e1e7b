//! The query surface and ingestion pipeline.
//!
//! `StreamTransport -> decode -> RollingEventStore -> InvalidationBus`. The
//! transport's receive path is the only writer; every query takes one store
//! snapshot and computes synchronously over it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::aggregator::MetricsAggregator;
use crate::bus::{InvalidationBus, Subscription};
use crate::chain::ChainReconstructor;
use crate::config::{TelemetryConfig, MAX_WINDOW_HOURS};
use crate::decoder;
use crate::error::{ConfigError, DecodeError, QueryError, QueryResult};
use crate::store::{AppendOutcome, RollingEventStore};
use crate::transport::{
    ConnectionStatus, EventSource, FrameHandler, ReconnectPolicy, StreamTransport,
    WebSocketSource,
};
use crate::types::{
    FailureRateDataPoint, LatencyDataPoint, MetricsOverview, TokenUsageDataPoint,
    ToolCallChain, ToolCallDataPoint, ToolCallEvent,
};

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as a new event.
    Accepted { evicted: usize },
    /// Replaced an event with the same id.
    Replaced,
    /// Older than the retention horizon; not stored.
    Expired,
    /// Well-formed frame of a type that is not consumed.
    Ignored,
    /// Dropped; the store is unchanged.
    Rejected(DecodeError),
}

impl IngestOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. } | IngestOutcome::Replaced)
    }
}

/// Running frame counters since the service was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub replaced: u64,
    pub expired: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub last_rejection: Option<String>,
}

impl IngestStats {
    pub fn frames(&self) -> u64 {
        self.accepted + self.replaced + self.expired + self.ignored + self.rejected
    }
}

struct IngestPipeline {
    store: Arc<RollingEventStore>,
    bus: Arc<InvalidationBus>,
    stats: Mutex<IngestStats>,
}

impl IngestPipeline {
    fn ingest(&self, raw: &str) -> IngestOutcome {
        let outcome = match decoder::decode(raw) {
            Ok(Some(event)) => {
                debug!("Tool call {} ({}, {})", event.id, event.tool, event.status);
                match self.store.append(event) {
                    AppendOutcome::Inserted { evicted } => IngestOutcome::Accepted { evicted },
                    AppendOutcome::Replaced => IngestOutcome::Replaced,
                    AppendOutcome::Expired => IngestOutcome::Expired,
                }
            }
            Ok(None) => IngestOutcome::Ignored,
            Err(e) => {
                warn!("Dropping telemetry frame: {}", e);
                IngestOutcome::Rejected(e)
            }
        };

        {
            let mut stats = self.stats.lock();
            match &outcome {
                IngestOutcome::Accepted { evicted } => {
                    stats.accepted += 1;
                    stats.evicted += *evicted as u64;
                }
                IngestOutcome::Replaced => stats.replaced += 1,
                IngestOutcome::Expired => stats.expired += 1,
                IngestOutcome::Ignored => stats.ignored += 1,
                IngestOutcome::Rejected(e) => {
                    stats.rejected += 1;
                    stats.last_rejection = Some(e.to_string());
                }
            }
        }

        if outcome.is_stored() {
            self.bus.notify();
        }
        outcome
    }
}

impl FrameHandler for IngestPipeline {
    fn handle_frame(&self, frame: &str) {
        self.ingest(frame);
    }
}

/// Tool call telemetry core: live ingestion plus the dashboard queries.
pub struct TelemetryService {
    config: TelemetryConfig,
    pipeline: Arc<IngestPipeline>,
    aggregator: MetricsAggregator,
    chains: ChainReconstructor,
    transport: StreamTransport,
}

impl TelemetryService {
    /// Build a service reading from the configured WebSocket endpoint.
    pub fn new(config: TelemetryConfig) -> Result<Self, ConfigError> {
        let source = Arc::new(WebSocketSource::from_config(&config));
        Self::with_source(config, source)
    }

    /// Build a service over any [`EventSource`].
    pub fn with_source(
        config: TelemetryConfig,
        source: Arc<dyn EventSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut store = RollingEventStore::new(config.store_capacity);
        if let Some(retention) = config.retention() {
            store = store.with_retention(retention);
        }
        let store = Arc::new(store);

        let pipeline = Arc::new(IngestPipeline {
            store: Arc::clone(&store),
            bus: Arc::new(InvalidationBus::new()),
            stats: Mutex::new(IngestStats::default()),
        });

        Ok(Self {
            aggregator: MetricsAggregator::new(Arc::clone(&store)),
            chains: ChainReconstructor::new(store),
            transport: StreamTransport::new(source, ReconnectPolicy::from(&config)),
            pipeline,
            config,
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RollingEventStore> {
        &self.pipeline.store
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    /// Connect and begin ingesting. No-op while already running; restarts after `failed`.
    pub fn start(&self) {
        let handler: Arc<dyn FrameHandler> = self.pipeline.clone();
        self.transport.start(handler);
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    /// Decode one raw frame and store it. Malformed frames are counted and dropped.
    pub fn ingest_frame(&self, raw: &str) -> IngestOutcome {
        self.pipeline.ingest(raw)
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.pipeline.stats.lock().clone()
    }

    pub fn get_tool_call_series(&self, hours: i64) -> QueryResult<Vec<ToolCallDataPoint>> {
        let hours = validate_hours(hours)?;
        Ok(self.aggregator.tool_call_series(hours))
    }

    pub fn get_latency_by_tool(&self, hours: i64) -> QueryResult<Vec<LatencyDataPoint>> {
        let hours = validate_hours(hours)?;
        Ok(self.aggregator.latency_by_tool(hours))
    }

    pub fn get_token_usage_series(&self, hours: i64) -> QueryResult<Vec<TokenUsageDataPoint>> {
        let hours = validate_hours(hours)?;
        Ok(self.aggregator.token_usage_series(hours))
    }

    pub fn get_failure_rate_series(&self, hours: i64) -> QueryResult<Vec<FailureRateDataPoint>> {
        let hours = validate_hours(hours)?;
        Ok(self.aggregator.failure_rate_series(hours))
    }

    pub fn get_overview(&self, hours: i64) -> QueryResult<MetricsOverview> {
        let hours = validate_hours(hours)?;
        Ok(self.aggregator.overview(hours))
    }

    /// The newest `limit` calls, newest first.
    pub fn get_recent_calls(&self, limit: i64) -> QueryResult<Vec<ToolCallEvent>> {
        let max = self.pipeline.store.capacity();
        let limit = usize::try_from(limit)
            .ok()
            .filter(|l| (1..=max).contains(l))
            .ok_or(QueryError::InvalidLimit { limit, max })?;
        Ok(self.pipeline.store.recent(limit))
    }

    pub fn get_chain(&self, request_id: &str) -> Option<ToolCallChain> {
        self.chains.chain_for(request_id)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.watch_status()
    }

    /// Run `callback` with the new generation after every store mutation.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.pipeline.bus.subscribe(callback)
    }

    pub fn watch_invalidations(&self) -> watch::Receiver<u64> {
        self.pipeline.bus.watch()
    }

    pub fn current_generation(&self) -> u64 {
        self.pipeline.bus.current_generation()
    }
}

fn validate_hours(hours: i64) -> QueryResult<u32> {
    u32::try_from(hours)
        .ok()
        .filter(|h| (1..=MAX_WINDOW_HOURS).contains(h))
        .ok_or(QueryError::InvalidWindow {
            hours,
            max: MAX_WINDOW_HOURS,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(capacity: usize) -> TelemetryService {
        let config = TelemetryConfig {
            store_capacity: capacity,
            ..TelemetryConfig::default()
        };
        TelemetryService::new(config).expect("valid config")
    }

    fn frame(id: &str, status: &str) -> String {
        let mut data = json!({
            "id": id,
            "request_id": "req_1",
            "tool_name": "Grep",
            "duration_ms": 80,
            "status": status,
            "input_tokens": 10,
            "output_tokens": 5,
        });
        if status == "failed" {
            data["error_message"] = json!("pattern too broad");
        }
        json!({
            "type": "tool_call",
            "data": data,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        })
        .to_string()
    }

    #[test]
    fn test_validate_hours_bounds() {
        assert_eq!(validate_hours(1), Ok(1));
        assert_eq!(validate_hours(744), Ok(744));
        for bad in [0, -1, 745, i64::MAX] {
            assert_eq!(
                validate_hours(bad),
                Err(QueryError::InvalidWindow { hours: bad, max: 744 })
            );
        }
    }

    #[test]
    fn test_ingest_outcomes_and_stats() {
        let service = service(2);

        assert_eq!(service.ingest_frame(&frame("a", "success")), IngestOutcome::Accepted { evicted: 0 });
        assert_eq!(service.ingest_frame(&frame("a", "failed")), IngestOutcome::Replaced);
        assert_eq!(service.ingest_frame(&frame("b", "success")), IngestOutcome::Accepted { evicted: 0 });
        assert_eq!(service.ingest_frame(&frame("c", "success")), IngestOutcome::Accepted { evicted: 1 });
        assert_eq!(
            service.ingest_frame(r#"{"type":"heartbeat","timestamp":0}"#),
            IngestOutcome::Ignored
        );
        assert!(matches!(service.ingest_frame("not json"), IngestOutcome::Rejected(DecodeError::Json(_))));

        let stats = service.ingest_stats();
        assert_eq!((stats.accepted, stats.replaced, stats.ignored, stats.rejected), (3, 1, 1, 1));
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.frames(), 6);
        assert!(stats.last_rejection.is_some());
        assert_eq!(service.store().len(), 2);
    }

    #[test]
    fn test_only_stored_frames_bump_generation() {
        let service = service(10);
        service.ingest_frame("{}");
        service.ingest_frame(r#"{"type":"heartbeat","timestamp":0}"#);
        assert_eq!(service.current_generation(), 0);

        service.ingest_frame(&frame("a", "success"));
        service.ingest_frame(&frame("a", "success"));
        assert_eq!(service.current_generation(), 2);
    }

    #[test]
    fn test_recent_calls_limit_validation() {
        let service = service(5);
        for id in ["a", "b", "c"] {
            service.ingest_frame(&frame(id, "success"));
        }

        let recent = service.get_recent_calls(2).expect("valid limit");
        let ids: Vec<&str> = recent.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(service.get_recent_calls(5).map(|r| r.len()), Ok(3));

        for bad in [0, -3, 6] {
            assert_eq!(
                service.get_recent_calls(bad),
                Err(QueryError::InvalidLimit { limit: bad, max: 5 })
            );
        }
    }

    #[test]
    fn test_extreme_values_never_panic_queries() {
        let config = TelemetryConfig {
            retention_hours: Some(24),
            ..TelemetryConfig::default()
        };
        let service = TelemetryService::new(config).expect("valid config");
        let now = chrono::Utc::now().timestamp_millis();
        let call = |id: &str, duration: u64, input: u64| {
            json!({
                "type": "tool_call",
                "data": {
                    "id": id,
                    "request_id": "r",
                    "tool_name": "SearchWeb",
                    "duration_ms": duration,
                    "status": "success",
                    "input_tokens": input,
                    "output_tokens": 1,
                },
                "timestamp": now,
            })
            .to_string()
        };

        assert!(service.ingest_frame(&call("a", 9_000_000_000_000_000_000, u64::MAX)).is_stored());
        assert!(service.ingest_frame(&call("b", u64::MAX, 10)).is_stored());
        let ancient = json!({
            "type": "tool_call",
            "data": { "request_id": "r", "tool_name": "Grep", "duration_ms": 1, "status": "success" },
            "timestamp": chrono::DateTime::<chrono::Utc>::MIN_UTC.timestamp_millis(),
        })
        .to_string();
        assert!(matches!(service.ingest_frame(&ancient), IngestOutcome::Rejected(_)));

        let tokens = service.get_token_usage_series(24).expect("valid window");
        assert!(tokens.iter().any(|p| p.input == u64::MAX));
        assert_eq!(service.get_overview(24).map(|o| o.total_tokens), Ok(u64::MAX));
        let chain = service.get_chain("r").expect("chain");
        assert_eq!(chain.total_duration_ms, u64::MAX);
        assert_eq!(service.store().len(), 2);
    }

    #[test]
    fn test_expired_frames_are_counted_not_stored() {
        let config = TelemetryConfig {
            retention_hours: Some(24),
            ..TelemetryConfig::default()
        };
        let service = TelemetryService::new(config).expect("valid config");
        let now = chrono::Utc::now();
        let at = |id: &str, when: chrono::DateTime<chrono::Utc>| {
            json!({
                "type": "tool_call",
                "data": { "id": id, "request_id": "r", "tool_name": "Grep", "duration_ms": 5, "status": "success" },
                "timestamp": when.timestamp_millis(),
            })
            .to_string()
        };

        service.ingest_frame(&at("fresh", now));
        assert_eq!(
            service.ingest_frame(&at("stale", now - chrono::Duration::hours(48))),
            IngestOutcome::Expired
        );
        assert_eq!(service.ingest_stats().expired, 1);
        assert_eq!(service.current_generation(), 1);
        assert_eq!(service.store().len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TelemetryConfig {
            transport_url: "http://localhost:8080".to_string(),
            ..TelemetryConfig::default()
        };
        assert!(matches!(TelemetryService::new(config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_new_service_is_closed_and_empty() {
        let service = service(10);
        assert_eq!(service.connection_status(), ConnectionStatus::default());
        assert!(service.get_chain("req_1").is_none());
        assert_eq!(service.get_overview(24).map(|o| o.total_calls), Ok(0));
    }
}
