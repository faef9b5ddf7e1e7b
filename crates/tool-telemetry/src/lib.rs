//! Tool call telemetry core
//!
//! Ingests a live stream of tool call events, keeps a bounded rolling window of
//! them in memory and derives the dashboard metric families (call volume,
//! latency percentiles, token usage, failure rate) plus per-request call chains.

pub mod aggregator;
pub mod bus;
pub mod chain;
pub mod config;
pub mod decoder;
pub mod error;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;

pub use aggregator::{HourWindow, MetricsAggregator};
pub use bus::{InvalidationBus, Subscription};
pub use chain::ChainReconstructor;
pub use config::{TelemetryConfig, MAX_WINDOW_HOURS};
pub use error::{ConfigError, DecodeError, QueryError, QueryResult, TransportError};
pub use service::{IngestOutcome, IngestStats, TelemetryService};
pub use store::{AppendOutcome, RollingEventStore, StoreSnapshot};
pub use transport::{
    ConnectionState, ConnectionStatus, EventSource, EventStream, FrameHandler,
    ReconnectPolicy, StreamTransport, WebSocketSource,
};
pub use types::*;
