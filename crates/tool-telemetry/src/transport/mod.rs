//! Resilient streaming connection to the telemetry feed.
//!
//! One control loop per [`StreamTransport`] drives the connection through
//! `connecting -> open -> closed -> (connecting | failed)`. Backoff waits are
//! `select!`ed against the transport's cancellation token, so `stop()` cancels a
//! pending retry as well as a live socket.

pub mod websocket;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TelemetryConfig;
use crate::error::TransportError;

pub use websocket::WebSocketSource;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of the transport's connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnect attempt counter; 0 while the first connection is made or after a successful open.
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Delay until the next attempt, while one is scheduled.
    pub retry_in_ms: Option<u64>,
}

impl ConnectionStatus {
    fn new(state: ConnectionState, attempt: u32) -> Self {
        Self {
            state,
            attempt,
            last_error: None,
            retry_in_ms: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Data may be stale: the feed is not currently delivering events.
    pub fn is_offline(&self) -> bool {
        matches!(self.state, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Closed, 0)
    }
}

/// Exponential reconnect schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    ///
    /// `None` once the attempt cap is exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 5)
    }
}

impl From<&TelemetryConfig> for ReconnectPolicy {
    fn from(config: &TelemetryConfig) -> Self {
        Self::new(config.base_reconnect_delay(), config.max_reconnect_attempts)
    }
}

/// Something that can open a stream of raw frames.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventStream>, TransportError>;

    fn describe(&self) -> String {
        "event source".to_string()
    }
}

/// An open connection. `None` from `next_frame` means the remote side closed.
#[async_trait]
pub trait EventStream: Send {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) {}
}

/// Receives raw frames one at a time, in arrival order.
///
/// Whatever the handler does with a frame, the connection stays open.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, frame: &str);
}

impl<F> FrameHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle_frame(&self, frame: &str) {
        self(frame)
    }
}

struct ControlLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one logical connection to an [`EventSource`] plus its reconnect policy.
pub struct StreamTransport {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    control: Mutex<Option<ControlLoop>>,
}

impl StreamTransport {
    pub fn new(source: Arc<dyn EventSource>, policy: ReconnectPolicy) -> Self {
        let (status_tx, _rx) = watch::channel(ConnectionStatus::default());
        Self {
            source,
            policy,
            status_tx: Arc::new(status_tx),
            control: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.control
            .lock()
            .as_ref()
            .is_some_and(|c| !c.handle.is_finished())
    }

    /// Spawn the control loop. A no-op while a loop is already running; after
    /// `failed` this is the manual recovery path and starts again from attempt 0.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, handler: Arc<dyn FrameHandler>) {
        let mut control = self.control.lock();
        if control.as_ref().is_some_and(|c| !c.handle.is_finished()) {
            debug!("Transport already running for {}", self.source.describe());
            return;
        }

        let cancel = CancellationToken::new();
        let control_loop = ConnectionLoop {
            source: Arc::clone(&self.source),
            policy: self.policy,
            handler,
            status_tx: Arc::clone(&self.status_tx),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(control_loop.run());
        *control = Some(ControlLoop { cancel, handle });
    }

    /// Tear down the connection and cancel any pending reconnect. Never fails.
    pub async fn stop(&self) {
        let running = self.control.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!("Transport control loop ended abnormally: {}", e);
            }
            info!("Transport stopped for {}", self.source.describe());
        }
        self.status_tx
            .send_replace(ConnectionStatus::new(ConnectionState::Closed, 0));
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(running) = self.control.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

enum PumpEnd {
    Cancelled,
    Closed(Option<TransportError>),
}

struct ConnectionLoop {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    handler: Arc<dyn FrameHandler>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
}

impl ConnectionLoop {
    async fn run(self) {
        let target = self.source.describe();
        let mut attempt: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            self.publish(ConnectionState::Connecting, attempt, last_error.clone(), None);

            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.source.connect() => result,
            };

            match connected {
                Ok(mut stream) => {
                    attempt = 0;
                    last_error = None;
                    self.publish(ConnectionState::Open, 0, None, None);
                    info!("Telemetry stream connected: {}", target);

                    match self.pump(stream.as_mut()).await {
                        PumpEnd::Cancelled => {
                            stream.close().await;
                            return;
                        }
                        PumpEnd::Closed(Some(e)) => {
                            warn!("Telemetry stream error on {}: {}", target, e);
                            last_error = Some(e.to_string());
                        }
                        PumpEnd::Closed(None) => {
                            warn!("Telemetry stream closed by remote: {}", target);
                            let closed = TransportError::Closed("closed by remote".into());
                            last_error = Some(closed.to_string());
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", target, e);
                    last_error = Some(e.to_string());
                }
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                let exhausted = TransportError::MaxAttemptsExceeded(self.policy.max_attempts);
                error!("{} ({}); giving up until restarted", exhausted, target);
                let reason = match last_error {
                    Some(last) => format!("{} (last error: {})", exhausted, last),
                    None => exhausted.to_string(),
                };
                self.publish(
                    ConnectionState::Failed,
                    self.policy.max_attempts,
                    Some(reason),
                    None,
                );
                return;
            };

            warn!(
                "Reconnecting to {} in {}ms (attempt {}/{})",
                target,
                delay.as_millis(),
                attempt,
                self.policy.max_attempts
            );
            self.publish(
                ConnectionState::Closed,
                attempt,
                last_error.clone(),
                Some(delay.as_millis() as u64),
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&self, stream: &mut dyn EventStream) -> PumpEnd {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                frame = stream.next_frame() => frame,
            };
            match frame {
                Some(Ok(text)) => self.handler.handle_frame(&text),
                Some(Err(e)) => return PumpEnd::Closed(Some(e)),
                None => return PumpEnd::Closed(None),
            }
        }
    }

    fn publish(
        &self,
        state: ConnectionState,
        attempt: u32,
        last_error: Option<String>,
        retry_in_ms: Option<u64>,
    ) {
        self.status_tx.send_replace(ConnectionStatus {
            state,
            attempt,
            last_error,
            retry_in_ms,
        });
    }
}
