//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tool_telemetry::{ConnectionStatus, EventSource, EventStream, TransportError};

enum Script {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<String>),
}

/// In-process [`EventSource`] whose connection attempts are scripted up front.
///
/// Once the script runs out every further attempt is refused.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Script>>,
    connects: Mutex<Vec<Instant>>,
    origin: Instant,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            connects: Mutex::new(Vec::new()),
            origin: Instant::now(),
        })
    }

    pub fn refuse(&self, times: usize) {
        let mut script = self.script.lock();
        for _ in 0..times {
            script.push_back(Script::Refuse("connection refused".to_string()));
        }
    }

    /// Queue a successful connection. Frames sent on the returned sender are
    /// delivered in order; dropping it closes the connection from the remote side.
    pub fn accept(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Script::Accept(rx));
        tx
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    /// Milliseconds from fixture creation to each connection attempt.
    pub fn connect_offsets_ms(&self) -> Vec<u128> {
        self.connects
            .lock()
            .iter()
            .map(|at| at.duration_since(self.origin).as_millis())
            .collect()
    }

    pub fn connect_gaps_ms(&self) -> Vec<u128> {
        self.connect_offsets_ms()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn connect(&self) -> Result<Box<dyn EventStream>, TransportError> {
        self.connects.lock().push(Instant::now());
        let next = self.script.lock().pop_front();
        match next {
            Some(Script::Accept(rx)) => Ok(Box::new(ChannelStream { rx })),
            Some(Script::Refuse(reason)) => Err(TransportError::Connect(reason)),
            None => Err(TransportError::Connect("connection refused".to_string())),
        }
    }

    fn describe(&self) -> String {
        "scripted source".to_string()
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Wait until the published status satisfies `predicate`.
pub async fn wait_for_status<F>(rx: &mut watch::Receiver<ConnectionStatus>, predicate: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(300), rx.wait_for(predicate))
        .await
        .expect("status not reached in time")
        .expect("transport dropped")
        .clone()
}

/// Wait until the invalidation generation reaches `generation`.
pub async fn wait_for_generation(rx: &mut watch::Receiver<u64>, generation: u64) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|g| *g >= generation))
        .await
        .expect("generation not reached in time")
        .expect("bus dropped");
}

/// Builder for `tool_call` wire frames.
#[derive(Debug, Clone)]
pub struct CallFrame {
    id: String,
    request_id: String,
    tool: String,
    duration_ms: u64,
    sequence: Option<u64>,
    error: Option<String>,
    started_at: DateTime<Utc>,
}

impl CallFrame {
    pub fn new(id: &str, tool: &str, duration_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            request_id: "req_test".to_string(),
            tool: tool.to_string(),
            duration_ms,
            sequence: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn request(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn failed(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    pub fn at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn to_frame(&self) -> String {
        let mut data = json!({
            "id": self.id,
            "request_id": self.request_id,
            "tool_name": self.tool,
            "duration_ms": self.duration_ms,
            "status": if self.error.is_some() { "failed" } else { "success" },
            "input_tokens": 100,
            "output_tokens": 50,
        });
        if let Some(error) = &self.error {
            data["error_message"] = json!(error);
        }
        if let Some(sequence) = self.sequence {
            data["sequence"] = json!(sequence);
        }
        json!({
            "type": "tool_call",
            "data": data,
            "timestamp": self.started_at.timestamp_millis(),
        })
        .to_string()
    }
}
