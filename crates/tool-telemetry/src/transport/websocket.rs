use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{EventSource, EventStream};
use crate::config::TelemetryConfig;
use crate::error::TransportError;

/// WebSocket feed of telemetry frames (`ws://` or `wss://`).
pub struct WebSocketSource {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketSource {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(config.transport_url.clone(), config.connect_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    async fn connect(&self) -> Result<Box<dyn EventStream>, TransportError> {
        info!("Connecting to telemetry WebSocket: {}", self.url);

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))??;

        Ok(Box::new(WebSocketEventStream { ws }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketEventStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventStream for WebSocketEventStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.ws.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket close frame received: {:?}", frame);
                    return None;
                }
                Ok(Message::Binary(_)) => {
                    debug!("Ignoring binary WebSocket frame");
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}
