use thiserror::Error;

/// Failures of the streaming connection.
///
/// These never reach query callers; the transport records them in
/// [`ConnectionStatus::last_error`](crate::transport::ConnectionStatus) instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Connection timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed after {0} reconnect attempts")]
    MaxAttemptsExceeded(u32),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::Closed(e.to_string())
            }
            WsError::Io(_) | WsError::Url(_) | WsError::Http(_) | WsError::HttpFormat(_) => {
                TransportError::Connect(e.to_string())
            }
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// A frame that could not be turned into a tool call event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Json(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e.to_string())
    }
}

/// Rejected query arguments. The store is never touched when this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid window: {hours} hours (expected 1..={max})")]
    InvalidWindow { hours: i64, max: u32 },

    #[error("Invalid limit: {limit} (expected 1..={max})")]
    InvalidLimit { limit: i64, max: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;
