use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
    },
    #[error("response decoding error: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("request was abandoned before completing")]
    Interrupted,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RequestError {
    /// 0 for network-level failures, the HTTP status otherwise.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::Http { status, .. } => *status,
            _ => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("channel is terminally closed")]
    Terminal,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
