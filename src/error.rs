use thiserror::Error;

/// Errors surfaced by the relay library.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A frame that was not valid protocol JSON.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The peer's outbound channel is gone or backed up; the transport is
    /// treated as closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// A command named an agent the registry does not know.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The session controller exhausted its reconnect attempts.
    #[error("reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { attempts: u32 },
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
