use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventServerError {
    #[error("serializing match: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Error types for the Engine API client
#[derive(Debug, Error)]
pub enum EngineClientError {
    /// Socket not found
    #[error("Unix socket not found: {0}")]
    SocketNotFound(String),

    /// Failed to get metadata
    #[error("Failed to get metadata: {0}")]
    FailedToGetMetadata(String),

    /// No write permission
    #[error("No write permission: {0}")]
    NoWritePermission(String),

    /// No read permission
    #[error("No read permission: {0}")]
    NoReadPermission(String),

    /// Not a unix socket
    #[error("Not a unix socket: {0}")]
    NotASocket(String),

    /// C string conversion error
    #[error("C string conversion error: {0}")]
    CStringConversion(#[from] std::ffi::NulError),

    /// Socket connection error
    #[error("Failed to connect to socket: {0}")]
    SocketConnectionError(#[from] std::io::Error),

    /// WebSocket handshake error
    #[error("WebSocket error: {0}")]
    WebSocketError(Box<tokio_tungstenite::tungstenite::Error>),
}

/// Errors of an open match stream
#[derive(Debug, Error)]
pub enum WebsocketError {
    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Unsupported message type
    #[error("Unsupported message type")]
    UnsupportedMessageType,

    /// Connection error
    #[error("WebSocket connection error: {0}")]
    ConnectionError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for WebsocketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        WebsocketError::ConnectionError(err.to_string())
    }
}
