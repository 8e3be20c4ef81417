//! Error types for the client.

use crate::config::ConfigError;
use crate::device::DeviceIdError;

/// Failures of a websocket session.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("Websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Unexpected frame during handshake: expected {expected}")]
    Handshake { expected: &'static str },
    #[error("Access token rejected: {0}")]
    AuthRejected(String),
    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DeviceId(#[from] DeviceIdError),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error("Failed to initialize logging: {0}")]
    Telemetry(String),
}
