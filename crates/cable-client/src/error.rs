//! Error types for the cable client.

use cable_core::CableError;
use thiserror::Error;

/// Errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Protocol-level failure (framing, identifiers).
    #[error(transparent)]
    Cable(#[from] CableError),

    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The URL or handshake request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Subscription parameters are not a channel identifier.
    #[error("invalid subscription params: {0}")]
    InvalidParams(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
