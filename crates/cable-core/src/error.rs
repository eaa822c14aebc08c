//! Error types for the cable core.

use thiserror::Error;

/// Errors that can occur while routing commands and broadcasts.
#[derive(Debug, Error)]
pub enum CableError {
    /// A `message` or lookup targeted an identifier with no live channel.
    #[error("unable to find subscription with identifier: {0}")]
    SubscriptionNotFound(String),

    /// No channel factory is registered under this name.
    #[error("channel not found: {0}")]
    UnknownChannel(String),

    /// The subscription identifier could not be decoded.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A channel was asked to perform an action it does not expose.
    #[error("unable to process {channel}#{action}")]
    UnknownAction {
        /// Channel name.
        channel: String,
        /// Requested action.
        action: String,
    },

    /// The inbound frame is not a well-formed command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Connection limit exceeded.
    #[error("connection limit exceeded: max {0} connections")]
    ConnectionLimit(usize),

    /// The connection's outbound queue is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failure raised by channel application code.
    #[error("channel error: {0}")]
    Channel(String),

    /// A stream callback failed.
    #[error("callback failed: {0}")]
    Callback(String),

    /// The pub/sub backend failed or is unavailable.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CableError {
    /// Build an application error from anything displayable.
    pub fn channel(message: impl std::fmt::Display) -> Self {
        CableError::Channel(message.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CableError>;
