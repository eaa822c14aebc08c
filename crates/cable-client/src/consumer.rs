//! Application entry point: one consumer per server.

use crate::connection::{ClientConfig, Connection};
use crate::subscriptions::Subscriptions;
use crate::transport::{Transport, WebSocketTransport};
use cable_core::Command;
use std::sync::Arc;

/// Default mount path of a cable server.
pub const DEFAULT_MOUNT_PATH: &str = "/cable";

/// Rewrite an `http(s)` URL to the matching `ws(s)` scheme. Other URLs pass
/// through unchanged.
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

/// Holds the connection and the subscriptions of one client.
///
/// The connection opens lazily when the first subscription is created, or
/// explicitly through [`Consumer::connect`].
#[derive(Debug, Clone)]
pub struct Consumer {
    connection: Connection,
}

impl Consumer {
    /// Create a consumer over any transport.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            connection: Connection::new(transport, config),
        }
    }

    /// Create a consumer talking WebSocket to `url`. `http(s)` URLs are
    /// rewritten to `ws(s)`.
    pub fn websocket(url: &str, config: ClientConfig) -> Self {
        Self::new(
            Arc::new(WebSocketTransport::new(websocket_url(url))),
            config,
        )
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Subscriptions of this consumer.
    pub fn subscriptions(&self) -> Subscriptions {
        self.connection.subscriptions()
    }

    /// Open the connection. Returns false if it is already active.
    pub fn connect(&self) -> bool {
        self.connection.open()
    }

    /// Close the connection for good.
    pub fn disconnect(&self) {
        self.connection.close(false);
    }

    /// Write a raw command.
    pub fn send(&self, command: &Command) -> bool {
        self.connection.send(command)
    }

    /// Open the connection unless it is already open or opening.
    pub fn ensure_active_connection(&self) -> bool {
        if self.connection.is_active() {
            false
        } else {
            self.connection.open()
        }
    }
}

/// Create a WebSocket consumer with the default configuration.
pub fn create_consumer(url: &str) -> Consumer {
    Consumer::websocket(url, ClientConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_websocket_url() {
        assert_eq!(websocket_url("http://localhost:3000/cable"), "ws://localhost:3000/cable");
        assert_eq!(websocket_url("https://example.com/cable"), "wss://example.com/cable");
        assert_eq!(websocket_url("wss://example.com/cable"), "wss://example.com/cable");
    }

    #[tokio::test]
    async fn test_ensure_active_connection_opens_once() {
        let (transport, mut acceptor) = MemoryTransport::pair(Some("actioncable-v1-json"));
        let consumer = Consumer::new(Arc::new(transport), ClientConfig::default());

        assert!(consumer.ensure_active_connection());
        assert!(!consumer.ensure_active_connection());
        assert!(!consumer.connect());
        assert!(acceptor.accept().await.is_some());
        assert!(acceptor.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_stops_monitor() {
        let (transport, mut acceptor) = MemoryTransport::pair(Some("actioncable-v1-json"));
        let consumer = Consumer::new(Arc::new(transport), ClientConfig::default());

        consumer.connect();
        let mut peer = acceptor.accept().await.unwrap();
        consumer.disconnect();

        assert_eq!(peer.recv().await, None);
        assert!(!consumer.connection().monitor().is_running());
    }
}
