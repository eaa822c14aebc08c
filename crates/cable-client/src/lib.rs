//! # Cable Client
//!
//! Client side of the cable protocol: a connection that survives network
//! failures, a keepalive monitor, and subscriptions that are re-established
//! after every reconnect.
//!
//! ## Features
//!
//! - **Connection**: one transport at a time, sub-protocol negotiation and
//!   reopen after a short delay
//! - **Monitor**: stale detection from server pings and reconnect backoff
//! - **Subscriptions**: create, remove and resubscribe on welcome, with a
//!   guarantor that retries until the server confirms
//! - **Transports**: WebSocket via tokio-tungstenite, plus an in-process
//!   transport for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use cable_client::{create_consumer, SubscriptionEvent};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cable_client::Result<()> {
//! let consumer = create_consumer("http://localhost:8080/cable");
//!
//! let room = consumer.subscriptions().create(
//!     json!({"channel": "ChatChannel", "room": "lobby"}),
//!     |event: SubscriptionEvent| {
//!         if let SubscriptionEvent::Received(message) = event {
//!             println!("{}", message);
//!         }
//!     },
//! )?;
//!
//! room.perform("speak", json!({"text": "hello"}))?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod consumer;
pub mod error;
pub mod monitor;
pub mod subscriptions;
pub mod transport;

// Re-export main types
pub use connection::{ClientConfig, Connection, TransportState};
pub use consumer::{create_consumer, websocket_url, Consumer, DEFAULT_MOUNT_PATH};
pub use error::{ClientError, Result};
pub use monitor::{ConnectionMonitor, MonitorAction, MonitorConfig, MonitorState};
pub use subscriptions::{
    event_channel, EventSender, Subscription, SubscriptionDelegate, SubscriptionEvent,
    Subscriptions,
};
pub use transport::{
    MemoryAcceptor, MemoryPeer, MemoryTransport, Transport, TransportCommand, TransportEvent,
    TransportSession, WebSocketTransport,
};
