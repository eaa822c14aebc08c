//! # Cable Core
//!
//! Server side of a real-time pub/sub "cable": long-lived client connections
//! subscribe to channels, channels stream from named broadcasting streams,
//! and a pluggable adapter fans broadcasts out to every process.
//!
//! ## Features
//!
//! - **Subscriber map**: stream name to callback registry shared by all
//!   connections of a process
//! - **Adapters**: in-process delivery ([`InlineAdapter`]) or an external
//!   notify/listen backend driven by one listener task ([`NetworkedAdapter`])
//! - **Channels**: application logic bound to one subscription, with deferred
//!   confirmation until every stream is live
//! - **Server**: connection registry, heartbeat and remote disconnects
//!
//! ## Example
//!
//! ```rust
//! use cable_core::{
//!     Channel, ChannelContext, ChannelRegistry, ConnectionIdentifiers, InlineAdapter, Server,
//!     ServerConfig,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct NewsChannel;
//!
//! #[async_trait::async_trait]
//! impl Channel for NewsChannel {
//!     async fn subscribed(&mut self, ctx: &mut ChannelContext) -> cable_core::Result<()> {
//!         ctx.stream_from("news");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cable_core::Result<()> {
//! let mut registry = ChannelRegistry::new();
//! registry.register_default::<NewsChannel>("NewsChannel");
//!
//! let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry);
//! let session = server.connect(ConnectionIdentifiers::new())?;
//! session
//!     .handle
//!     .receive(r#"{"command":"subscribe","identifier":"{\"channel\":\"NewsChannel\"}"}"#)?;
//!
//! server.broadcast("news", &serde_json::json!({"headline": "hello"})).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                    Server                       │
//! │  connection_id -> ConnectionHandle (inbox)      │
//! │        │                                        │
//! │  ┌─────▼──────────────┐   ┌──────────────────┐  │
//! │  │ Connection task    │   │  PubSubAdapter   │  │
//! │  │  └─> Subscriptions ├──►│  └─> SubscriberMap│ │
//! │  │       └─> Channels │   │  └─> listener    │  │
//! │  └────────────────────┘   └──────────────────┘  │
//! └────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod backoff;
pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod subscriber_map;
pub mod subscriptions;

// Re-export main types
pub use adapter::{
    FailurePolicy, InlineAdapter, LoopbackBackend, NetworkedAdapter, NetworkedConfig,
    Notification, NotifyBackend, NotifyListener, PubSubAdapter,
};
pub use backoff::Backoff;
pub use channel::{broadcasting_for, Channel, ChannelContext, ChannelRegistry};
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionIdentifiers, ConnectionSession, Transmitter,
};
pub use error::{CableError, Result};
pub use protocol::{
    is_supported_protocol, supported_protocols, ChannelIdentifier, Command, CommandKind,
    DisconnectReason, Frame, MessageType, PROTOCOLS,
};
pub use server::{Server, ServerConfig, ServerStats};
pub use subscriber_map::{StreamHooks, Subscriber, SubscriberMap, SuccessCallback};
pub use subscriptions::Subscriptions;
