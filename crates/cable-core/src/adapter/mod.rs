//! Pub/sub adapters.
//!
//! An adapter owns a [`SubscriberMap`] and connects it to a notification
//! mechanism:
//!
//! - [`InlineAdapter`]: single process, broadcasts fan out synchronously.
//! - [`NetworkedAdapter`]: an external notify/listen backend, driven by one
//!   dedicated listener task.

mod inline;
mod loopback;
mod networked;

pub use inline::InlineAdapter;
pub use loopback::{LoopbackBackend, LoopbackListener};
pub use networked::{
    FailurePolicy, NetworkedAdapter, NetworkedConfig, Notification, NotifyBackend, NotifyListener,
};

use crate::error::Result;
use crate::subscriber_map::{Subscriber, SubscriberMap, SuccessCallback};
use async_trait::async_trait;

/// Backend-neutral pub/sub interface used by channels and the server.
#[async_trait]
pub trait PubSubAdapter: Send + Sync + 'static {
    /// Publish `payload` on `stream` to every subscriber in every process
    /// sharing this backend.
    async fn broadcast(&self, stream: &str, payload: &str) -> Result<()>;

    /// Register a subscriber. `on_success` fires once the stream is being
    /// listened to.
    fn subscribe(&self, stream: &str, subscriber: Subscriber, on_success: Option<SuccessCallback>) {
        self.subscriber_map()
            .add_subscriber(stream, subscriber, on_success);
    }

    /// Unregister a subscriber.
    fn unsubscribe(&self, stream: &str, subscriber: &Subscriber) {
        self.subscriber_map().remove_subscriber(stream, subscriber);
    }

    /// The local subscriber registry.
    fn subscriber_map(&self) -> &SubscriberMap;

    /// Stop background work. Idempotent.
    fn shutdown(&self) {}
}
