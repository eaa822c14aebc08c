//! In-process adapter.

use super::PubSubAdapter;
use crate::error::Result;
use crate::subscriber_map::SubscriberMap;
use async_trait::async_trait;

/// Adapter for single-process deployments. Broadcasts go straight to the
/// local subscriber map.
#[derive(Debug, Default)]
pub struct InlineAdapter {
    subscribers: SubscriberMap,
}

impl InlineAdapter {
    /// Create an adapter with an empty map.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubAdapter for InlineAdapter {
    async fn broadcast(&self, stream: &str, payload: &str) -> Result<()> {
        self.subscribers.broadcast(stream, payload);
        Ok(())
    }

    fn subscriber_map(&self) -> &SubscriberMap {
        &self.subscribers
    }
}
