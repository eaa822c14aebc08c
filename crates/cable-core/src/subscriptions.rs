//! Per-connection registry of channel subscriptions and command dispatch.

use crate::adapter::PubSubAdapter;
use crate::channel::{Channel, ChannelContext, ChannelRegistry};
use crate::connection::{ConnectionIdentifiers, Transmitter};
use crate::error::{CableError, Result};
use crate::protocol::{ChannelIdentifier, Command, CommandKind, Frame};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// How many error sources are logged when a command fails.
const ERROR_CHAIN_DEPTH: usize = 5;

struct ChannelInstance {
    channel: Box<dyn Channel>,
    ctx: ChannelContext,
}

impl ChannelInstance {
    /// Run the `unsubscribed` hook and release every stream, even when the
    /// hook fails or panics.
    async fn unsubscribe(mut self) {
        let outcome = AssertUnwindSafe(self.channel.unsubscribed(&mut self.ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    identifier = %self.ctx.identifier(),
                    error = %e,
                    causes = %error_chain(&e),
                    "Unsubscribed callback failed"
                );
            }
            Err(panic) => {
                error!(
                    identifier = %self.ctx.identifier(),
                    panic = %panic_message(panic.as_ref()),
                    "Unsubscribed callback panicked"
                );
            }
        }
        self.ctx.stop_all_streams();
    }
}

/// Active channel instances of one connection, keyed by identifier.
pub struct Subscriptions {
    transmitter: Transmitter,
    connection_identifiers: ConnectionIdentifiers,
    adapter: Arc<dyn PubSubAdapter>,
    registry: Arc<ChannelRegistry>,
    channels: HashMap<String, ChannelInstance>,
    subscribed_total: Arc<AtomicU64>,
}

impl Subscriptions {
    /// Create an empty registry for one connection.
    pub fn new(
        transmitter: Transmitter,
        connection_identifiers: ConnectionIdentifiers,
        adapter: Arc<dyn PubSubAdapter>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            transmitter,
            connection_identifiers,
            adapter,
            registry,
            channels: HashMap::new(),
            subscribed_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share a counter incremented on every established subscription.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.set_counter(counter);
        self
    }

    pub(crate) fn set_counter(&mut self, counter: Arc<AtomicU64>) {
        self.subscribed_total = counter;
    }

    /// Route one command. Never fails: errors and panics raised while
    /// handling it are logged and the connection carries on.
    pub async fn execute_command(&mut self, command: &Command) {
        let outcome = AssertUnwindSafe(self.dispatch(command)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    connection_id = %self.transmitter.connection_id(),
                    command = %command.command,
                    identifier = %command.identifier,
                    error = %e,
                    causes = %error_chain(&e),
                    "Could not execute command"
                );
            }
            Err(panic) => {
                error!(
                    connection_id = %self.transmitter.connection_id(),
                    command = %command.command,
                    identifier = %command.identifier,
                    panic = %panic_message(panic.as_ref()),
                    "Command handler panicked"
                );
            }
        }
    }

    async fn dispatch(&mut self, command: &Command) -> Result<()> {
        match command.kind() {
            Some(CommandKind::Subscribe) => self.add(&command.identifier).await,
            Some(CommandKind::Unsubscribe) => self.remove(&command.identifier).await.map(|_| ()),
            Some(CommandKind::Message) => {
                let data = command.decoded_data()?;
                self.perform_action(&command.identifier, data).await
            }
            None => {
                error!(
                    connection_id = %self.transmitter.connection_id(),
                    command = %command.command,
                    "Received unrecognized command"
                );
                Ok(())
            }
        }
    }

    /// Create and register the channel named by `identifier`.
    ///
    /// Unknown channel names and duplicate identifiers are logged and
    /// ignored. A channel whose `subscribed` hook fails is not registered and
    /// its streams are released.
    pub async fn add(&mut self, identifier: &str) -> Result<()> {
        let decoded = ChannelIdentifier::parse(identifier)?;

        if self.channels.contains_key(identifier) {
            error!(
                connection_id = %self.transmitter.connection_id(),
                channel = %decoded.channel,
                "Already subscribed"
            );
            return Ok(());
        }

        let Some(mut channel) = self.registry.build(&decoded) else {
            error!(
                connection_id = %self.transmitter.connection_id(),
                channel = %decoded.channel,
                "Subscription class not found"
            );
            return Ok(());
        };

        let channel_name = decoded.channel.clone();
        let mut ctx = ChannelContext::new(
            identifier.to_string(),
            decoded,
            self.connection_identifiers.clone(),
            self.transmitter.clone(),
            self.adapter.clone(),
        );

        channel.subscribed(&mut ctx).await?;

        if ctx.is_rejected() {
            ctx.gate().cancel();
            ctx.stop_all_streams();
            info!(
                connection_id = %self.transmitter.connection_id(),
                channel = %channel_name,
                "Subscription rejected"
            );
            self.transmitter.send_frame(&Frame::rejection(identifier))?;
            return Ok(());
        }

        if ctx.gate().mark_ready() {
            self.transmitter.send_frame(&Frame::confirmation(identifier))?;
        }

        debug!(
            connection_id = %self.transmitter.connection_id(),
            channel = %channel_name,
            "Subscribed"
        );
        self.channels
            .insert(identifier.to_string(), ChannelInstance { channel, ctx });
        self.subscribed_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Tear down the channel for `identifier`. Returns whether one existed.
    pub async fn remove(&mut self, identifier: &str) -> Result<bool> {
        match self.channels.remove(identifier) {
            Some(instance) => {
                debug!(
                    connection_id = %self.transmitter.connection_id(),
                    channel = %instance.ctx.channel_name(),
                    "Unsubscribing"
                );
                instance.unsubscribe().await;
                Ok(true)
            }
            None => {
                debug!(
                    connection_id = %self.transmitter.connection_id(),
                    identifier = %identifier,
                    "Unsubscribe for unknown identifier"
                );
                Ok(false)
            }
        }
    }

    /// Invoke the action named by `data.action` (or `receive`) on the
    /// channel for `identifier`.
    pub async fn perform_action(&mut self, identifier: &str, data: Value) -> Result<()> {
        let instance = self
            .channels
            .get_mut(identifier)
            .ok_or_else(|| CableError::SubscriptionNotFound(identifier.to_string()))?;

        let action = data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("receive")
            .to_string();

        instance
            .channel
            .perform(&mut instance.ctx, &action, data)
            .await
    }

    /// Tear down every channel.
    pub async fn unsubscribe_from_all(&mut self) {
        let channels: Vec<ChannelInstance> = self.channels.drain().map(|(_, c)| c).collect();
        for instance in channels {
            instance.unsubscribe().await;
        }
    }

    /// Identifiers of the live channels.
    pub fn identifiers(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Whether a channel is live for `identifier`.
    pub fn contains(&self, identifier: &str) -> bool {
        self.channels.contains_key(identifier)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is live.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("connection_id", &self.transmitter.connection_id())
            .field("identifiers", &self.identifiers())
            .finish()
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        if causes.len() == ERROR_CHAIN_DEPTH {
            break;
        }
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes.join(" | ")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InlineAdapter;
    use crate::protocol::MessageType;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const CHAT: &str = r#"{"channel":"ChatChannel","room":"1"}"#;

    struct ChatChannel {
        room: String,
    }

    #[async_trait]
    impl Channel for ChatChannel {
        async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
            ctx.stream_from(format!("chat_{}", self.room));
            Ok(())
        }

        async fn perform(&mut self, ctx: &mut ChannelContext, action: &str, data: Value) -> Result<()> {
            match action {
                "speak" => {
                    ctx.broadcast_to(&format!("chat_{}", self.room), &data["text"])
                        .await
                }
                "explode" => panic!("kaboom"),
                _ => Err(CableError::UnknownAction {
                    channel: ctx.channel_name().to_string(),
                    action: action.to_string(),
                }),
            }
        }
    }

    struct RejectingChannel;

    #[async_trait]
    impl Channel for RejectingChannel {
        async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
            ctx.stream_from("secret");
            ctx.reject();
            Ok(())
        }
    }

    struct FailingChannel;

    #[async_trait]
    impl Channel for FailingChannel {
        async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
            ctx.stream_from("doomed");
            Err(CableError::channel("database unavailable"))
        }
    }

    struct SulkyChannel;

    #[async_trait]
    impl Channel for SulkyChannel {
        async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
            ctx.stream_from("sulky");
            Ok(())
        }

        async fn unsubscribed(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
            panic!("refusing to leave");
        }
    }

    const SULKY: &str = r#"{"channel":"SulkyChannel"}"#;

    fn registry() -> Arc<ChannelRegistry> {
        let mut registry = ChannelRegistry::new();
        registry.register("ChatChannel", |id| ChatChannel {
            room: id.param_str("room").unwrap_or_default(),
        });
        registry.register("RejectingChannel", |_| RejectingChannel);
        registry.register("FailingChannel", |_| FailingChannel);
        registry.register("SulkyChannel", |_| SulkyChannel);
        Arc::new(registry)
    }

    fn subscriptions() -> (
        Subscriptions,
        Arc<InlineAdapter>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let adapter = Arc::new(InlineAdapter::new());
        let (transmitter, rx) = Transmitter::channel("conn-1");
        let subs = Subscriptions::new(
            transmitter,
            ConnectionIdentifiers::new(),
            adapter.clone(),
            registry(),
        );
        (subs, adapter, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Frame {
        Frame::decode(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_confirms_and_streams() {
        let (mut subs, adapter, mut rx) = subscriptions();

        subs.execute_command(&Command::subscribe(CHAT)).await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame.kind, Some(MessageType::Confirmation));
        assert_eq!(frame.identifier.as_deref(), Some(CHAT));
        assert!(subs.contains(CHAT));
        assert!(adapter.subscriber_map().is_listening("chat_1"));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_ignored() {
        let (mut subs, adapter, mut rx) = subscriptions();

        subs.execute_command(&Command::subscribe(CHAT)).await;
        subs.execute_command(&Command::subscribe(CHAT)).await;

        assert_eq!(subs.len(), 1);
        assert_eq!(adapter.subscriber_map().subscriber_count("chat_1"), 1);
        next_frame(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_ignored() {
        let (mut subs, _adapter, mut rx) = subscriptions();

        subs.execute_command(&Command::subscribe(r#"{"channel":"NopeChannel"}"#))
            .await;

        assert!(subs.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_streams() {
        let (mut subs, adapter, _rx) = subscriptions();

        subs.execute_command(&Command::subscribe(CHAT)).await;
        subs.execute_command(&Command::unsubscribe(CHAT)).await;

        assert!(subs.is_empty());
        assert!(adapter.subscriber_map().streams().is_empty());
    }

    #[tokio::test]
    async fn test_perform_after_unsubscribe_is_not_found() {
        let (mut subs, _adapter, _rx) = subscriptions();

        subs.add(CHAT).await.unwrap();
        assert!(subs.remove(CHAT).await.unwrap());

        let result = subs
            .perform_action(CHAT, serde_json::json!({"action": "speak", "text": "hi"}))
            .await;
        assert!(matches!(result, Err(CableError::SubscriptionNotFound(_))));

        // Through the dispatcher the same failure is swallowed.
        let cmd = Command::message(CHAT, &serde_json::json!({"action": "speak"})).unwrap();
        subs.execute_command(&cmd).await;
    }

    #[tokio::test]
    async fn test_perform_broadcasts_to_stream() {
        let (mut subs, _adapter, mut rx) = subscriptions();

        subs.add(CHAT).await.unwrap();
        next_frame(&mut rx);

        let cmd = Command::message(CHAT, &serde_json::json!({"action": "speak", "text": "hi"}))
            .unwrap();
        subs.execute_command(&cmd).await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame.identifier.as_deref(), Some(CHAT));
        assert_eq!(frame.message, Some(Value::String("hi".into())));
    }

    #[tokio::test]
    async fn test_unknown_action_is_logged() {
        let (mut subs, _adapter, mut rx) = subscriptions();

        subs.add(CHAT).await.unwrap();
        next_frame(&mut rx);

        let result = subs
            .perform_action(CHAT, serde_json::json!({"action": "fly"}))
            .await;
        assert!(matches!(result, Err(CableError::UnknownAction { .. })));
        assert!(subs.contains(CHAT));
    }

    #[tokio::test]
    async fn test_panicking_action_does_not_escape() {
        let (mut subs, _adapter, mut rx) = subscriptions();

        subs.add(CHAT).await.unwrap();
        next_frame(&mut rx);

        let cmd = Command::message(CHAT, &serde_json::json!({"action": "explode"})).unwrap();
        subs.execute_command(&cmd).await;

        assert!(subs.contains(CHAT));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_command_sends_nothing() {
        let (mut subs, _adapter, mut rx) = subscriptions();

        let cmd = Command::decode(r#"{"command":"explode","identifier":"{}"}"#).unwrap();
        subs.execute_command(&cmd).await;

        assert!(rx.try_recv().is_err());
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_rejection() {
        let (mut subs, adapter, mut rx) = subscriptions();
        let id = r#"{"channel":"RejectingChannel"}"#;

        subs.execute_command(&Command::subscribe(id)).await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame.kind, Some(MessageType::Rejection));
        assert!(!subs.contains(id));
        assert!(!adapter.subscriber_map().is_listening("secret"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_subscribed_hook_leaves_no_state() {
        let (mut subs, adapter, mut rx) = subscriptions();
        let id = r#"{"channel":"FailingChannel"}"#;

        subs.execute_command(&Command::subscribe(id)).await;

        assert!(!subs.contains(id));
        assert!(!adapter.subscriber_map().is_listening("doomed"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_identifier() {
        let (mut subs, _adapter, _rx) = subscriptions();
        assert!(matches!(
            subs.add("not json").await,
            Err(CableError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_from_all() {
        let (mut subs, adapter, _rx) = subscriptions();

        subs.add(CHAT).await.unwrap();
        subs.add(r#"{"channel":"ChatChannel","room":"2"}"#).await.unwrap();
        assert_eq!(subs.len(), 2);

        subs.unsubscribe_from_all().await;
        assert!(subs.is_empty());
        assert!(adapter.subscriber_map().streams().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_unsubscribed_still_releases_streams() {
        let (mut subs, adapter, _rx) = subscriptions();

        subs.add(SULKY).await.unwrap();
        assert!(subs.remove(SULKY).await.unwrap());
        assert!(!adapter.subscriber_map().is_listening("sulky"));

        subs.add(SULKY).await.unwrap();
        subs.add(CHAT).await.unwrap();
        subs.unsubscribe_from_all().await;
        assert!(subs.is_empty());
        assert!(adapter.subscriber_map().streams().is_empty());
    }

    #[test]
    fn test_error_chain() {
        let inner = serde_json::from_str::<Value>("{").unwrap_err();
        let expected = inner.to_string();
        let err = CableError::from(inner);
        assert_eq!(error_chain(&err), expected);

        assert_eq!(error_chain(&CableError::ConnectionClosed), "");
    }
}
