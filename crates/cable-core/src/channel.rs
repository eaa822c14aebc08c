//! Channels: application logic bound to one subscription.
//!
//! A channel is created per `subscribe` command, lives inside the
//! connection's subscription registry, and talks to the outside world through
//! its [`ChannelContext`]: streams it listens to, frames it transmits, and
//! broadcasts it publishes.

use crate::adapter::PubSubAdapter;
use crate::connection::{ConnectionIdentifiers, Transmitter};
use crate::error::{CableError, Result};
use crate::protocol::{ChannelIdentifier, Frame};
use crate::subscriber_map::Subscriber;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Application-defined channel behavior.
///
/// Hooks run on the owning connection's task, one command at a time.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Called once when the subscription is created. Register streams here,
    /// or call [`ChannelContext::reject`] to refuse the subscription.
    async fn subscribed(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the subscription is torn down. Streams are released
    /// afterwards regardless of the outcome.
    async fn unsubscribed(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
        Ok(())
    }

    /// Perform a named action sent by the client. Data without an `action`
    /// field arrives as `receive`.
    async fn perform(&mut self, ctx: &mut ChannelContext, action: &str, _data: Value) -> Result<()> {
        Err(CableError::UnknownAction {
            channel: ctx.channel_name().to_string(),
            action: action.to_string(),
        })
    }
}

/// Builds a channel for a decoded identifier.
pub type ChannelFactory = Arc<dyn Fn(&ChannelIdentifier) -> Box<dyn Channel> + Send + Sync>;

/// Channel classes available to clients, keyed by the identifier's
/// `channel` field.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, ChannelFactory>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel factory under `name`.
    pub fn register<C, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        C: Channel,
        F: Fn(&ChannelIdentifier) -> C + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move |identifier| Box::new(factory(identifier)) as Box<dyn Channel>),
        );
        self
    }

    /// Register a channel built with `Default`.
    pub fn register_default<C>(&mut self, name: impl Into<String>) -> &mut Self
    where
        C: Channel + Default,
    {
        self.register(name, |_| C::default())
    }

    /// Instantiate the channel named by `identifier`.
    pub fn build(&self, identifier: &ChannelIdentifier) -> Option<Box<dyn Channel>> {
        self.factories
            .get(&identifier.channel)
            .map(|factory| factory(identifier))
    }

    /// Whether a channel is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered channel names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.names())
            .finish()
    }
}

/// Stream prefix derived from a channel class name:
/// `ChatChannel` -> `chat`, `Admin::AppearanceChannel` -> `admin:appearance`.
pub fn channel_stream_prefix(channel: &str) -> String {
    let name = channel.strip_suffix("Channel").unwrap_or(channel);
    let name = name.replace("::", ":");

    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Stream name for a model-like key on a channel.
pub fn broadcasting_for(channel: &str, key: &str) -> String {
    format!("{}:{}", channel_stream_prefix(channel), key)
}

#[derive(Debug, Default)]
struct GateState {
    pending: usize,
    ready: bool,
    settled: bool,
}

/// Defers the subscription confirmation until `subscribed` returned and every
/// stream registered during it is being listened to.
#[derive(Debug, Default)]
pub(crate) struct ConfirmationGate {
    state: Mutex<GateState>,
}

impl ConfirmationGate {
    fn stream_pending(&self) {
        let mut state = self.state.lock();
        if !state.settled {
            state.pending += 1;
        }
    }

    /// Returns true when the caller must send the confirmation.
    fn stream_confirmed(&self) -> bool {
        let mut state = self.state.lock();
        if state.settled {
            return false;
        }
        state.pending = state.pending.saturating_sub(1);
        if state.ready && state.pending == 0 {
            state.settled = true;
            return true;
        }
        false
    }

    /// Returns true when the caller must send the confirmation.
    pub(crate) fn mark_ready(&self) -> bool {
        let mut state = self.state.lock();
        if state.settled {
            return false;
        }
        state.ready = true;
        if state.pending == 0 {
            state.settled = true;
            return true;
        }
        false
    }

    pub(crate) fn cancel(&self) {
        self.state.lock().settled = true;
    }
}

/// Everything a channel can do, scoped to one subscription.
pub struct ChannelContext {
    identifier: String,
    decoded: ChannelIdentifier,
    connection_identifiers: ConnectionIdentifiers,
    transmitter: Transmitter,
    adapter: Arc<dyn PubSubAdapter>,
    streams: Vec<(String, Subscriber)>,
    gate: Arc<ConfirmationGate>,
    rejected: bool,
}

impl ChannelContext {
    pub(crate) fn new(
        identifier: String,
        decoded: ChannelIdentifier,
        connection_identifiers: ConnectionIdentifiers,
        transmitter: Transmitter,
        adapter: Arc<dyn PubSubAdapter>,
    ) -> Self {
        Self {
            identifier,
            decoded,
            connection_identifiers,
            transmitter,
            adapter,
            streams: Vec::new(),
            gate: Arc::new(ConfirmationGate::default()),
            rejected: false,
        }
    }

    /// Raw subscription identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Channel class name from the identifier.
    pub fn channel_name(&self) -> &str {
        &self.decoded.channel
    }

    /// Decoded identifier parameters.
    pub fn params(&self) -> &ChannelIdentifier {
        &self.decoded
    }

    /// Identity the connection was established with.
    pub fn connection_identifiers(&self) -> &ConnectionIdentifiers {
        &self.connection_identifiers
    }

    /// Handle for sending frames to this subscription's connection.
    pub fn transmitter(&self) -> Transmitter {
        self.transmitter.clone()
    }

    /// Forward broadcasts on `stream` to the client, JSON-decoded.
    pub fn stream_from(&mut self, stream: impl Into<String>) {
        let identifier = self.identifier.clone();
        let transmitter = self.transmitter.clone();
        self.stream_from_with(stream, move |payload| {
            let message = serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string()));
            transmitter.send_frame(&Frame::message(identifier.clone(), message))
        });
    }

    /// Handle broadcasts on `stream` with a custom callback.
    ///
    /// The callback runs on the adapter's delivery context and must not
    /// block.
    pub fn stream_from_with<F>(&mut self, stream: impl Into<String>, callback: F)
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        let stream = stream.into();
        let subscriber = Subscriber::new(callback);

        self.gate.stream_pending();
        let gate = self.gate.clone();
        let transmitter = self.transmitter.clone();
        let identifier = self.identifier.clone();
        let on_success = Box::new(move || {
            if gate.stream_confirmed() {
                let _ = transmitter.send_frame(&Frame::confirmation(identifier));
            }
        });

        debug!(
            connection_id = %self.transmitter.connection_id(),
            channel = %self.decoded.channel,
            stream = %stream,
            "Streaming from"
        );
        self.streams.push((stream.clone(), subscriber.clone()));
        self.adapter.subscribe(&stream, subscriber, Some(on_success));
    }

    /// Stream from the broadcasting for `key` on this channel.
    pub fn stream_for(&mut self, key: &str) {
        let stream = broadcasting_for(&self.decoded.channel, key);
        self.stream_from(stream);
    }

    /// Stop every registration on `stream`.
    pub fn stop_stream_from(&mut self, stream: &str) {
        let adapter = self.adapter.clone();
        self.streams.retain(|(name, subscriber)| {
            if name == stream {
                adapter.unsubscribe(name, subscriber);
                false
            } else {
                true
            }
        });
    }

    /// Release every stream registration.
    pub fn stop_all_streams(&mut self) {
        for (stream, subscriber) in self.streams.drain(..) {
            self.adapter.unsubscribe(&stream, &subscriber);
        }
    }

    /// Names of the streams currently registered.
    pub fn streams(&self) -> Vec<&str> {
        self.streams.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// Publish `payload` on `stream` through the adapter.
    pub async fn broadcast_to(&self, stream: &str, payload: &Value) -> Result<()> {
        self.adapter.broadcast(stream, &payload.to_string()).await
    }

    /// Send a data message to this subscription's client.
    pub fn transmit(&self, message: Value) -> Result<()> {
        self.transmitter
            .send_frame(&Frame::message(self.identifier.clone(), message))
    }

    /// Refuse the subscription. Only meaningful inside `subscribed`.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    /// Whether [`reject`](Self::reject) was called.
    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub(crate) fn gate(&self) -> &ConfirmationGate {
        &self.gate
    }
}

impl Drop for ChannelContext {
    fn drop(&mut self) {
        self.gate.cancel();
        self.stop_all_streams();
    }
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("identifier", &self.identifier)
            .field("streams", &self.streams())
            .field("rejected", &self.rejected)
            .finish()
    }
}
