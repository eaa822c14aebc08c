//! Client-side subscriptions and the subscription guarantor.

use crate::error::{ClientError, Result};
use cable_core::{ChannelIdentifier, Command};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle event delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The server confirmed the subscription.
    Connected {
        /// Whether this confirmation follows a reconnect.
        reconnected: bool,
    },
    /// The server refused the subscription. It has been removed.
    Rejected,
    /// A message arrived for this subscription.
    Received(Value),
    /// The connection was lost.
    Disconnected {
        /// Whether the connection will try to come back.
        will_attempt_reconnect: bool,
    },
}

/// Application callbacks for one subscription.
///
/// Called from the connection's dispatch task; must not block.
pub trait SubscriptionDelegate: Send + Sync + 'static {
    /// Handle an event.
    fn on_event(&self, event: SubscriptionEvent);
}

/// Delegate that forwards events into a channel.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<SubscriptionEvent>);

impl SubscriptionDelegate for EventSender {
    fn on_event(&self, event: SubscriptionEvent) {
        let _ = self.0.send(event);
    }
}

/// A delegate paired with the receiver its events arrive on.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<SubscriptionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}

impl<F> SubscriptionDelegate for F
where
    F: Fn(SubscriptionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: SubscriptionEvent) {
        self(event)
    }
}

/// What subscriptions need from the connection.
pub(crate) trait CommandSink: Send + Sync + 'static {
    /// Write a command if the transport is open.
    fn send_command(&self, command: &Command) -> bool;

    /// Open the connection unless it is open or opening.
    fn ensure_active(&self);
}

struct SubscriptionInner {
    id: u64,
    identifier: String,
    delegate: Box<dyn SubscriptionDelegate>,
    registry: Weak<Registry>,
}

/// Handle to one client subscription. Clones refer to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Serialized channel identifier.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Invoke `action` on the server channel with `data`.
    pub fn perform(&self, action: &str, data: Value) -> Result<bool> {
        let mut data = match data {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ClientError::InvalidParams(format!(
                    "action data must be an object, got {}",
                    other
                )))
            }
        };
        data.insert("action".to_string(), Value::String(action.to_string()));
        self.send(Value::Object(data))
    }

    /// Send a `message` command carrying `data`. Returns whether it was
    /// written.
    pub fn send(&self, data: Value) -> Result<bool> {
        let command = Command::message(self.identifier(), &data)?;
        Ok(match self.inner.registry.upgrade() {
            Some(registry) => registry.send_command(&command),
            None => false,
        })
    }

    /// Remove this subscription.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            Subscriptions { registry }.remove(self);
        }
    }

    fn notify(&self, event: SubscriptionEvent) {
        self.inner.delegate.on_event(event);
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("identifier", &self.inner.identifier)
            .finish()
    }
}

#[derive(Default)]
struct GuarantorState {
    pending: Vec<Subscription>,
    running: bool,
}

/// Re-sends `subscribe` for pending subscriptions until they are confirmed.
struct Guarantor {
    interval: Duration,
    state: Mutex<GuarantorState>,
}

impl Guarantor {
    fn guarantee(&self, subscription: &Subscription, registry: Weak<Registry>) {
        let mut state = self.state.lock();
        if !state.pending.contains(subscription) {
            state.pending.push(subscription.clone());
        }
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        let interval = self.interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };

                let pending = {
                    let mut state = registry.guarantor.state.lock();
                    if state.pending.is_empty() {
                        state.running = false;
                        break;
                    }
                    state.pending.clone()
                };

                for subscription in pending {
                    trace!(identifier = %subscription.identifier(), "Guarantor resubscribing");
                    registry.send_command(&Command::subscribe(subscription.identifier()));
                }
            }
        });
    }

    fn forget(&self, subscription: &Subscription) {
        self.state.lock().pending.retain(|s| s != subscription);
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

struct Registry {
    sink: Weak<dyn CommandSink>,
    subscriptions: Mutex<Vec<Subscription>>,
    guarantor: Guarantor,
}

impl Registry {
    fn send_command(&self, command: &Command) -> bool {
        match self.sink.upgrade() {
            Some(sink) => sink.send_command(command),
            None => false,
        }
    }
}

/// The collection of subscriptions of one client connection.
#[derive(Clone)]
pub struct Subscriptions {
    registry: Arc<Registry>,
}

impl Subscriptions {
    pub(crate) fn new(sink: Weak<dyn CommandSink>, guarantee_interval: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                sink,
                subscriptions: Mutex::new(Vec::new()),
                guarantor: Guarantor {
                    interval: guarantee_interval,
                    state: Mutex::new(GuarantorState::default()),
                },
            }),
        }
    }

    /// Subscribe to the channel described by `params`, e.g.
    /// `{"channel": "ChatChannel", "room": "1"}` or just `"ChatChannel"`.
    pub fn create<D>(&self, params: Value, delegate: D) -> Result<Subscription>
    where
        D: SubscriptionDelegate,
    {
        let params = match params {
            Value::String(channel) => serde_json::json!({ "channel": channel }),
            other => other,
        };
        let identifier = ChannelIdentifier::parse(&params.to_string())
            .map_err(|e| ClientError::InvalidParams(e.to_string()))?
            .encode();

        let subscription = Subscription {
            inner: Arc::new(SubscriptionInner {
                id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
                identifier,
                delegate: Box::new(delegate),
                registry: Arc::downgrade(&self.registry),
            }),
        };
        Ok(self.add(subscription))
    }

    /// Register a subscription, open the connection if needed and subscribe.
    pub fn add(&self, subscription: Subscription) -> Subscription {
        self.registry.subscriptions.lock().push(subscription.clone());
        if let Some(sink) = self.registry.sink.upgrade() {
            sink.ensure_active();
        }
        self.subscribe(&subscription);
        subscription
    }

    /// Forget a subscription and unsubscribe on the server unless another
    /// subscription shares its identifier.
    pub fn remove(&self, subscription: &Subscription) {
        self.forget(subscription);
        if self.find_all(subscription.identifier()).is_empty() {
            self.registry
                .send_command(&Command::unsubscribe(subscription.identifier()));
        }
    }

    /// Drop every subscription for `identifier` and tell each it was
    /// rejected.
    pub fn reject(&self, identifier: &str) {
        for subscription in self.find_all(identifier) {
            self.forget(&subscription);
            subscription.notify(SubscriptionEvent::Rejected);
        }
    }

    /// Remove a subscription locally without telling the server.
    pub fn forget(&self, subscription: &Subscription) {
        self.registry.guarantor.forget(subscription);
        self.registry
            .subscriptions
            .lock()
            .retain(|s| s != subscription);
    }

    /// Subscriptions registered under `identifier`.
    pub fn find_all(&self, identifier: &str) -> Vec<Subscription> {
        self.registry
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.identifier() == identifier)
            .cloned()
            .collect()
    }

    /// Every registered subscription.
    pub fn all(&self) -> Vec<Subscription> {
        self.registry.subscriptions.lock().clone()
    }

    /// Resubscribe everything, e.g. after a welcome.
    pub fn reload(&self) {
        for subscription in self.all() {
            self.subscribe(&subscription);
        }
    }

    /// Deliver `event` to every subscription.
    pub fn notify_all(&self, event: SubscriptionEvent) {
        for subscription in self.all() {
            subscription.notify(event.clone());
        }
    }

    /// Deliver `event` to the subscriptions for `identifier`. No-op if there
    /// are none.
    pub fn notify(&self, identifier: &str, event: SubscriptionEvent) {
        for subscription in self.find_all(identifier) {
            subscription.notify(event.clone());
        }
    }

    /// Stop guaranteeing subscriptions for a confirmed `identifier`.
    pub fn confirm(&self, identifier: &str) {
        debug!(identifier = %identifier, "Subscription confirmed");
        for subscription in self.find_all(identifier) {
            self.registry.guarantor.forget(&subscription);
        }
    }

    /// Number of subscriptions awaiting confirmation.
    pub fn pending_confirmations(&self) -> usize {
        self.registry.guarantor.pending()
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.registry.subscriptions.lock().len()
    }

    /// Whether no subscription is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subscribe(&self, subscription: &Subscription) {
        self.registry
            .guarantor
            .guarantee(subscription, Arc::downgrade(&self.registry));
        self.registry
            .send_command(&Command::subscribe(subscription.identifier()));
    }
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("subscriptions", &self.all())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cable_core::CommandKind;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Command>>,
        open: Mutex<bool>,
        activations: AtomicU64,
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, command: &Command) -> bool {
            if !*self.open.lock() {
                return false;
            }
            self.sent.lock().push(command.clone());
            true
        }

        fn ensure_active(&self) {
            self.activations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn subscriptions(open: bool) -> (Subscriptions, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        *sink.open.lock() = open;
        let weak: Weak<dyn CommandSink> = Arc::downgrade(&sink) as Weak<dyn CommandSink>;
        (Subscriptions::new(weak, Duration::from_millis(500)), sink)
    }

    fn kinds(sink: &RecordingSink) -> Vec<Option<CommandKind>> {
        sink.sent.lock().iter().map(Command::kind).collect()
    }

    #[tokio::test]
    async fn test_create_subscribes_and_activates() {
        let (subs, sink) = subscriptions(true);
        let (tx, _rx) = event_channel();

        let sub = subs
            .create(serde_json::json!({"channel": "ChatChannel", "room": "1"}), tx)
            .unwrap();

        assert_eq!(sub.identifier(), r#"{"channel":"ChatChannel","room":"1"}"#);
        assert_eq!(sink.activations.load(Ordering::Relaxed), 1);
        assert_eq!(kinds(&sink), vec![Some(CommandKind::Subscribe)]);
        assert_eq!(subs.pending_confirmations(), 1);
    }

    #[tokio::test]
    async fn test_create_from_channel_name() {
        let (subs, _sink) = subscriptions(true);
        let sub = subs.create(Value::from("EchoChannel"), |_: SubscriptionEvent| {}).unwrap();
        assert_eq!(sub.identifier(), r#"{"channel":"EchoChannel"}"#);

        assert!(subs.create(serde_json::json!({"room": "1"}), |_: SubscriptionEvent| {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarantor_retries_until_confirmed() {
        let (subs, sink) = subscriptions(true);
        let sub = subs.create(Value::from("ChatChannel"), |_: SubscriptionEvent| {}).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sink.sent.lock().len(), 3);

        subs.confirm(sub.identifier());
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(sink.sent.lock().len(), 3);
        assert_eq!(subs.pending_confirmations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarantor_covers_closed_transport() {
        let (subs, sink) = subscriptions(false);
        subs.create(Value::from("ChatChannel"), |_: SubscriptionEvent| {}).unwrap();
        assert!(sink.sent.lock().is_empty());

        *sink.open.lock() = true;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(kinds(&sink), vec![Some(CommandKind::Subscribe)]);
    }

    #[tokio::test]
    async fn test_notify_targets_identifier() {
        let (subs, _sink) = subscriptions(true);
        let (tx_a, mut rx_a) = event_channel();
        let (tx_b, mut rx_b) = event_channel();

        let a = subs.create(Value::from("AChannel"), tx_a).unwrap();
        subs.create(Value::from("BChannel"), tx_b).unwrap();

        subs.notify(a.identifier(), SubscriptionEvent::Received(Value::from(1)));
        assert_eq!(rx_a.try_recv().unwrap(), SubscriptionEvent::Received(Value::from(1)));
        assert!(rx_b.try_recv().is_err());

        subs.notify("missing", SubscriptionEvent::Rejected);

        subs.notify_all(SubscriptionEvent::Disconnected {
            will_attempt_reconnect: true,
        });
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reject_removes_and_notifies() {
        let (subs, _sink) = subscriptions(true);
        let (tx, mut rx) = event_channel();
        let sub = subs.create(Value::from("SecretChannel"), tx).unwrap();

        subs.reject(sub.identifier());

        assert_eq!(rx.try_recv().unwrap(), SubscriptionEvent::Rejected);
        assert!(subs.is_empty());
        assert_eq!(subs.pending_confirmations(), 0);
    }

    #[tokio::test]
    async fn test_remove_unsubscribes_last_sharer_only() {
        let (subs, sink) = subscriptions(true);
        let first = subs.create(Value::from("ChatChannel"), |_: SubscriptionEvent| {}).unwrap();
        let second = subs.create(Value::from("ChatChannel"), |_: SubscriptionEvent| {}).unwrap();
        sink.sent.lock().clear();

        first.unsubscribe();
        assert!(sink.sent.lock().is_empty());
        assert_eq!(subs.len(), 1);

        subs.remove(&second);
        assert_eq!(kinds(&sink), vec![Some(CommandKind::Unsubscribe)]);
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_reload_resubscribes_everything() {
        let (subs, sink) = subscriptions(true);
        subs.create(Value::from("AChannel"), |_: SubscriptionEvent| {}).unwrap();
        subs.create(Value::from("BChannel"), |_: SubscriptionEvent| {}).unwrap();
        sink.sent.lock().clear();

        subs.reload();
        assert_eq!(
            kinds(&sink),
            vec![Some(CommandKind::Subscribe), Some(CommandKind::Subscribe)]
        );
    }

    #[tokio::test]
    async fn test_perform_adds_action() {
        let (subs, sink) = subscriptions(true);
        let sub = subs.create(Value::from("ChatChannel"), |_: SubscriptionEvent| {}).unwrap();
        sink.sent.lock().clear();

        assert!(sub
            .perform("speak", serde_json::json!({"text": "hi"}))
            .unwrap());
        let data = sink.sent.lock()[0].decoded_data().unwrap();
        assert_eq!(data, serde_json::json!({"action": "speak", "text": "hi"}));

        assert!(sub.perform("speak", Value::from(3)).is_err());
    }
}
