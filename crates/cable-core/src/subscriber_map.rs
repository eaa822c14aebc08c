//! Stream name to subscriber callback registry.
//!
//! The map is the only state shared between connections. Registration and
//! removal happen on connection tasks, broadcasts arrive from the adapter's
//! delivery context, so every mutation goes through one mutex. Callbacks are
//! never invoked while that mutex is held.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback fired once the adapter is listening on a stream.
pub type SuccessCallback = Box<dyn FnOnce() + Send + 'static>;

type Callback = dyn Fn(&str) -> Result<()> + Send + Sync + 'static;

/// A broadcast callback with a stable identity.
///
/// Clones share the identity, so the handle used to register is the handle
/// used to remove.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    callback: Arc<Callback>,
}

impl Subscriber {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    /// Identity of this subscriber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the callback with a broadcast payload.
    pub fn call(&self, message: &str) -> Result<()> {
        (self.callback)(message)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

/// Adapter notifications issued when a stream gains its first subscriber or
/// loses its last one.
///
/// Both methods run while the map lock is held, which keeps their order
/// identical to the order of map mutations. Implementations must not block
/// and must not call back into the map.
pub trait StreamHooks: Send + Sync + 'static {
    /// Start listening on `stream`.
    ///
    /// Returning the callback hands it back to the map, which runs it as soon
    /// as the lock is released. Returning `None` means the hook took
    /// ownership and will fire it once listening is confirmed.
    fn listen(&self, stream: &str, on_success: Option<SuccessCallback>) -> Option<SuccessCallback>;

    /// Stop listening on `stream`.
    fn unlisten(&self, stream: &str);
}

/// Hooks for adapters without an external listening step.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateHooks;

impl StreamHooks for ImmediateHooks {
    fn listen(&self, _stream: &str, on_success: Option<SuccessCallback>) -> Option<SuccessCallback> {
        on_success
    }

    fn unlisten(&self, _stream: &str) {}
}

/// Thread-safe mapping from stream names to subscribers.
pub struct SubscriberMap {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    hooks: Box<dyn StreamHooks>,
}

impl SubscriberMap {
    /// Create a map whose streams need no external listening.
    pub fn new() -> Self {
        Self::with_hooks(ImmediateHooks)
    }

    /// Create a map that reports stream transitions to `hooks`.
    pub fn with_hooks(hooks: impl StreamHooks) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            hooks: Box::new(hooks),
        }
    }

    /// Register `subscriber` under `stream`.
    ///
    /// `on_success` fires once the stream is being listened to: right away
    /// if it already was, otherwise when the adapter confirms.
    pub fn add_subscriber(
        &self,
        stream: &str,
        subscriber: Subscriber,
        on_success: Option<SuccessCallback>,
    ) {
        let immediate = {
            let mut subscribers = self.subscribers.lock();
            match subscribers.get_mut(stream) {
                Some(list) => {
                    if !list.contains(&subscriber) {
                        list.push(subscriber);
                    }
                    on_success
                }
                None => {
                    subscribers.insert(stream.to_string(), vec![subscriber]);
                    debug!(stream = %stream, "Listening on stream");
                    self.hooks.listen(stream, on_success)
                }
            }
        };

        if let Some(callback) = immediate {
            callback();
        }
    }

    /// Remove `subscriber` from `stream`. Returns whether it was registered.
    pub fn remove_subscriber(&self, stream: &str, subscriber: &Subscriber) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(stream) else {
            return false;
        };

        let before = list.len();
        list.retain(|s| s != subscriber);
        let removed = list.len() != before;

        if list.is_empty() {
            subscribers.remove(stream);
            debug!(stream = %stream, "Stopped listening on stream");
            self.hooks.unlisten(stream);
        }

        removed
    }

    /// Deliver `message` to every subscriber of `stream`.
    ///
    /// Returns how many callbacks completed successfully. Failing or
    /// panicking callbacks are logged and skipped.
    pub fn broadcast(&self, stream: &str, message: &str) -> usize {
        let snapshot = match self.subscribers.lock().get(stream) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for subscriber in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| subscriber.call(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(stream = %stream, subscriber = subscriber.id(), error = %e, "Subscriber callback failed");
                }
                Err(_) => {
                    error!(stream = %stream, subscriber = subscriber.id(), "Subscriber callback panicked");
                }
            }
        }

        trace!(stream = %stream, recipients = delivered, "Broadcast delivered");
        delivered
    }

    /// Streams with at least one subscriber.
    pub fn streams(&self) -> Vec<String> {
        self.subscribers.lock().keys().cloned().collect()
    }

    /// Number of subscribers on `stream`.
    pub fn subscriber_count(&self, stream: &str) -> usize {
        self.subscribers.lock().get(stream).map_or(0, Vec::len)
    }

    /// Whether `stream` has any subscriber.
    pub fn is_listening(&self, stream: &str) -> bool {
        self.subscribers.lock().contains_key(stream)
    }

    /// Drop every registration, notifying the adapter for each stream.
    pub fn clear(&self) {
        let mut subscribers = self.subscribers.lock();
        for stream in subscribers.keys() {
            self.hooks.unlisten(stream);
        }
        subscribers.clear();
    }
}

impl Default for SubscriberMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriberMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberMap")
            .field("streams", &self.subscribers.lock().len())
            .finish()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct CountingHooks {
        listening: Arc<Mutex<HashMap<String, i64>>>,
    }

    impl StreamHooks for CountingHooks {
        fn listen(&self, stream: &str, on_success: Option<SuccessCallback>) -> Option<SuccessCallback> {
            *self.listening.lock().entry(stream.to_string()).or_default() += 1;
            on_success
        }

        fn unlisten(&self, stream: &str) {
            *self.listening.lock().entry(stream.to_string()).or_default() -= 1;
        }
    }

    proptest! {
        /// Property: any interleaving of adds and removes leaves the adapter
        /// listening exactly on the streams that still have subscribers.
        #[test]
        fn prop_listen_state_tracks_subscribers(
            ops in proptest::collection::vec((0usize..3, 0usize..4, any::<bool>()), 0..64)
        ) {
            let hooks = CountingHooks::default();
            let listening = hooks.listening.clone();
            let map = SubscriberMap::with_hooks(hooks);
            let subscribers: Vec<Subscriber> = (0..4).map(|_| Subscriber::new(|_| Ok(()))).collect();

            for (stream, who, add) in ops {
                let stream = format!("stream-{}", stream);
                if add {
                    map.add_subscriber(&stream, subscribers[who].clone(), None);
                } else {
                    map.remove_subscriber(&stream, &subscribers[who]);
                }
            }

            for (stream, count) in listening.lock().iter() {
                let expected = if map.is_listening(stream) { 1 } else { 0 };
                prop_assert_eq!(*count, expected);
            }
        }
    }
}
