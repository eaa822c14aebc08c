//! Adapter backed by an external notify/listen mechanism.
//!
//! The external listening handle is not safe for concurrent use, so one
//! dedicated task owns it. Subscribe and unsubscribe only enqueue
//! instructions; the task applies them in order, and between instructions
//! waits for notifications and feeds them into the local subscriber map.
//!
//! Delivery is at-most-once: anything published while the listener is
//! disconnected from the backend is lost.

use super::PubSubAdapter;
use crate::backoff::Backoff;
use crate::error::{CableError, Result};
use crate::subscriber_map::{StreamHooks, SubscriberMap, SuccessCallback};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A notification received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Stream the payload was published on.
    pub stream: String,
    /// Raw payload.
    pub payload: String,
}

/// Connection factory and publisher for an external broker.
#[async_trait]
pub trait NotifyBackend: Send + Sync + 'static {
    /// Open a dedicated listening connection.
    async fn connect(&self) -> Result<Box<dyn NotifyListener>>;

    /// Publish a payload on a stream.
    async fn publish(&self, stream: &str, payload: &str) -> Result<()>;
}

/// A listening connection. Only ever used by one task.
#[async_trait]
pub trait NotifyListener: Send + 'static {
    /// Start receiving notifications for `stream`.
    async fn listen(&mut self, stream: &str) -> Result<()>;

    /// Stop receiving notifications for `stream`.
    async fn unlisten(&mut self, stream: &str) -> Result<()>;

    /// Wait for the next notification.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a notification.
    async fn next_notification(&mut self) -> Result<Notification>;
}

/// What the listener does when the backend connection fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the listener and trip the adapter's failure token.
    #[default]
    FailFast,
    /// Reconnect with backoff and re-listen every active stream.
    Reconnect,
}

/// Networked adapter settings.
#[derive(Debug, Clone)]
pub struct NetworkedConfig {
    /// Upper bound on a single wait for notifications.
    pub wait_timeout: Duration,
    /// Behavior on backend connection loss.
    pub failure_policy: FailurePolicy,
    /// Reconnect schedule used with [`FailurePolicy::Reconnect`].
    pub reconnect_backoff: Backoff,
}

impl Default for NetworkedConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(1),
            failure_policy: FailurePolicy::FailFast,
            reconnect_backoff: Backoff::default(),
        }
    }
}

enum Instruction {
    Listen {
        stream: String,
        on_success: Option<SuccessCallback>,
    },
    Unlisten {
        stream: String,
    },
    Flush(oneshot::Sender<()>),
}

struct QueueHooks {
    instructions: mpsc::UnboundedSender<Instruction>,
}

impl StreamHooks for QueueHooks {
    fn listen(&self, stream: &str, on_success: Option<SuccessCallback>) -> Option<SuccessCallback> {
        let instruction = Instruction::Listen {
            stream: stream.to_string(),
            on_success,
        };
        if self.instructions.send(instruction).is_err() {
            warn!(stream = %stream, "Pub/sub listener is not running, cannot listen");
        }
        None
    }

    fn unlisten(&self, stream: &str) {
        let instruction = Instruction::Unlisten {
            stream: stream.to_string(),
        };
        if self.instructions.send(instruction).is_err() {
            debug!(stream = %stream, "Pub/sub listener is not running, cannot unlisten");
        }
    }
}

/// Adapter that relays broadcasts through a [`NotifyBackend`].
pub struct NetworkedAdapter {
    subscribers: Arc<SubscriberMap>,
    backend: Arc<dyn NotifyBackend>,
    instructions: mpsc::UnboundedSender<Instruction>,
    shutdown: CancellationToken,
    failed: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkedAdapter {
    /// Create the adapter and spawn its listener task.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(backend: Arc<dyn NotifyBackend>, config: NetworkedConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(SubscriberMap::with_hooks(QueueHooks {
            instructions: tx.clone(),
        }));
        let shutdown = CancellationToken::new();
        let failed = CancellationToken::new();

        let listener = Listener {
            backend: backend.clone(),
            subscribers: subscribers.clone(),
            instructions: rx,
            config,
            shutdown: shutdown.clone(),
            failed: failed.clone(),
            listening: HashSet::new(),
        };
        let task = tokio::spawn(listener.run());

        Self {
            subscribers,
            backend,
            instructions: tx,
            shutdown,
            failed,
            task: Mutex::new(Some(task)),
        }
    }

    /// Token cancelled when the listener gives up on the backend.
    ///
    /// Hosts running with [`FailurePolicy::FailFast`] should watch it and
    /// take the process down rather than silently drop broadcasts.
    pub fn failure_token(&self) -> CancellationToken {
        self.failed.clone()
    }

    /// Whether the listener has failed.
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Wait until every instruction enqueued so far has been applied.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::Flush(tx))
            .map_err(|_| CableError::Adapter("listener stopped".to_string()))?;
        rx.await
            .map_err(|_| CableError::Adapter("listener stopped".to_string()))
    }
}

#[async_trait]
impl PubSubAdapter for NetworkedAdapter {
    async fn broadcast(&self, stream: &str, payload: &str) -> Result<()> {
        self.backend.publish(stream, payload).await
    }

    fn subscriber_map(&self) -> &SubscriberMap {
        &self.subscribers
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            debug!(finished = task.is_finished(), "Stopping pub/sub listener");
        }
    }
}

impl Drop for NetworkedAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for NetworkedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkedAdapter")
            .field("subscribers", &self.subscribers)
            .field("failed", &self.is_failed())
            .finish()
    }
}

enum Wake {
    Shutdown,
    Instruction(Option<Instruction>),
    Waited(std::result::Result<Result<Notification>, tokio::time::error::Elapsed>),
}

type Applied = std::result::Result<(), (CableError, Option<SuccessCallback>)>;

struct Listener {
    backend: Arc<dyn NotifyBackend>,
    subscribers: Arc<SubscriberMap>,
    instructions: mpsc::UnboundedReceiver<Instruction>,
    config: NetworkedConfig,
    shutdown: CancellationToken,
    failed: CancellationToken,
    listening: HashSet<String>,
}

impl Listener {
    async fn run(mut self) {
        let mut conn = match self.backend.connect().await {
            Ok(conn) => conn,
            Err(e) => match self.recover(e).await {
                Some(conn) => conn,
                None => return,
            },
        };
        info!("Pub/sub listener connected");

        loop {
            // Apply everything queued before blocking on the backend.
            while let Ok(instruction) = self.instructions.try_recv() {
                match self.apply_or_recover(conn, instruction).await {
                    Some(c) => conn = c,
                    None => return,
                }
            }

            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                instruction = self.instructions.recv() => Wake::Instruction(instruction),
                waited = tokio::time::timeout(self.config.wait_timeout, conn.next_notification()) => {
                    Wake::Waited(waited)
                }
            };

            match wake {
                Wake::Shutdown | Wake::Instruction(None) => break,
                Wake::Instruction(Some(instruction)) => {
                    match self.apply_or_recover(conn, instruction).await {
                        Some(c) => conn = c,
                        None => return,
                    }
                }
                Wake::Waited(Err(_elapsed)) => {}
                Wake::Waited(Ok(Ok(notification))) => {
                    self.subscribers
                        .broadcast(&notification.stream, &notification.payload);
                }
                Wake::Waited(Ok(Err(e))) => match self.recover(e).await {
                    Some(c) => conn = c,
                    None => return,
                },
            }
        }

        debug!("Pub/sub listener stopped");
    }

    async fn apply_or_recover(
        &mut self,
        mut conn: Box<dyn NotifyListener>,
        instruction: Instruction,
    ) -> Option<Box<dyn NotifyListener>> {
        match self.apply(conn.as_mut(), instruction).await {
            Ok(()) => Some(conn),
            Err((e, on_success)) => {
                drop(conn);
                let conn = self.recover(e).await?;
                if let Some(callback) = on_success {
                    callback();
                }
                Some(conn)
            }
        }
    }

    async fn apply(&mut self, conn: &mut dyn NotifyListener, instruction: Instruction) -> Applied {
        match instruction {
            Instruction::Listen { stream, on_success } => {
                if self.listening.insert(stream.clone()) {
                    if let Err(e) = conn.listen(&stream).await {
                        return Err((e, on_success));
                    }
                    debug!(stream = %stream, "LISTEN");
                }
                if let Some(callback) = on_success {
                    callback();
                }
                Ok(())
            }
            Instruction::Unlisten { stream } => {
                if self.listening.remove(&stream) {
                    if let Err(e) = conn.unlisten(&stream).await {
                        return Err((e, None));
                    }
                    debug!(stream = %stream, "UNLISTEN");
                }
                Ok(())
            }
            Instruction::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        }
    }

    async fn recover(&mut self, error: CableError) -> Option<Box<dyn NotifyListener>> {
        match self.config.failure_policy {
            FailurePolicy::FailFast => {
                error!(error = %error, "Pub/sub listener lost its backend, broadcasts will not be delivered");
                self.failed.cancel();
                None
            }
            FailurePolicy::Reconnect => {
                warn!(error = %error, "Pub/sub listener lost its backend, reconnecting");
                self.reconnect().await
            }
        }
    }

    async fn reconnect(&mut self) -> Option<Box<dyn NotifyListener>> {
        let mut attempt = 0u32;

        loop {
            let delay = self.config.reconnect_backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut conn = match self.backend.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Pub/sub reconnect failed");
                    continue;
                }
            };

            let mut relistened = true;
            for stream in &self.listening {
                if let Err(e) = conn.listen(stream).await {
                    warn!(attempt = attempt, stream = %stream, error = %e, "Re-listen failed");
                    relistened = false;
                    break;
                }
            }

            if relistened {
                info!(
                    attempt = attempt,
                    streams = self.listening.len(),
                    "Pub/sub listener reconnected"
                );
                return Some(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LoopbackBackend;
    use crate::subscriber_map::Subscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Subscriber, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let subscriber = Subscriber::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (subscriber, count)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_broadcast_round_trips_through_backend() {
        let backend = LoopbackBackend::new();
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), NetworkedConfig::default());
        let (subscriber, count) = counting();

        adapter.subscribe("room", subscriber, None);
        adapter.flush().await.unwrap();
        assert_eq!(backend.listen_count("room"), 1);

        adapter.broadcast("room", "hi").await.unwrap();
        eventually(|| count.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_success_callback_after_listen() {
        let backend = LoopbackBackend::new();
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), NetworkedConfig::default());
        let (tx, rx) = oneshot::channel();

        adapter.subscribe(
            "room",
            Subscriber::new(|_| Ok(())),
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        );

        rx.await.unwrap();
        assert_eq!(backend.listen_count("room"), 1);
    }

    #[tokio::test]
    async fn test_rapid_subscribe_unsubscribe_converges() {
        let backend = LoopbackBackend::new();
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), NetworkedConfig::default());

        for _ in 0..50 {
            let (s, _) = counting();
            adapter.subscribe("room", s.clone(), None);
            adapter.unsubscribe("room", &s);
        }
        adapter.flush().await.unwrap();
        assert_eq!(backend.listen_count("room"), 0);

        let (s, _) = counting();
        adapter.subscribe("room", s, None);
        adapter.flush().await.unwrap();
        assert_eq!(backend.listen_count("room"), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_trips_failure_token() {
        let backend = LoopbackBackend::new();
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), NetworkedConfig::default());
        adapter.flush().await.unwrap();

        backend.sever();

        let token = adapter.failure_token();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert!(adapter.is_failed());
        assert!(adapter.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_relistens_streams() {
        let backend = LoopbackBackend::new();
        let config = NetworkedConfig {
            failure_policy: FailurePolicy::Reconnect,
            reconnect_backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
            ..Default::default()
        };
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), config);
        let (subscriber, count) = counting();

        adapter.subscribe("room", subscriber, None);
        adapter.flush().await.unwrap();

        backend.sever();
        backend.restore();

        eventually(|| backend.listen_count("room") == 1).await;
        assert!(!adapter.is_failed());

        adapter.broadcast("room", "after").await.unwrap();
        eventually(|| count.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let backend = LoopbackBackend::new();
        let adapter = NetworkedAdapter::start(Arc::new(backend.clone()), NetworkedConfig::default());
        adapter.flush().await.unwrap();
        assert_eq!(backend.connection_count(), 1);

        adapter.shutdown();
        eventually(|| backend.connection_count() == 0).await;
    }
}
