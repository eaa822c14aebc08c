//! Client connection: one transport at a time, supervised by a monitor.
//!
//! Transport events are tagged with the generation of the transport that
//! produced them and funneled into one dispatch task. Opening a new transport
//! bumps the generation, so late events from a replaced transport are
//! dropped.

use crate::monitor::{ConnectionMonitor, MonitorAction, MonitorConfig, MonitorState};
use crate::subscriptions::{CommandSink, SubscriptionEvent, Subscriptions};
use crate::transport::{Transport, TransportCommand, TransportEvent};
use cable_core::{is_supported_protocol, Command, Frame, MessageType, PROTOCOLS};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sub-protocols offered on open, most preferred first.
    pub protocols: Vec<String>,
    /// Delay between closing and reopening in [`Connection::reopen`].
    pub reopen_delay: Duration,
    /// Interval between subscribe retries for unconfirmed subscriptions.
    pub guarantee_interval: Duration,
    /// Keepalive monitor settings.
    pub monitor: MonitorConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocols: PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            reopen_delay: Duration::from_millis(500),
            guarantee_interval: Duration::from_millis(500),
            monitor: MonitorConfig::default(),
        }
    }
}

/// State of the current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Handshake in progress.
    Connecting,
    /// Frames can be written.
    Open,
    /// Close requested, waiting for the transport to finish.
    Closing,
    /// No transport.
    Closed,
}

struct State {
    generation: u64,
    transport: TransportState,
    commands: Option<mpsc::UnboundedSender<TransportCommand>>,
    protocol: Option<String>,
    disconnected: bool,
    reconnected: bool,
    monitor: ConnectionMonitor,
    monitor_task: Option<CancellationToken>,
    reopen_task: Option<JoinHandle<()>>,
}

struct Inner {
    me: Weak<Inner>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    state: Mutex<State>,
    subscriptions: Subscriptions,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
    poll_now: Arc<Notify>,
    shutdown: CancellationToken,
}

/// A client connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a closed connection. Must be called within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            let sink: Weak<dyn CommandSink> = me.clone();
            Inner {
                me: me.clone(),
                transport,
                subscriptions: Subscriptions::new(sink, config.guarantee_interval),
                state: Mutex::new(State {
                    generation: 0,
                    transport: TransportState::Closed,
                    commands: None,
                    protocol: None,
                    disconnected: true,
                    reconnected: false,
                    monitor: ConnectionMonitor::new(config.monitor.clone()),
                    monitor_task: None,
                    reopen_task: None,
                }),
                config,
                events: events_tx,
                poll_now: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
            }
        });

        tokio::spawn(dispatch(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// The subscriptions carried by this connection.
    pub fn subscriptions(&self) -> Subscriptions {
        self.inner.subscriptions.clone()
    }

    /// Open a transport and start the monitor. Returns false if a transport
    /// is already open or connecting.
    pub fn open(&self) -> bool {
        self.inner.open()
    }

    /// Write a command. Returns whether the transport was open.
    pub fn send(&self, command: &Command) -> bool {
        self.inner.send(command)
    }

    /// Close the transport. Without `allow_reconnect` the monitor stops and
    /// any scheduled reopen is cancelled.
    pub fn close(&self, allow_reconnect: bool) {
        self.inner.close(allow_reconnect)
    }

    /// Close and reopen after the reopen delay, or open right away if no
    /// transport is active.
    pub fn reopen(&self) {
        self.inner.reopen()
    }

    /// Run a monitor poll now instead of at the next tick, e.g. when the
    /// network comes back.
    pub fn poll_now(&self) {
        self.inner.poll_now.notify_one();
    }

    /// Whether frames can be written.
    pub fn is_open(&self) -> bool {
        self.transport_state() == TransportState::Open
    }

    /// Whether a transport is open or connecting.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// State of the current transport.
    pub fn transport_state(&self) -> TransportState {
        self.inner.state.lock().transport
    }

    /// Sub-protocol negotiated by the current transport.
    pub fn protocol(&self) -> Option<String> {
        self.inner.state.lock().protocol.clone()
    }

    /// Snapshot of the monitor.
    pub fn monitor(&self) -> ConnectionMonitor {
        self.inner.state.lock().monitor.clone()
    }

    /// Close for good and stop background tasks.
    pub fn shutdown(&self) {
        self.inner.close(false);
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("transport", &state.transport)
            .field("generation", &state.generation)
            .field("monitor", &state.monitor.state())
            .finish()
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        matches!(
            self.state.lock().transport,
            TransportState::Connecting | TransportState::Open
        )
    }

    fn open(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(
            state.transport,
            TransportState::Connecting | TransportState::Open
        ) {
            debug!(state = ?state.transport, "Attempted to open, but a transport is active");
            return false;
        }

        state.generation += 1;
        let generation = state.generation;
        let session = self.transport.open(&self.config.protocols);
        state.commands = Some(session.commands);
        state.transport = TransportState::Connecting;
        state.protocol = None;
        state.monitor.record_connecting(Instant::now());
        let start_monitor = state.monitor.start();
        drop(state);

        debug!(generation, "Opening transport");
        let events = self.events.clone();
        let mut incoming = session.events;
        tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                if events.send((generation, event)).is_err() {
                    break;
                }
            }
        });

        if start_monitor {
            self.spawn_monitor();
        }
        true
    }

    fn spawn_monitor(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.state.lock().monitor_task.replace(token.clone()) {
            previous.cancel();
        }

        let me = self.me.clone();
        let poll_now = self.poll_now.clone();
        let period = self.config.monitor.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                    _ = poll_now.notified() => {}
                }
                let Some(inner) = me.upgrade() else {
                    break;
                };
                inner.poll();
            }
            trace!("Monitor stopped");
        });
    }

    fn poll(&self) {
        let action = self.state.lock().monitor.poll(Instant::now());
        match action {
            MonitorAction::None => {}
            MonitorAction::Reopen => {
                info!(
                    attempts = self.state.lock().monitor.reconnect_attempts(),
                    "Reconnecting"
                );
                self.reopen();
            }
            MonitorAction::ForceClose => self.force_close(),
        }
    }

    fn send(&self, command: &Command) -> bool {
        let state = self.state.lock();
        if state.transport != TransportState::Open {
            return false;
        }
        let Some(commands) = &state.commands else {
            return false;
        };
        match command.encode() {
            Ok(text) => commands.send(TransportCommand::Send(text)).is_ok(),
            Err(e) => {
                error!(error = %e, "Could not encode command");
                false
            }
        }
    }

    fn close(&self, allow_reconnect: bool) {
        let commands = {
            let mut state = self.state.lock();
            if !allow_reconnect {
                state.monitor.stop();
                if let Some(token) = state.monitor_task.take() {
                    token.cancel();
                }
                if let Some(task) = state.reopen_task.take() {
                    task.abort();
                }
            }
            if matches!(
                state.transport,
                TransportState::Connecting | TransportState::Open
            ) {
                state.transport = TransportState::Closing;
                state.commands.clone()
            } else {
                None
            }
        };

        if let Some(commands) = commands {
            debug!(allow_reconnect, "Closing transport");
            let _ = commands.send(TransportCommand::Close);
        }
    }

    fn reopen(&self) {
        if !self.is_active() {
            self.open();
            return;
        }

        self.close(true);
        let me = self.me.clone();
        let delay = self.config.reopen_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = me.upgrade() {
                inner.open();
            }
        });
        if let Some(previous) = self.state.lock().reopen_task.replace(task) {
            previous.abort();
        }
    }

    /// Abandon a transport the monitor considers dead. Its remaining events
    /// are ignored.
    fn force_close(&self) {
        warn!("Connection is stale, closing");
        let commands = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.transport = TransportState::Closing;
            state.commands.take()
        };
        if let Some(commands) = commands {
            let _ = commands.send(TransportCommand::Close);
        }
        self.transport_closed();
    }

    fn transport_closed(&self) {
        let will_attempt_reconnect = {
            let mut state = self.state.lock();
            state.commands = None;
            state.transport = TransportState::Closed;
            if state.monitor.state() != MonitorState::Disconnected {
                state.monitor.record_disconnect(Instant::now());
            }
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.monitor.is_running()
        };

        info!(will_attempt_reconnect, "Disconnected");
        self.subscriptions
            .notify_all(SubscriptionEvent::Disconnected {
                will_attempt_reconnect,
            });
    }

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        if generation != self.state.lock().generation {
            trace!(generation, "Ignoring event from a replaced transport");
            return;
        }

        match event {
            TransportEvent::Open { protocol } => self.handle_open(protocol),
            TransportEvent::Message(text) => self.handle_message(&text),
            TransportEvent::Close { code, reason } => {
                debug!(code = ?code, reason = %reason, "Transport closed");
                self.transport_closed();
            }
            TransportEvent::Error(e) => warn!(error = %e, "Transport error"),
        }
    }

    fn handle_open(&self, protocol: Option<String>) {
        {
            let mut state = self.state.lock();
            if state.transport == TransportState::Closing {
                debug!("Transport opened after close was requested");
                return;
            }
            state.transport = TransportState::Open;
            state.protocol = protocol.clone();
            state.disconnected = false;
        }
        info!(protocol = ?protocol, "Transport open");

        if !is_supported_protocol(protocol.as_deref()) {
            error!(
                protocol = ?protocol,
                "Protocol is unsupported. Stopping monitor and disconnecting"
            );
            self.close(false);
        }
    }

    fn handle_message(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match frame.kind {
            Some(MessageType::Welcome) => {
                {
                    let mut state = self.state.lock();
                    state.reconnected = state.monitor.reconnect_attempts() > 0;
                    state.monitor.record_connect(Instant::now());
                }
                debug!("Welcome received");
                self.subscriptions.reload();
            }
            Some(MessageType::Disconnect) => {
                let allow_reconnect = frame.reconnect.unwrap_or(false);
                info!(reason = ?frame.reason, allow_reconnect, "Server requested disconnect");
                self.close(allow_reconnect);
            }
            Some(MessageType::Ping) => {
                self.state.lock().monitor.record_ping(Instant::now());
            }
            Some(MessageType::Confirmation) => {
                let Some(identifier) = frame.identifier else {
                    return;
                };
                self.subscriptions.confirm(&identifier);
                let reconnected = self.state.lock().reconnected;
                self.subscriptions
                    .notify(&identifier, SubscriptionEvent::Connected { reconnected });
            }
            Some(MessageType::Rejection) => {
                if let Some(identifier) = frame.identifier {
                    info!(identifier = %identifier, "Subscription rejected");
                    self.subscriptions.reject(&identifier);
                }
            }
            Some(MessageType::Unknown) | None => {
                if let (Some(identifier), Some(message)) = (frame.identifier, frame.message) {
                    self.subscriptions
                        .notify(&identifier, SubscriptionEvent::Received(message));
                }
            }
        }
    }
}

impl CommandSink for Inner {
    fn send_command(&self, command: &Command) -> bool {
        self.send(command)
    }

    fn ensure_active(&self) {
        if !self.is_active() {
            self.open();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let state = self.state.get_mut();
        if let Some(token) = state.monitor_task.take() {
            token.cancel();
        }
        if let Some(task) = state.reopen_task.take() {
            task.abort();
        }
        if let Some(commands) = state.commands.take() {
            let _ = commands.send(TransportCommand::Close);
        }
    }
}

async fn dispatch(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    shutdown: CancellationToken,
) {
    loop {
        let (generation, event) = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(generation, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::event_channel;
    use crate::transport::MemoryTransport;

    fn connection(protocol: Option<&str>) -> (Connection, crate::transport::MemoryAcceptor) {
        let (transport, acceptor) = MemoryTransport::pair(protocol);
        (
            Connection::new(Arc::new(transport), ClientConfig::default()),
            acceptor,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (conn, mut acceptor) = connection(Some("actioncable-v1-json"));

        assert!(conn.open());
        assert!(!conn.open());
        assert!(acceptor.accept().await.is_some());
        assert!(acceptor.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_send_requires_open_transport() {
        let (conn, mut acceptor) = connection(Some("actioncable-v1-json"));
        let command = Command::subscribe(r#"{"channel":"ChatChannel"}"#);

        assert!(!conn.send(&command));
        conn.open();
        let mut peer = acceptor.accept().await.unwrap();
        settle().await;

        assert!(conn.is_open());
        assert!(conn.send(&command));
        assert_eq!(peer.recv().await, Some(command.encode().unwrap()));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_closes_without_reconnect() {
        let (conn, mut acceptor) = connection(Some("actioncable-unsupported"));
        conn.open();
        let mut peer = acceptor.accept().await.unwrap();

        assert_eq!(peer.recv().await, None);
        settle().await;
        assert_eq!(conn.transport_state(), TransportState::Closed);
        assert!(!conn.monitor().is_running());
    }

    #[tokio::test]
    async fn test_welcome_marks_connected_and_reloads() {
        let (conn, mut acceptor) = connection(Some("actioncable-v1-json"));
        let (delegate, mut events) = event_channel();
        let subscription = conn
            .subscriptions()
            .create(serde_json::json!({"channel": "ChatChannel"}), delegate)
            .unwrap();

        let mut peer = acceptor.accept().await.unwrap();
        peer.send(Frame::welcome().encode().unwrap());

        let subscribe = peer.recv().await.unwrap();
        assert_eq!(
            Command::decode(&subscribe).unwrap(),
            Command::subscribe(subscription.identifier())
        );
        assert_eq!(conn.monitor().state(), MonitorState::Connected);

        peer.send(Frame::confirmation(subscription.identifier()).encode().unwrap());
        assert_eq!(
            events.recv().await,
            Some(SubscriptionEvent::Connected { reconnected: false })
        );

        peer.send(
            Frame::message(subscription.identifier(), serde_json::json!({"n": 1}))
                .encode()
                .unwrap(),
        );
        assert_eq!(
            events.recv().await,
            Some(SubscriptionEvent::Received(serde_json::json!({"n": 1})))
        );
    }

    #[tokio::test]
    async fn test_events_from_replaced_transport_are_ignored() {
        let (conn, mut acceptor) = connection(Some("actioncable-v1-json"));
        conn.open();
        let old = acceptor.accept().await.unwrap();
        settle().await;

        conn.inner.force_close();
        conn.open();
        let _new = acceptor.accept().await.unwrap();
        settle().await;

        old.send(Frame::welcome().encode().unwrap());
        settle().await;
        assert_ne!(conn.monitor().state(), MonitorState::Connected);
    }

    #[tokio::test]
    async fn test_server_disconnect_without_reconnect() {
        let (conn, mut acceptor) = connection(Some("actioncable-v1-json"));
        conn.open();
        let peer = acceptor.accept().await.unwrap();
        peer.send(Frame::welcome().encode().unwrap());
        peer.send(
            Frame::disconnect(cable_core::DisconnectReason::Unauthorized, false)
                .encode()
                .unwrap(),
        );
        settle().await;

        assert_eq!(conn.transport_state(), TransportState::Closed);
        assert!(!conn.monitor().is_running());
    }
}
