//! Server side of one client connection.
//!
//! Every connection is driven by its own task. Inbound text frames, heartbeat
//! requests and close requests are queued on the connection's inbox and
//! handled strictly in arrival order, so a command is finished (including
//! its awaits) before the next one starts.

use crate::adapter::PubSubAdapter;
use crate::channel::ChannelRegistry;
use crate::error::{CableError, Result};
use crate::protocol::{unix_timestamp, Command, DisconnectReason, Frame};
use crate::subscriber_map::Subscriber;
use crate::subscriptions::Subscriptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Unique connection identifier.
pub type ConnectionId = String;

/// Identity a connection was established with, e.g. `current_user -> 42`.
pub type ConnectionIdentifiers = BTreeMap<String, String>;

/// Prefix of the per-identity stream used for remote disconnects.
pub const INTERNAL_STREAM_PREFIX: &str = "cable_internal/";

/// Name of the internal stream for a connection identity.
pub fn internal_stream(identifiers: &ConnectionIdentifiers) -> String {
    let key = identifiers
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{}", INTERNAL_STREAM_PREFIX, key)
}

/// Message published on an internal stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InternalMessage {
    /// Close the connection.
    Disconnect {
        /// Whether the client may reconnect.
        #[serde(default = "default_reconnect")]
        reconnect: bool,
    },
}

fn default_reconnect() -> bool {
    true
}

/// Sender half of a connection's outbound frame queue.
#[derive(Clone, Debug)]
pub struct Transmitter {
    connection_id: Arc<str>,
    sender: mpsc::UnboundedSender<String>,
}

impl Transmitter {
    /// Create a transmitter and the receiver the transport drains.
    pub fn channel(connection_id: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: Arc::from(connection_id),
                sender,
            },
            receiver,
        )
    }

    /// Connection this transmitter writes to.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a frame for the client.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_raw(frame.encode()?)
    }

    /// Queue already-encoded text for the client.
    pub fn send_raw(&self, text: String) -> Result<()> {
        self.sender
            .send(text)
            .map_err(|_| CableError::ConnectionClosed)
    }

    /// Whether the transport side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Work item for a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A text frame received from the client.
    Frame(String),
    /// Send a heartbeat ping.
    Beat,
    /// Send a disconnect frame, then close.
    Disconnect {
        /// Reason reported to the client.
        reason: DisconnectReason,
        /// Whether the client may reconnect.
        reconnect: bool,
    },
    /// The transport closed.
    Close,
}

/// Cloneable handle used by transports and the server to reach a connection
/// task.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identifiers: ConnectionIdentifiers,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl ConnectionHandle {
    /// Create a handle and the inbox its connection task consumes.
    pub fn new(
        id: ConnectionId,
        identifiers: ConnectionIdentifiers,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id,
                identifiers,
                inbox,
            },
            receiver,
        )
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity the connection was established with.
    pub fn identifiers(&self) -> &ConnectionIdentifiers {
        &self.identifiers
    }

    /// Queue a text frame received from the client.
    pub fn receive(&self, text: impl Into<String>) -> Result<()> {
        self.send(Inbound::Frame(text.into()))
    }

    /// Ask the connection to send a heartbeat.
    pub fn beat(&self) -> Result<()> {
        self.send(Inbound::Beat)
    }

    /// Send a disconnect frame and close.
    pub fn disconnect(&self, reason: DisconnectReason, reconnect: bool) -> Result<()> {
        self.send(Inbound::Disconnect { reason, reconnect })
    }

    /// Report that the transport closed.
    pub fn close(&self) -> Result<()> {
        self.send(Inbound::Close)
    }

    /// Whether the connection task has finished.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    fn send(&self, inbound: Inbound) -> Result<()> {
        self.inbox
            .send(inbound)
            .map_err(|_| CableError::ConnectionClosed)
    }
}

/// What a transport needs to serve one connection: the handle to push
/// inbound frames through and the queue of outbound text.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Handle for inbound traffic and close requests.
    pub handle: ConnectionHandle,
    /// Outbound frames. Yields `None` once the connection is torn down.
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// State owned by a connection task.
pub struct Connection {
    id: ConnectionId,
    identifiers: ConnectionIdentifiers,
    inbox: mpsc::WeakUnboundedSender<Inbound>,
    transmitter: Transmitter,
    adapter: Arc<dyn PubSubAdapter>,
    subscriptions: Subscriptions,
    internal: Option<(String, Subscriber)>,
    closed: bool,
}

impl Connection {
    /// Create the connection state. Nothing is sent until [`open`](Self::open).
    pub fn new(
        handle: &ConnectionHandle,
        transmitter: Transmitter,
        adapter: Arc<dyn PubSubAdapter>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        let subscriptions = Subscriptions::new(
            transmitter.clone(),
            handle.identifiers.clone(),
            adapter.clone(),
            registry,
        );
        Self {
            id: handle.id.clone(),
            identifiers: handle.identifiers.clone(),
            inbox: handle.inbox.downgrade(),
            transmitter,
            adapter,
            subscriptions,
            internal: None,
            closed: false,
        }
    }

    /// Count established subscriptions on a shared counter.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.subscriptions.set_counter(counter);
        self
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// This connection's subscriptions.
    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Send the welcome frame and listen for remote disconnects.
    pub fn open(&mut self) -> Result<()> {
        if !self.identifiers.is_empty() {
            let stream = internal_stream(&self.identifiers);
            let inbox = self.inbox.clone();
            let subscriber = Subscriber::new(move |payload| {
                match serde_json::from_str::<InternalMessage>(payload) {
                    Ok(InternalMessage::Disconnect { reconnect }) => {
                        if let Some(inbox) = inbox.upgrade() {
                            let _ = inbox.send(Inbound::Disconnect {
                                reason: DisconnectReason::Remote,
                                reconnect,
                            });
                        }
                        Ok(())
                    }
                    Err(e) => Err(CableError::Callback(format!(
                        "invalid internal message: {}",
                        e
                    ))),
                }
            });
            self.adapter.subscribe(&stream, subscriber.clone(), None);
            self.internal = Some((stream, subscriber));
        }

        self.transmitter.send_frame(&Frame::welcome())?;
        info!(
            connection_id = %self.id(),
            identifiers = ?self.identifiers,
            "Connection opened"
        );
        Ok(())
    }

    /// Decode and execute one text frame. Malformed frames are logged.
    pub async fn receive(&mut self, text: &str) {
        if self.closed {
            return;
        }

        trace!(connection_id = %self.id(), frame = %text, "Received frame");
        match Command::decode(text) {
            Ok(command) => self.subscriptions.execute_command(&command).await,
            Err(e) => error!(connection_id = %self.id(), error = %e, "Dropping malformed frame"),
        }
    }

    /// Send a heartbeat ping with the current server time.
    pub fn beat(&self) {
        if let Err(e) = self.transmitter.send_frame(&Frame::ping(unix_timestamp())) {
            debug!(connection_id = %self.id(), error = %e, "Heartbeat not delivered");
        }
    }

    /// Send a disconnect frame. The caller is expected to close afterwards.
    pub fn send_disconnect(&self, reason: DisconnectReason, reconnect: bool) {
        info!(
            connection_id = %self.id(),
            reason = %reason,
            reconnect,
            "Disconnecting"
        );
        if let Err(e) = self
            .transmitter
            .send_frame(&Frame::disconnect(reason, reconnect))
        {
            debug!(connection_id = %self.id(), error = %e, "Disconnect frame not delivered");
        }
    }

    /// Tear down every subscription and the internal stream. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.subscriptions.unsubscribe_from_all().await;
        if let Some((stream, subscriber)) = self.internal.take() {
            self.adapter.unsubscribe(&stream, &subscriber);
        }
        info!(connection_id = %self.id(), "Connection closed");
    }

    /// Drive the connection until it is closed or every
    /// [`ConnectionHandle`] is dropped.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        if let Err(e) = self.open() {
            error!(connection_id = %self.id(), error = %e, "Failed to open connection");
            self.close().await;
            return;
        }

        while let Some(inbound) = inbox.recv().await {
            match inbound {
                Inbound::Frame(text) => self.receive(&text).await,
                Inbound::Beat => self.beat(),
                Inbound::Disconnect { reason, reconnect } => {
                    self.send_disconnect(reason, reconnect);
                    break;
                }
                Inbound::Close => break,
            }
        }

        self.close().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Only reached with a registration left when `close` did not finish.
        if let Some((stream, subscriber)) = self.internal.take() {
            self.adapter.unsubscribe(&stream, &subscriber);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subscriptions", &self.subscriptions)
            .field("closed", &self.closed)
            .finish()
    }
}
