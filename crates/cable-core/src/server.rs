//! Connection registry, heartbeat and server-wide operations.

use crate::adapter::PubSubAdapter;
use crate::channel::ChannelRegistry;
use crate::connection::{
    internal_stream, Connection, ConnectionHandle, ConnectionId, ConnectionIdentifiers,
    ConnectionSession, InternalMessage, Transmitter,
};
use crate::error::{CableError, Result};
use crate::protocol::DisconnectReason;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between heartbeat pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

/// Default maximum number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Current number of connections.
    pub current_connections: usize,
    /// Total connections since start.
    pub total_connections: u64,
    /// Total subscriptions established since start.
    pub total_subscriptions: u64,
    /// Total broadcasts published since start.
    pub total_broadcasts: u64,
    /// Streams with at least one local subscriber.
    pub active_streams: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    total_subscriptions: Arc<AtomicU64>,
    total_broadcasts: AtomicU64,
}

/// Removes a connection from the registry when its task ends, including
/// when the task unwinds.
struct Registration {
    server: Weak<Server>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.remove(&self.id);
        }
    }
}

/// Owns every live connection of this process.
pub struct Server {
    config: ServerConfig,
    adapter: Arc<dyn PubSubAdapter>,
    registry: Arc<ChannelRegistry>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    counters: Counters,
    heartbeat: Mutex<Option<CancellationToken>>,
}

impl Server {
    /// Create a server around an adapter and the available channels.
    pub fn new(
        config: ServerConfig,
        adapter: Arc<dyn PubSubAdapter>,
        registry: ChannelRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            adapter,
            registry: Arc::new(registry),
            connections: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            heartbeat: Mutex::new(None),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The pub/sub adapter shared by every connection.
    pub fn adapter(&self) -> &Arc<dyn PubSubAdapter> {
        &self.adapter
    }

    /// Accept a new connection and spawn its task.
    ///
    /// The returned session's outbound queue already holds the welcome frame
    /// once the task starts.
    pub fn connect(self: &Arc<Self>, identifiers: ConnectionIdentifiers) -> Result<ConnectionSession> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            warn!(max = self.config.max_connections, "Connection limit reached");
            return Err(CableError::ConnectionLimit(self.config.max_connections));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (handle, inbox) = ConnectionHandle::new(id.clone(), identifiers);
        let (transmitter, outbound) = Transmitter::channel(&id);
        let connection = Connection::new(
            &handle,
            transmitter,
            self.adapter.clone(),
            self.registry.clone(),
        )
        .with_counter(self.counters.total_subscriptions.clone());

        connections.insert(id.clone(), handle.clone());
        drop(connections);
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);

        let registration = Registration {
            server: Arc::downgrade(self),
            id,
        };
        tokio::spawn(async move {
            let _registration = registration;
            connection.run(inbox).await;
        });

        Ok(ConnectionSession { handle, outbound })
    }

    fn remove(&self, id: &str) {
        if self.connections.write().remove(id).is_some() {
            debug!(connection_id = %id, "Connection removed");
        }
    }

    /// Look up a live connection.
    pub fn connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.read().get(id).cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Publish `payload` on `stream` to every subscriber sharing the adapter.
    pub async fn broadcast(&self, stream: &str, payload: &Value) -> Result<()> {
        self.adapter.broadcast(stream, &payload.to_string()).await?;
        self.counters.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(stream = %stream, "Broadcast published");
        Ok(())
    }

    /// Disconnect every connection, in any process sharing the adapter,
    /// established with `identifiers`.
    pub async fn disconnect_remote(
        &self,
        identifiers: &ConnectionIdentifiers,
        reconnect: bool,
    ) -> Result<()> {
        let payload = serde_json::to_string(&InternalMessage::Disconnect { reconnect })?;
        self.adapter
            .broadcast(&internal_stream(identifiers), &payload)
            .await
    }

    /// Ask every local connection to disconnect with `server_restart` and
    /// reconnect.
    pub fn restart(&self) {
        let connections: Vec<ConnectionHandle> = self.connections.read().values().cloned().collect();
        info!(connections = connections.len(), "Restarting connections");
        for handle in connections {
            let _ = handle.disconnect(DisconnectReason::ServerRestart, true);
        }
    }

    /// Send one heartbeat to every local connection.
    pub fn beat(&self) {
        for handle in self.connections.read().values() {
            let _ = handle.beat();
        }
    }

    /// Start the heartbeat loop. Calling it again replaces the running loop.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.heartbeat.lock().replace(token.clone()) {
            previous.cancel();
        }

        let server: Weak<Self> = Arc::downgrade(self);
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => match server.upgrade() {
                        Some(server) => server.beat(),
                        None => break,
                    },
                }
            }
            debug!("Heartbeat stopped");
        });
    }

    /// Stop the heartbeat, restart every connection and stop the adapter.
    pub fn shutdown(&self) {
        if let Some(token) = self.heartbeat.lock().take() {
            token.cancel();
        }
        self.restart();
        self.adapter.shutdown();
        info!("Server shut down");
    }

    /// Current statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            current_connections: self.connection_count(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            total_subscriptions: self.counters.total_subscriptions.load(Ordering::Relaxed),
            total_broadcasts: self.counters.total_broadcasts.load(Ordering::Relaxed),
            active_streams: self.adapter.subscriber_map().streams().len(),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .field("registry", &self.registry)
            .finish()
    }
}
