//! In-process notify/listen broker.
//!
//! Behaves like an external broker reached over separate connections: each
//! [`LoopbackListener`] has its own LISTEN set and notification queue, and
//! [`LoopbackBackend::sever`] drops every connection at once to simulate a
//! backend outage.

use super::networked::{Notification, NotifyBackend, NotifyListener};
use crate::error::{CableError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Broker {
    next_id: u64,
    offline: bool,
    connections: HashMap<u64, BrokerConnection>,
}

struct BrokerConnection {
    streams: HashSet<String>,
    sender: mpsc::UnboundedSender<Notification>,
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    broker: Arc<Mutex<Broker>>,
}

impl LoopbackBackend {
    /// Create an empty, online broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open connections listening on `stream`.
    pub fn listen_count(&self, stream: &str) -> usize {
        self.broker
            .lock()
            .connections
            .values()
            .filter(|c| c.streams.contains(stream))
            .count()
    }

    /// Number of open listening connections.
    pub fn connection_count(&self) -> usize {
        self.broker.lock().connections.len()
    }

    /// Drop every open connection and refuse new ones until
    /// [`restore`](Self::restore).
    pub fn sever(&self) {
        let mut broker = self.broker.lock();
        broker.offline = true;
        broker.connections.clear();
        debug!("Loopback broker severed");
    }

    /// Accept connections again.
    pub fn restore(&self) {
        self.broker.lock().offline = false;
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let broker = self.broker.lock();
        f.debug_struct("LoopbackBackend")
            .field("connections", &broker.connections.len())
            .field("offline", &broker.offline)
            .finish()
    }
}

#[async_trait]
impl NotifyBackend for LoopbackBackend {
    async fn connect(&self) -> Result<Box<dyn NotifyListener>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut broker = self.broker.lock();
        if broker.offline {
            return Err(CableError::Adapter("backend unavailable".to_string()));
        }

        broker.next_id += 1;
        let id = broker.next_id;
        broker.connections.insert(
            id,
            BrokerConnection {
                streams: HashSet::new(),
                sender,
            },
        );

        Ok(Box::new(LoopbackListener {
            id,
            broker: self.broker.clone(),
            receiver,
        }))
    }

    async fn publish(&self, stream: &str, payload: &str) -> Result<()> {
        let broker = self.broker.lock();
        if broker.offline {
            return Err(CableError::Adapter("backend unavailable".to_string()));
        }

        for connection in broker.connections.values() {
            if connection.streams.contains(stream) {
                let _ = connection.sender.send(Notification {
                    stream: stream.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One listening connection to a [`LoopbackBackend`].
pub struct LoopbackListener {
    id: u64,
    broker: Arc<Mutex<Broker>>,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl LoopbackListener {
    fn with_streams<T>(&self, f: impl FnOnce(&mut HashSet<String>) -> T) -> Result<T> {
        let mut broker = self.broker.lock();
        match broker.connections.get_mut(&self.id) {
            Some(connection) => Ok(f(&mut connection.streams)),
            None => Err(CableError::Adapter("connection lost".to_string())),
        }
    }
}

#[async_trait]
impl NotifyListener for LoopbackListener {
    async fn listen(&mut self, stream: &str) -> Result<()> {
        self.with_streams(|streams| {
            streams.insert(stream.to_string());
        })
    }

    async fn unlisten(&mut self, stream: &str) -> Result<()> {
        self.with_streams(|streams| {
            streams.remove(stream);
        })
    }

    async fn next_notification(&mut self) -> Result<Notification> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| CableError::Adapter("connection lost".to_string()))
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.broker.lock().connections.remove(&self.id);
    }
}
