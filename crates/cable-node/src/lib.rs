//! # Cable Node
//!
//! Hosts a cable server over axum WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Cable Node                   │
//! ├───────────────────────────────────────────────┤
//! │  HTTP (axum)                                  │
//! │   • /cable          WebSocket upgrade         │
//! │   • /cable/stats    counters                  │
//! │   • /cable/broadcast, /cable/disconnect       │
//! │                      │                        │
//! │  Server (cable-core) ▼                        │
//! │   • connections, heartbeat, channels          │
//! │                      │                        │
//! │  PubSubAdapter       ▼                        │
//! │   • inline, or networked over a backend       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin cable-node -- --listen 127.0.0.1:8080
//! ```
//!
//! ## Modules
//!
//! - [`api`] - HTTP routes and the WebSocket bridge
//! - [`channels`] - Built-in channels
//! - [`config`] - Node configuration
//! - [`observability`] - Structured logging

pub mod api;
pub mod channels;
pub mod config;
pub mod observability;

use crate::api::{create_router, AppState};
use crate::config::{AdapterKind, NodeConfig};
use anyhow::bail;
use axum::Router;
use cable_core::{
    ChannelRegistry, InlineAdapter, LoopbackBackend, NetworkedAdapter, PubSubAdapter, Server,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A configured node: server, adapter and router.
pub struct Node {
    server: Arc<Server>,
    adapter: Arc<dyn PubSubAdapter>,
    router: Router,
    adapter_failure: Option<CancellationToken>,
}

impl Node {
    /// Build a node serving the built-in channels. Must be called within a
    /// tokio runtime.
    pub fn new(config: &NodeConfig) -> Self {
        Self::with_registry(config, channels::default_registry())
    }

    /// Build a node serving `registry`.
    pub fn with_registry(config: &NodeConfig, registry: ChannelRegistry) -> Self {
        let (adapter, adapter_failure): (Arc<dyn PubSubAdapter>, Option<CancellationToken>) =
            match config.adapter.kind {
                AdapterKind::Inline => (Arc::new(InlineAdapter::new()), None),
                AdapterKind::Networked => {
                    let networked = NetworkedAdapter::start(
                        Arc::new(LoopbackBackend::new()),
                        config.networked_config(),
                    );
                    let failure = networked.failure_token();
                    (Arc::new(networked), Some(failure))
                }
            };

        let server = Server::new(config.server_config(), adapter.clone(), registry);
        server.start_heartbeat();

        let router = create_router(
            AppState {
                server: server.clone(),
            },
            &config.mount_path,
        );

        Self {
            server,
            adapter,
            router,
            adapter_failure,
        }
    }

    /// The connection hub.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// The HTTP router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` resolves or the adapter fails.
    ///
    /// On shutdown every client is told to reconnect elsewhere. A failed
    /// fail-fast adapter is returned as an error.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let failure = self.adapter_failure.clone().unwrap_or_default();
        let server = self.server.clone();
        let watched = failure.clone();

        info!(addr = ?listener.local_addr().ok(), "Cable node listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown => info!("Shutdown requested"),
                    _ = watched.cancelled() => error!("Pub/sub adapter failed, shutting down"),
                }
                server.restart();
            })
            .await?;

        self.server.shutdown();
        self.adapter.shutdown();

        if failure.is_cancelled() {
            bail!("pub/sub adapter lost its backend");
        }
        Ok(())
    }
}
