//! Cable Node - real-time pub/sub server.
//!
//! This is the main entry point for running a cable node.

use anyhow::Context;
use cable_node::config::{AdapterKind, NodeConfig};
use cable_node::observability::{init_logging, LogFormat};
use cable_node::Node;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Cable Node - WebSocket pub/sub server
#[derive(Parser, Debug)]
#[command(name = "cable-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Pub/sub adapter
    #[arg(long, value_enum)]
    adapter: Option<AdapterKind>,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(adapter) = self.adapter {
            config.adapter.kind = adapter;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("validating command-line overrides")?;

    init_logging(&config.log.level, LogFormat::parse(&config.log.format));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting cable node");
    tracing::info!(
        listen = %config.listen,
        mount_path = %config.mount_path,
        adapter = ?config.adapter.kind,
        failure_policy = ?config.adapter.failure_policy,
        "Node configuration"
    );

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let node = Node::new(&config);
    let result = node
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "Cable node stopped with an error");
    } else {
        tracing::info!("Cable node stopped");
    }
    result
}
