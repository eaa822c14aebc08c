//! Transports carry text frames between a client connection and a server.
//!
//! A transport session is a pair of queues: commands flow in, events flow
//! out. Opening never blocks; the outcome of the handshake arrives as the
//! first event.

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace, warn};

/// How long a closing WebSocket waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed.
    Open {
        /// Sub-protocol selected by the server.
        protocol: Option<String>,
    },
    /// A text frame arrived.
    Message(String),
    /// The transport is closed. Always the last event.
    Close {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// A failure occurred. A `Close` follows.
    Error(String),
}

/// Instruction for a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Write a text frame.
    Send(String),
    /// Start the close handshake.
    Close,
}

/// Queues connecting a client connection to one transport instance.
#[derive(Debug)]
pub struct TransportSession {
    /// Commands for the transport. Dropping the sender closes it.
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    /// Events from the transport.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for transport sessions.
pub trait Transport: Send + Sync + 'static {
    /// Begin connecting, offering `protocols` in preference order.
    ///
    /// Must be called within a tokio runtime.
    fn open(&self, protocols: &[String]) -> TransportSession;
}

/// WebSocket transport built on tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    headers: HashMap<String, String>,
}

impl WebSocketTransport {
    /// Create a transport for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a header to every handshake request, e.g. a cookie or token.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, protocols: &[String]) -> Result<Request<()>> {
        let mut request = self.url.as_str().into_client_request()?;

        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| ClientError::InvalidRequest(format!("invalid protocol list: {}", e)))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::InvalidRequest(format!("invalid header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::InvalidRequest(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, protocols: &[String]) -> TransportSession {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        match self.request(protocols) {
            Ok(request) => {
                tokio::spawn(run_websocket(request, commands_rx, events_tx));
            }
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                let _ = events_tx.send(TransportEvent::Close {
                    code: None,
                    reason: e.to_string(),
                });
            }
        }

        TransportSession {
            commands: commands_tx,
            events: events_rx,
        }
    }
}

async fn run_websocket(
    request: Request<()>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let uri = request.uri().to_string();
    let (ws, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!(url = %uri, error = %e, "WebSocket handshake failed");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::Close {
                code: None,
                reason: e.to_string(),
            });
            return;
        }
    };

    let protocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!(url = %uri, protocol = ?protocol, "WebSocket open");
    let _ = events.send(TransportEvent::Open { protocol });

    let (mut sink, mut stream) = ws.split();
    let mut code = None;
    let mut reason = String::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        reason = e.to_string();
                        break;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let drained = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        while let Some(Ok(message)) = stream.next().await {
                            if let Message::Close(frame) = message {
                                return frame.map(|f| (u16::from(f.code), f.reason.to_string()));
                            }
                        }
                        None
                    })
                    .await;
                    match drained {
                        Ok(Some((c, r))) => {
                            code = Some(c);
                            reason = r;
                        }
                        Ok(None) => {}
                        Err(_) => warn!(url = %uri, "Close handshake timed out"),
                    }
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    trace!(url = %uri, "Frame received");
                    let _ = events.send(TransportEvent::Message(text.as_str().to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        code = Some(u16::from(frame.code));
                        reason = frame.reason.to_string();
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    reason = e.to_string();
                    break;
                }
                None => break,
            },
        }
    }

    debug!(url = %uri, code = ?code, "WebSocket closed");
    let _ = events.send(TransportEvent::Close { code, reason });
}

/// In-process transport paired with a [`MemoryAcceptor`].
///
/// Each `open` hands the server side a [`MemoryPeer`]. A close requested by
/// the client is acknowledged immediately, like a completed close handshake.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    acceptor: mpsc::UnboundedSender<MemoryPeer>,
    protocol: Option<String>,
}

impl MemoryTransport {
    /// Create a transport whose handshakes select `protocol`.
    pub fn pair(protocol: Option<&str>) -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                acceptor: tx,
                protocol: protocol.map(str::to_string),
            },
            MemoryAcceptor { incoming: rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn open(&self, protocols: &[String]) -> TransportSession {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            offered_protocols: protocols.to_vec(),
            events: events_tx.clone(),
            from_client,
        };

        if self.acceptor.send(peer).is_err() {
            let _ = events_tx.send(TransportEvent::Error("connection refused".to_string()));
            let _ = events_tx.send(TransportEvent::Close {
                code: None,
                reason: "connection refused".to_string(),
            });
        } else {
            let _ = events_tx.send(TransportEvent::Open {
                protocol: self.protocol.clone(),
            });

            tokio::spawn(async move {
                while let Some(command) = commands_rx.recv().await {
                    match command {
                        TransportCommand::Send(text) => {
                            let _ = to_peer.send(text);
                        }
                        TransportCommand::Close => break,
                    }
                }
                let _ = events_tx.send(TransportEvent::Close {
                    code: Some(1000),
                    reason: String::new(),
                });
            });
        }

        TransportSession {
            commands: commands_tx,
            events: events_rx,
        }
    }
}

/// Server side of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    /// Wait for the next client open.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take a pending open without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }
}

/// The server's end of one in-process transport.
#[derive(Debug)]
pub struct MemoryPeer {
    offered_protocols: Vec<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Protocols the client offered.
    pub fn offered_protocols(&self) -> &[String] {
        &self.offered_protocols
    }

    /// Deliver a text frame to the client.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    /// Next frame written by the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Take a written frame without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Close from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Close {
            code: Some(code),
            reason: reason.to_string(),
        });
    }
}
