//! End-to-end flows through the public API: servers, channels and adapters.

use async_trait::async_trait;
use cable_core::{
    CableError, Channel, ChannelContext, ChannelRegistry, Command, ConnectionIdentifiers,
    ConnectionSession, Frame, InlineAdapter, LoopbackBackend, MessageType, NetworkedAdapter,
    NetworkedConfig, PubSubAdapter, Result, Server, ServerConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct ChatChannel {
    room: String,
}

impl ChatChannel {
    fn stream(&self) -> String {
        format!("chat_{}", self.room)
    }
}

#[async_trait]
impl Channel for ChatChannel {
    async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        if self.room.is_empty() {
            ctx.reject();
            return Ok(());
        }
        ctx.stream_from(self.stream());
        Ok(())
    }

    async fn perform(&mut self, ctx: &mut ChannelContext, action: &str, data: Value) -> Result<()> {
        match action {
            "speak" => {
                let message = json!({"text": data["text"], "room": self.room});
                ctx.broadcast_to(&self.stream(), &message).await
            }
            _ => Err(CableError::UnknownAction {
                channel: ctx.channel_name().to_string(),
                action: action.to_string(),
            }),
        }
    }
}

fn registry() -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry.register("ChatChannel", |id| ChatChannel {
        room: id.param_str("room").unwrap_or_default(),
    });
    registry
}

fn chat_identifier(room: &str) -> String {
    json!({"channel": "ChatChannel", "room": room}).to_string()
}

async fn next_frame(session: &mut ConnectionSession) -> Frame {
    let text = tokio::time::timeout(Duration::from_secs(2), session.outbound.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    Frame::decode(&text).unwrap()
}

async fn assert_silent(session: &mut ConnectionSession) {
    let outcome = tokio::time::timeout(Duration::from_millis(50), session.outbound.recv()).await;
    assert!(outcome.is_err(), "unexpected frame: {:?}", outcome);
}

fn send(session: &ConnectionSession, command: &Command) {
    session.handle.receive(command.encode().unwrap()).unwrap();
}

async fn connect(server: &Arc<Server>) -> ConnectionSession {
    let mut session = server.connect(ConnectionIdentifiers::new()).unwrap();
    assert_eq!(next_frame(&mut session).await.kind, Some(MessageType::Welcome));
    session
}

#[tokio::test]
async fn test_subscribe_confirm_then_receive_broadcast() {
    let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry());
    let mut session = connect(&server).await;
    let id = chat_identifier("1");

    send(&session, &Command::subscribe(id.clone()));
    let confirm = next_frame(&mut session).await;
    assert_eq!(confirm.kind, Some(MessageType::Confirmation));
    assert_eq!(confirm.identifier.as_deref(), Some(id.as_str()));

    server.broadcast("chat_1", &json!({"text": "hello"})).await.unwrap();
    let frame = next_frame(&mut session).await;
    assert_eq!(frame.identifier.as_deref(), Some(id.as_str()));
    assert_eq!(frame.message, Some(json!({"text": "hello"})));
}

#[tokio::test]
async fn test_two_connections_share_one_room() {
    let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let id = chat_identifier("42");

    send(&alice, &Command::subscribe(id.clone()));
    send(&bob, &Command::subscribe(id.clone()));
    next_frame(&mut alice).await;
    next_frame(&mut bob).await;

    send(
        &alice,
        &Command::message(id.clone(), &json!({"action": "speak", "text": "hi"})).unwrap(),
    );

    for session in [&mut alice, &mut bob] {
        let frame = next_frame(session).await;
        assert_eq!(frame.message, Some(json!({"text": "hi", "room": "42"})));
    }

    // One local listener for the room regardless of subscriber count.
    assert_eq!(server.adapter().subscriber_map().subscriber_count("chat_42"), 2);
}

#[tokio::test]
async fn test_unknown_command_is_survived() {
    let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry());
    let mut session = connect(&server).await;

    session
        .handle
        .receive(r#"{"command":"explode","identifier":"{}"}"#)
        .unwrap();
    session.handle.receive("not even json").unwrap();
    assert_silent(&mut session).await;

    send(&session, &Command::subscribe(chat_identifier("1")));
    assert_eq!(
        next_frame(&mut session).await.kind,
        Some(MessageType::Confirmation)
    );
}

#[tokio::test]
async fn test_message_after_unsubscribe_is_ignored() {
    let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry());
    let mut session = connect(&server).await;
    let id = chat_identifier("1");

    send(&session, &Command::subscribe(id.clone()));
    next_frame(&mut session).await;
    send(&session, &Command::unsubscribe(id.clone()));
    send(
        &session,
        &Command::message(id, &json!({"action": "speak", "text": "late"})).unwrap(),
    );

    assert_silent(&mut session).await;
    assert!(server.adapter().subscriber_map().streams().is_empty());
}

#[tokio::test]
async fn test_rejected_subscription() {
    let server = Server::new(ServerConfig::default(), Arc::new(InlineAdapter::new()), registry());
    let mut session = connect(&server).await;
    let id = json!({"channel": "ChatChannel"}).to_string();

    send(&session, &Command::subscribe(id.clone()));
    let frame = next_frame(&mut session).await;
    assert_eq!(frame.kind, Some(MessageType::Rejection));
    assert_eq!(frame.identifier.as_deref(), Some(id.as_str()));
    assert_eq!(server.stats().total_subscriptions, 0);
}

#[tokio::test]
async fn test_broadcast_across_processes() {
    let backend = LoopbackBackend::new();
    let adapter_a = Arc::new(NetworkedAdapter::start(
        Arc::new(backend.clone()),
        NetworkedConfig::default(),
    ));
    let adapter_b = Arc::new(NetworkedAdapter::start(
        Arc::new(backend.clone()),
        NetworkedConfig::default(),
    ));
    let server_a = Server::new(ServerConfig::default(), adapter_a.clone(), registry());
    let server_b = Server::new(ServerConfig::default(), adapter_b.clone(), registry());

    let mut on_a = connect(&server_a).await;
    let mut on_b = connect(&server_b).await;
    let id = chat_identifier("7");

    send(&on_a, &Command::subscribe(id.clone()));
    send(&on_b, &Command::subscribe(id.clone()));

    // Confirmation arrives only once the backend is listening.
    assert_eq!(next_frame(&mut on_a).await.kind, Some(MessageType::Confirmation));
    assert_eq!(next_frame(&mut on_b).await.kind, Some(MessageType::Confirmation));
    assert_eq!(backend.listen_count("chat_7"), 2);

    send(
        &on_a,
        &Command::message(id.clone(), &json!({"action": "speak", "text": "over the wire"})).unwrap(),
    );
    for session in [&mut on_a, &mut on_b] {
        let frame = next_frame(session).await;
        assert_eq!(frame.message.unwrap()["text"], "over the wire");
    }

    // Last local subscriber leaving stops the backend listen.
    send(&on_b, &Command::unsubscribe(id));
    assert_silent(&mut on_b).await;
    adapter_b.flush().await.unwrap();
    assert_eq!(backend.listen_count("chat_7"), 1);
}

#[tokio::test]
async fn test_remote_disconnect_across_processes() {
    let backend = LoopbackBackend::new();
    let adapter_a = Arc::new(NetworkedAdapter::start(
        Arc::new(backend.clone()),
        NetworkedConfig::default(),
    ));
    let adapter_b = Arc::new(NetworkedAdapter::start(
        Arc::new(backend.clone()),
        NetworkedConfig::default(),
    ));
    let server_a = Server::new(ServerConfig::default(), adapter_a.clone(), registry());
    let server_b = Server::new(ServerConfig::default(), adapter_b, registry());

    let mut ids = ConnectionIdentifiers::new();
    ids.insert("current_user".into(), "42".into());
    let mut session = server_a.connect(ids.clone()).unwrap();
    assert_eq!(next_frame(&mut session).await.kind, Some(MessageType::Welcome));
    adapter_a.flush().await.unwrap();

    server_b.disconnect_remote(&ids, true).await.unwrap();

    let frame = next_frame(&mut session).await;
    assert_eq!(frame.kind, Some(MessageType::Disconnect));
    assert_eq!(frame.reconnect, Some(true));
}

mod listen_convergence {
    use super::*;
    use cable_core::Subscriber;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Any sequence of adds and removes through the networked adapter
        /// leaves the backend listening exactly once on each stream that
        /// still has a local subscriber, and nowhere else.
        #[test]
        fn prop_backend_listens_only_on_subscribed_streams(
            ops in proptest::collection::vec((0usize..3, 0usize..4, any::<bool>()), 0..48),
            cycles in 0usize..20,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let backend = LoopbackBackend::new();
                let adapter = NetworkedAdapter::start(
                    Arc::new(backend.clone()),
                    NetworkedConfig::default(),
                );
                let subscribers: Vec<Subscriber> =
                    (0..4).map(|_| Subscriber::new(|_| Ok(()))).collect();

                for (stream, who, add) in &ops {
                    let stream = format!("stream-{}", stream);
                    if *add {
                        adapter.subscribe(&stream, subscribers[*who].clone(), None);
                    } else {
                        adapter.unsubscribe(&stream, &subscribers[*who]);
                    }
                }

                // Full subscribe/unsubscribe cycles on a dedicated stream.
                let churn = Subscriber::new(|_| Ok(()));
                for _ in 0..cycles {
                    adapter.subscribe("churn", churn.clone(), None);
                    adapter.unsubscribe("churn", &churn);
                }

                adapter.flush().await.unwrap();

                for stream in (0..3).map(|i| format!("stream-{}", i)) {
                    let expected = usize::from(adapter.subscriber_map().is_listening(&stream));
                    assert_eq!(backend.listen_count(&stream), expected, "{}", stream);
                }
                assert_eq!(backend.listen_count("churn"), 0);
                adapter.shutdown();
            });
        }
    }
}
