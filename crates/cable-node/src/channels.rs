//! Channels served by the node out of the box.

use async_trait::async_trait;
use cable_core::{CableError, Channel, ChannelContext, ChannelRegistry, Result};
use serde_json::{json, Value};
use tracing::debug;

/// Room chat. Subscribing requires a `room` param; `speak` broadcasts
/// `{"text": ...}` to everyone in the room.
#[derive(Debug, Default)]
pub struct ChatChannel {
    room: String,
}

impl ChatChannel {
    /// Broadcasting stream of a room.
    pub fn stream_for_room(room: &str) -> String {
        format!("chat_{}", room)
    }
}

#[async_trait]
impl Channel for ChatChannel {
    async fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        match ctx.params().param_str("room") {
            Some(room) if !room.is_empty() => {
                ctx.stream_from(Self::stream_for_room(&room));
                self.room = room;
            }
            _ => {
                debug!(identifier = %ctx.identifier(), "Chat subscription without a room");
                ctx.reject();
            }
        }
        Ok(())
    }

    async fn perform(&mut self, ctx: &mut ChannelContext, action: &str, data: Value) -> Result<()> {
        match action {
            "speak" => {
                let message = json!({ "text": data.get("text").cloned().unwrap_or(Value::Null) });
                ctx.broadcast_to(&Self::stream_for_room(&self.room), &message)
                    .await
            }
            _ => Err(CableError::UnknownAction {
                channel: ctx.channel_name().to_string(),
                action: action.to_string(),
            }),
        }
    }
}

/// Sends every received payload back to the subscriber, minus the action.
#[derive(Debug, Default)]
pub struct EchoChannel;

#[async_trait]
impl Channel for EchoChannel {
    async fn perform(&mut self, ctx: &mut ChannelContext, _action: &str, mut data: Value) -> Result<()> {
        if let Value::Object(fields) = &mut data {
            fields.remove("action");
        }
        ctx.transmit(data)
    }
}

/// Registry with every built-in channel.
pub fn default_registry() -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry
        .register_default::<ChatChannel>("ChatChannel")
        .register_default::<EchoChannel>("EchoChannel");
    registry
}
