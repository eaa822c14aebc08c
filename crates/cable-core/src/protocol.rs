//! Wire protocol: inbound commands, outbound frames and sub-protocol tokens.
//!
//! ```json
//! // client -> server
//! {"command": "subscribe", "identifier": "{\"channel\":\"ChatChannel\",\"room\":\"1\"}"}
//! {"command": "message", "identifier": "...", "data": "{\"action\":\"speak\",\"text\":\"hi\"}"}
//!
//! // server -> client
//! {"type": "welcome"}
//! {"type": "ping", "message": 1700000000}
//! {"identifier": "...", "type": "confirm_subscription"}
//! {"identifier": "...", "message": {"text": "hi"}}
//! ```

use crate::error::{CableError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Sub-protocols offered during the transport handshake, most preferred first.
///
/// The last entry is a legacy marker: clients offer it so that old servers
/// still complete the handshake, but it is never accepted as supported.
pub const PROTOCOLS: &[&str] = &["actioncable-v1-json", "actioncable-unsupported"];

/// Protocols a connection may actually speak.
pub fn supported_protocols() -> &'static [&'static str] {
    &PROTOCOLS[..PROTOCOLS.len() - 1]
}

/// Check whether a negotiated sub-protocol is usable.
pub fn is_supported_protocol(protocol: Option<&str>) -> bool {
    match protocol {
        Some(p) => supported_protocols().contains(&p),
        None => false,
    }
}

/// Control frame types sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Connection accepted.
    Welcome,
    /// Server is closing the connection.
    Disconnect,
    /// Heartbeat.
    Ping,
    /// A subscription was established.
    #[serde(rename = "confirm_subscription")]
    Confirmation,
    /// A subscription was refused.
    #[serde(rename = "reject_subscription")]
    Rejection,
    /// Any type this implementation does not know about.
    #[serde(other)]
    Unknown,
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Identification failed.
    Unauthorized,
    /// The request could not be served.
    InvalidRequest,
    /// The server is restarting.
    ServerRestart,
    /// Closed on request of another process.
    Remote,
    /// Unrecognized reason.
    #[serde(other)]
    Other,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Unauthorized => "unauthorized",
            DisconnectReason::InvalidRequest => "invalid_request",
            DisconnectReason::ServerRestart => "server_restart",
            DisconnectReason::Remote => "remote",
            DisconnectReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// Outbound frame (server to client). Also the shape clients decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Subscription identifier, absent for connection-level frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Control type, absent for data messages.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// Disconnect reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
    /// Whether the client may reconnect after a disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

impl Frame {
    fn control(kind: MessageType) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// `welcome` frame.
    pub fn welcome() -> Self {
        Self::control(MessageType::Welcome)
    }

    /// `ping` frame carrying the server time in seconds.
    pub fn ping(timestamp: u64) -> Self {
        Self {
            message: Some(Value::from(timestamp)),
            ..Self::control(MessageType::Ping)
        }
    }

    /// `disconnect` frame.
    pub fn disconnect(reason: DisconnectReason, reconnect: bool) -> Self {
        Self {
            reason: Some(reason),
            reconnect: Some(reconnect),
            ..Self::control(MessageType::Disconnect)
        }
    }

    /// Subscription confirmation.
    pub fn confirmation(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control(MessageType::Confirmation)
        }
    }

    /// Subscription rejection.
    pub fn rejection(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control(MessageType::Rejection)
        }
    }

    /// Data message for one subscription.
    pub fn message(identifier: impl Into<String>, message: Value) -> Self {
        Self {
            identifier: Some(identifier.into()),
            message: Some(message),
            ..Default::default()
        }
    }

    /// Serialize to the JSON text sent over the transport.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from the server.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Recognized command discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Create a channel instance.
    Subscribe,
    /// Tear down a channel instance.
    Unsubscribe,
    /// Perform an action on a channel instance.
    Message,
}

impl CommandKind {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Subscribe => "subscribe",
            CommandKind::Unsubscribe => "unsubscribe",
            CommandKind::Message => "message",
        }
    }
}

/// Inbound command frame (client to server).
///
/// `command` stays a plain string so that unknown commands reach the
/// dispatcher and get logged instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command discriminator.
    pub command: String,
    /// Serialized channel identifier.
    #[serde(default)]
    pub identifier: String,
    /// JSON-encoded action data for `message` commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Command {
    fn new(kind: CommandKind, identifier: impl Into<String>) -> Self {
        Self {
            command: kind.as_str().to_string(),
            identifier: identifier.into(),
            data: None,
        }
    }

    /// `subscribe` command.
    pub fn subscribe(identifier: impl Into<String>) -> Self {
        Self::new(CommandKind::Subscribe, identifier)
    }

    /// `unsubscribe` command.
    pub fn unsubscribe(identifier: impl Into<String>) -> Self {
        Self::new(CommandKind::Unsubscribe, identifier)
    }

    /// `message` command with JSON data.
    pub fn message(identifier: impl Into<String>, data: &Value) -> Result<Self> {
        let mut command = Self::new(CommandKind::Message, identifier);
        command.data = Some(serde_json::to_string(data)?);
        Ok(command)
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CableError::InvalidCommand(e.to_string()))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The recognized command kind, if any.
    pub fn kind(&self) -> Option<CommandKind> {
        match self.command.as_str() {
            "subscribe" => Some(CommandKind::Subscribe),
            "unsubscribe" => Some(CommandKind::Unsubscribe),
            "message" => Some(CommandKind::Message),
            _ => None,
        }
    }

    /// Decode the `data` payload. Missing data decodes to an empty object.
    pub fn decoded_data(&self) -> Result<Value> {
        match &self.data {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Value::Object(Map::new())),
        }
    }
}

/// Decoded form of a subscription identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIdentifier {
    /// Channel class name, e.g. `ChatChannel`.
    pub channel: String,
    /// Every other key of the identifier object.
    pub params: Map<String, Value>,
}

impl ChannelIdentifier {
    /// Decode an identifier string. It must be a JSON object with a string
    /// `channel` field.
    pub fn parse(identifier: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(identifier)
            .map_err(|e| CableError::InvalidIdentifier(format!("{}: {}", identifier, e)))?;

        let Value::Object(mut params) = value else {
            return Err(CableError::InvalidIdentifier(format!(
                "identifier is not an object: {}",
                identifier
            )));
        };

        match params.remove("channel") {
            Some(Value::String(channel)) if !channel.is_empty() => Ok(Self { channel, params }),
            _ => Err(CableError::InvalidIdentifier(format!(
                "missing channel name: {}",
                identifier
            ))),
        }
    }

    /// A parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// A parameter rendered as a string. Numbers and booleans are stringified.
    pub fn param_str(&self, name: &str) -> Option<String> {
        match self.params.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Encode back into an identifier string.
    pub fn encode(&self) -> String {
        let mut object = Map::new();
        object.insert("channel".to_string(), Value::String(self.channel.clone()));
        for (k, v) in &self.params {
            object.insert(k.clone(), v.clone());
        }
        Value::Object(object).to_string()
    }
}

/// Current unix time in seconds.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_protocols_exclude_legacy_marker() {
        assert_eq!(supported_protocols(), &["actioncable-v1-json"]);
        assert!(is_supported_protocol(Some("actioncable-v1-json")));
        assert!(!is_supported_protocol(Some("actioncable-unsupported")));
        assert!(!is_supported_protocol(None));
    }

    #[test]
    fn test_frame_wire_names() {
        let json = Frame::confirmation("x").encode().unwrap();
        assert_eq!(json, r#"{"identifier":"x","type":"confirm_subscription"}"#);

        let json = Frame::rejection("x").encode().unwrap();
        assert!(json.contains("reject_subscription"));

        let json = Frame::welcome().encode().unwrap();
        assert_eq!(json, r#"{"type":"welcome"}"#);

        let json = Frame::disconnect(DisconnectReason::ServerRestart, true)
            .encode()
            .unwrap();
        assert!(json.contains(r#""reason":"server_restart""#));
        assert!(json.contains(r#""reconnect":true"#));
    }

    #[test]
    fn test_data_frame_has_no_type() {
        let json = Frame::message("id", serde_json::json!({"text": "hi"}))
            .encode()
            .unwrap();
        assert!(!json.contains("type"));
        assert!(json.contains(r#""message":{"text":"hi"}"#));
    }

    #[test]
    fn test_unknown_frame_type_decodes() {
        let frame = Frame::decode(r#"{"type":"something_new"}"#).unwrap();
        assert_eq!(frame.kind, Some(MessageType::Unknown));
    }

    #[test]
    fn test_command_kind() {
        let cmd = Command::decode(r#"{"command":"explode","identifier":"x"}"#).unwrap();
        assert_eq!(cmd.kind(), None);

        let cmd = Command::decode(r#"{"command":"subscribe","identifier":"x"}"#).unwrap();
        assert_eq!(cmd.kind(), Some(CommandKind::Subscribe));
    }

    #[test]
    fn test_command_rejects_garbage() {
        assert!(matches!(
            Command::decode("not json"),
            Err(CableError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_message_command_data() {
        let cmd = Command::message("id", &serde_json::json!({"action": "speak"})).unwrap();
        assert_eq!(cmd.data.as_deref(), Some(r#"{"action":"speak"}"#));
        assert_eq!(cmd.decoded_data().unwrap()["action"], "speak");
    }

    #[test]
    fn test_identifier_parse() {
        let id = ChannelIdentifier::parse(r#"{"channel":"ChatChannel","room":"1"}"#).unwrap();
        assert_eq!(id.channel, "ChatChannel");
        assert_eq!(id.param_str("room").as_deref(), Some("1"));
        assert!(id.param("channel").is_none());
    }

    #[test]
    fn test_identifier_numeric_param() {
        let id = ChannelIdentifier::parse(r#"{"channel":"ChatChannel","room":42}"#).unwrap();
        assert_eq!(id.param_str("room").as_deref(), Some("42"));
    }

    #[test]
    fn test_identifier_invalid() {
        assert!(ChannelIdentifier::parse("ChatChannel").is_err());
        assert!(ChannelIdentifier::parse(r#"["ChatChannel"]"#).is_err());
        assert!(ChannelIdentifier::parse(r#"{"room":"1"}"#).is_err());
        assert!(ChannelIdentifier::parse(r#"{"channel":""}"#).is_err());
    }
}
