// Realtime wire protocol
// Events are `(name, data)` pairs. Two framings carry them: plain JSON text frames
// {"event": "<name>", "data": {...}}, and Socket.IO v5 over Engine.IO v4
// (`42["<name>",{...}]`), which is what the Flask-SocketIO backend speaks.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{ChatError, ChatResult};
use crate::models::{de_id, Message, MessageRecord};

/// Frames the client writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat { contact_id: String },
    SendMessage(OutgoingMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub receiver_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    /// Temporary id of the optimistic entry; echoed back on `new_message`.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

impl OutgoingMessage {
    pub fn from_message(message: &Message) -> Self {
        OutgoingMessage {
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            message_type: message.kind.wire_name().to_string(),
            client_id: message.id.as_str().to_string(),
            media_uri: message.kind.media_uri().map(str::to_string),
            duration: message.kind.duration_secs(),
        }
    }
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {},
    JoinedRoom {
        room: String,
    },
    NewMessage(InboundMessage),
    MessageBlocked {
        message: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    Presence {
        #[serde(deserialize_with = "de_id")]
        user_id: String,
        online: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(flatten)]
    pub record: MessageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected {} => "connected",
            ServerEvent::JoinedRoom { .. } => "joined_room",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::MessageBlocked { .. } => "message_blocked",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::Error { .. } => "error",
        }
    }
}

const KNOWN_SERVER_EVENTS: &[&str] = &[
    "connected",
    "joined_room",
    "new_message",
    "message_blocked",
    "presence",
    "error",
];

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

pub fn encode(event: &ClientEvent) -> ChatResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode one server frame. Events this client does not know yield `Ok(None)`.
pub fn decode(text: &str) -> ChatResult<Option<ServerEvent>> {
    let envelope: Envelope = serde_json::from_str(text)?;
    event_from_parts(envelope.event, envelope.data)
}

fn event_from_parts(name: String, data: Value) -> ChatResult<Option<ServerEvent>> {
    if !KNOWN_SERVER_EVENTS.contains(&name.as_str()) {
        debug!("Ignoring unknown realtime event '{}'", name);
        return Ok(None);
    }
    let data = match data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let event = serde_json::from_value(serde_json::json!({ "event": name, "data": data }))?;
    Ok(Some(event))
}

/// How events are laid out in WebSocket text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Json,
    SocketIo,
}

impl FromStr for Framing {
    type Err = ChatError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Framing::Json),
            "socketio" | "socket.io" => Ok(Framing::SocketIo),
            other => Err(ChatError::Protocol(format!("unknown realtime framing '{}'", other))),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Json => f.write_str("json"),
            Framing::SocketIo => f.write_str("socketio"),
        }
    }
}

/// One decoded text frame. Only Socket.IO produces anything besides `Event` and `Ignored`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(ServerEvent),
    /// Engine.IO handshake carrying the session parameters.
    Open,
    Ping,
    /// Socket.IO namespace connect accepted.
    Accepted,
    /// Socket.IO namespace connect refused, with the server's message.
    Refused(String),
    Closed,
    Ignored,
}

impl Framing {
    pub fn encode(&self, event: &ClientEvent) -> ChatResult<String> {
        match self {
            Framing::Json => encode(event),
            Framing::SocketIo => {
                let (name, data) = match serde_json::to_value(event)? {
                    Value::Object(mut fields) => (
                        fields.remove("event").unwrap_or_default(),
                        fields.remove("data").unwrap_or_default(),
                    ),
                    other => return Err(ChatError::Protocol(format!("unexpected event shape: {}", other))),
                };
                Ok(format!("42{}", serde_json::to_string(&Value::Array(vec![name, data]))?))
            }
        }
    }

    pub fn decode(&self, text: &str) -> ChatResult<Frame> {
        match self {
            Framing::Json => Ok(decode(text)?.map(Frame::Event).unwrap_or(Frame::Ignored)),
            Framing::SocketIo => decode_socketio(text),
        }
    }
}

/// Socket.IO CONNECT packet for the default namespace, authenticating with `token`.
pub fn socketio_connect(token: &str) -> String {
    format!("40{}", serde_json::json!({ "token": token }))
}

pub const SOCKETIO_PONG: &str = "3";

fn decode_socketio(text: &str) -> ChatResult<Frame> {
    let mut chars = text.chars();
    let frame = match chars.next() {
        Some('0') => Frame::Open,
        Some('1') => Frame::Closed,
        Some('2') => Frame::Ping,
        Some('4') => {
            let packet = chars.as_str();
            match packet.chars().next() {
                Some('0') => Frame::Accepted,
                Some('1') => Frame::Closed,
                Some('2') => decode_socketio_event(&packet[1..])?,
                Some('4') => {
                    let body: Value = serde_json::from_str(&packet[1..]).unwrap_or(Value::Null);
                    let message = body["message"].as_str().unwrap_or("connection refused");
                    Frame::Refused(message.to_string())
                }
                _ => Frame::Ignored,
            }
        }
        Some(_) => Frame::Ignored,
        None => return Err(ChatError::Protocol("empty realtime frame".to_string())),
    };
    Ok(frame)
}

fn decode_socketio_event(payload: &str) -> ChatResult<Frame> {
    // An optional namespace ("/chat,") and ack id may precede the array.
    let start = payload
        .find('[')
        .ok_or_else(|| ChatError::Protocol(format!("malformed Socket.IO event: {}", payload)))?;
    let mut parts: Vec<Value> = serde_json::from_str(&payload[start..])?;
    if parts.is_empty() {
        return Err(ChatError::Protocol("Socket.IO event without a name".to_string()));
    }
    let name = match parts.remove(0) {
        Value::String(name) => name,
        other => return Err(ChatError::Protocol(format!("Socket.IO event name is not a string: {}", other))),
    };
    let data = if parts.is_empty() { Value::Null } else { parts.remove(0) };
    Ok(event_from_parts(name, data)?.map(Frame::Event).unwrap_or(Frame::Ignored))
}
