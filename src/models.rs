use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::ChatError;

pub type UserId = String;
pub type ContactId = String;

/// The authenticated account. Lives as long as the session does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub credits: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastMessage {
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub avatar: Option<String>,
    pub status: ContactStatus,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
}

/// Identifier of a message inside a timeline.
///
/// Optimistic entries carry a client-generated `Local` id until the server
/// echoes them back, at which point the entry is swapped for one with a
/// `Server` id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(String),
    Server(String),
}

impl MessageId {
    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Local(id) | MessageId::Server(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Local(id) => write!(f, "local:{}", id),
            MessageId::Server(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image { uri: String },
    Audio { uri: String, duration_secs: u32 },
}

impl MessageKind {
    /// Name used for the `type` / `message_type` wire fields.
    pub fn wire_name(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image { .. } => "image",
            MessageKind::Audio { .. } => "audio",
        }
    }

    pub fn media_uri(&self) -> Option<&str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image { uri } | MessageKind::Audio { uri, .. } => Some(uri),
        }
    }

    pub fn duration_secs(&self) -> Option<u32> {
        match self {
            MessageKind::Audio { duration_secs, .. } => Some(*duration_secs),
            _ => None,
        }
    }

    /// Rebuild the kind from its wire representation. Media messages that
    /// arrive without a dedicated `media_uri` field carry the URI in `content`,
    /// which is how the backend stores uploads.
    pub fn from_wire(
        type_name: &str,
        content: &str,
        media_uri: Option<String>,
        duration: Option<u32>,
    ) -> Result<Self, ChatError> {
        match type_name {
            "" | "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image {
                uri: media_uri.unwrap_or_else(|| content.to_string()),
            }),
            "audio" => Ok(MessageKind::Audio {
                uri: media_uri.unwrap_or_else(|| content.to_string()),
                duration_secs: duration.unwrap_or(0),
            }),
            other => Err(ChatError::Protocol(format!("unknown message type '{}'", other))),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DeliveryStatus {
    Pending, // Shown locally, not yet confirmed
    Sent,    // Confirmed by the server
    Failed,  // Could not be handed to the channel
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

impl Message {
    pub fn server_id(&self) -> Option<&str> {
        match &self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Local(_) => None,
        }
    }

    /// The other party of the conversation, seen from `self_id`.
    pub fn partner_of<'a>(&'a self, self_id: &str) -> &'a str {
        if self.sender_id == self_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Short text for contact list previews.
    pub fn summary(&self) -> String {
        match &self.kind {
            MessageKind::Text => self.content.clone(),
            MessageKind::Image { .. } => "[image]".to_string(),
            MessageKind::Audio { duration_secs, .. } => format!("[audio {}s]", duration_secs),
        }
    }
}

/// User input that has not been turned into a timeline entry yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub content: String,
    pub kind: MessageKind,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Draft {
            content: content.into(),
            kind: MessageKind::Text,
        }
    }

    pub fn image(uri: impl Into<String>, caption: impl Into<String>) -> Self {
        Draft {
            content: caption.into(),
            kind: MessageKind::Image { uri: uri.into() },
        }
    }

    pub fn audio(uri: impl Into<String>, duration_secs: u32) -> Self {
        Draft {
            content: String::new(),
            kind: MessageKind::Audio {
                uri: uri.into(),
                duration_secs,
            },
        }
    }

    /// Text drafts need visible characters; media drafts carry their payload in the URI.
    pub fn is_blank(&self) -> bool {
        match &self.kind {
            MessageKind::Text => self.content.trim().is_empty(),
            MessageKind::Image { uri } | MessageKind::Audio { uri, .. } => uri.trim().is_empty(),
        }
    }
}

/// Message as served by `GET /api/messages/{id}` and the `new_message` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub sender_id: String,
    #[serde(deserialize_with = "de_id")]
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl MessageRecord {
    /// Server records are confirmed by definition.
    pub fn into_message(self) -> Result<Message, ChatError> {
        let timestamp = parse_timestamp(&self.timestamp).ok_or_else(|| {
            ChatError::Protocol(format!("invalid timestamp '{}' on message {}", self.timestamp, self.id))
        })?;
        let kind = MessageKind::from_wire(&self.message_type, &self.content, self.media_uri, self.duration)?;
        Ok(Message {
            id: MessageId::Server(self.id),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            kind,
            timestamp,
            delivery_status: DeliveryStatus::Sent,
        })
    }
}

/// Entry of `GET /api/contacts`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContactRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub online: bool,
}

impl From<ContactRecord> for Contact {
    fn from(record: ContactRecord) -> Self {
        let timestamp = record.last_message_time.as_deref().and_then(parse_timestamp);
        // The backend fills in a placeholder text when there is no history.
        let last_message = match (record.last_message, timestamp) {
            (Some(text), Some(ts)) => Some(LastMessage { text, timestamp: Some(ts) }),
            _ => None,
        };
        Contact {
            id: record.id,
            name: record.username,
            avatar: record.avatar,
            status: if record.online { ContactStatus::Online } else { ContactStatus::Offline },
            last_message,
            unread_count: record.unread_count,
        }
    }
}

/// Accepts RFC 3339 timestamps and the offset-less ISO form the backend emits.
/// Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(i64),
    Text(String),
}

/// Ids are integers on the backend but strings everywhere in the client.
pub fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(n) => n.to_string(),
        IdRepr::Text(s) => s,
    })
}
